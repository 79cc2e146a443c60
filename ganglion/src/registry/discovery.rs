//! Instance discovery sources
//!
//! A source produces the full list of instances it currently knows about.
//! The registry reconciles that list against what it already holds for the
//! source's origin.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::instance::{InstanceOrigin, InstanceSpec};
use crate::config::StaticInstance;
use crate::error::{Error, Result};
use crate::types::InstanceId;

/// Something that lists worker endpoints
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Short label used in logs and reports
    fn name(&self) -> &str;

    /// Origin assigned to everything this source reports
    fn origin(&self) -> InstanceOrigin;

    async fn discover(&self) -> Result<Vec<InstanceSpec>>;
}

/// Outcome of one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub added: Vec<InstanceId>,
    pub updated: Vec<InstanceId>,
    pub removed: Vec<InstanceId>,
    /// `source: error` for every source that failed
    pub errors: Vec<String>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Instances listed in configuration
#[derive(Debug, Clone)]
pub struct StaticSource {
    instances: Vec<StaticInstance>,
}

impl StaticSource {
    pub fn new(instances: Vec<StaticInstance>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    fn origin(&self) -> InstanceOrigin {
        InstanceOrigin::Static
    }

    async fn discover(&self) -> Result<Vec<InstanceSpec>> {
        Ok(self
            .instances
            .iter()
            .map(|s| {
                let mut spec = InstanceSpec::new(s.endpoint.clone())
                    .with_id(s.id.as_str())
                    .with_capabilities(s.capabilities.clone());
                spec.model = s.model.clone();
                spec
            })
            .collect())
    }
}

/// Entry as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
struct GatewayEntry {
    #[serde(default)]
    id: Option<String>,
    endpoint: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GatewayListing {
    Bare(Vec<GatewayEntry>),
    Wrapped { instances: Vec<GatewayEntry> },
}

/// Instances listed by an HTTP gateway
#[derive(Debug, Clone)]
pub struct GatewaySource {
    url: String,
    timeout: Duration,
    http: HttpClient,
}

impl GatewaySource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Cannot build gateway client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            timeout,
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn connection_error(&self, reason: impl ToString) -> Error {
        Error::Connection {
            endpoint: self.url.clone(),
            attempts: 1,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl DiscoverySource for GatewaySource {
    fn name(&self) -> &str {
        "gateway"
    }

    fn origin(&self) -> InstanceOrigin {
        InstanceOrigin::Discovered
    }

    async fn discover(&self) -> Result<Vec<InstanceSpec>> {
        debug!("Querying gateway {}", self.url);

        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("gateway query {}", self.url), self.timeout)
                } else {
                    self.connection_error(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.connection_error(format!("HTTP {}", status)));
        }

        let body = response.text().await.map_err(|e| self.connection_error(e))?;
        let entries = parse_listing(&body)?;

        Ok(entries
            .into_iter()
            .map(|e| {
                let mut spec = InstanceSpec::new(e.endpoint)
                    .with_origin(InstanceOrigin::Discovered)
                    .with_capabilities(e.capabilities);
                spec.id = e.id.map(InstanceId::new);
                spec.model = e.model;
                spec
            })
            .collect())
    }
}

fn parse_listing(body: &str) -> Result<Vec<GatewayEntry>> {
    let listing: GatewayListing = serde_json::from_str(body)
        .map_err(|e| Error::Protocol(format!("Invalid gateway listing: {}", e)))?;
    Ok(match listing {
        GatewayListing::Bare(entries) => entries,
        GatewayListing::Wrapped { instances } => instances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_both_listing_shapes() {
        let bare = parse_listing(r#"[{"endpoint": "tcp://10.0.0.1:9100"}]"#).unwrap();
        assert_eq!(bare.len(), 1);

        let wrapped = parse_listing(
            r#"{"instances": [
                {"id": "w1", "endpoint": "tcp://10.0.0.1:9100", "model": "sonnet"},
                {"endpoint": "tcp://10.0.0.2:9100", "capabilities": ["code"]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped[0].id.as_deref(), Some("w1"));
        assert_eq!(wrapped[1].capabilities, vec!["code".to_string()]);

        assert!(matches!(parse_listing("{}"), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_static_source_keeps_configured_ids() {
        let source = StaticSource::new(vec![StaticInstance {
            id: "alpha".into(),
            endpoint: "tcp://127.0.0.1:9100".into(),
            model: Some("sonnet".into()),
            capabilities: vec!["code".into()],
        }]);

        let specs = source.discover().await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].instance_id().as_str(), "alpha");
        assert_eq!(specs[0].origin, InstanceOrigin::Static);
        assert_eq!(specs[0].model.as_deref(), Some("sonnet"));
    }

    /// Answer a single HTTP request with `body`
    async fn one_shot_gateway(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{}/instances", addr)
    }

    #[tokio::test]
    async fn test_gateway_source_marks_discovered() {
        let url = one_shot_gateway(r#"[{"endpoint": "tcp://10.1.1.1:9100", "model": "haiku"}]"#).await;
        let source = GatewaySource::new(url, Duration::from_secs(2)).unwrap();

        let specs = source.discover().await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].origin, InstanceOrigin::Discovered);
        assert_eq!(specs[0].instance_id().as_str(), "tcp://10.1.1.1:9100");
    }

    #[tokio::test]
    async fn test_gateway_unreachable_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source =
            GatewaySource::new(format!("http://{}/instances", addr), Duration::from_secs(1)).unwrap();
        let err = source.discover().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
    }
}
