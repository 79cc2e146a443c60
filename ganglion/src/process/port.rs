//! Port allocation
//!
//! Ports are handed out with allocate-then-verify-bind semantics: a port is
//! only considered consumed after the OS accepted a bind on it, and the
//! reservation is recorded under the same lock, so two concurrent spawns can
//! never receive the same port.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::TcpListener;
use tracing::{debug, warn};

use crate::config::{PortRange, SupervisorConfig};
use crate::error::{Error, Result};

/// Allocator for a fixed TCP port range
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    host: String,
    max_attempts: usize,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    reserved: BTreeSet<u16>,
    cursor: u16,
}

impl PortAllocator {
    /// Create an allocator binding probes on `host`
    pub fn new(range: PortRange, host: impl Into<String>, max_attempts: usize) -> Self {
        Self {
            range,
            host: host.into(),
            max_attempts: max_attempts.max(1),
            state: Mutex::new(AllocatorState {
                reserved: BTreeSet::new(),
                cursor: range.start,
            }),
        }
    }

    /// Allocator over a supervisor's configured range and host
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.port_range, config.host.clone(), config.port_attempts)
    }

    /// Reserve a free port.
    ///
    /// Ports already reserved are skipped without a bind attempt. Fails with
    /// [`Error::PortAllocation`] once `max_attempts` binds have failed or the
    /// whole range has been scanned.
    pub fn allocate(&self) -> Result<u16> {
        let mut state = self.state.lock();
        let span = self.range.len();
        let mut attempts = 0usize;

        for offset in 0..span {
            if attempts >= self.max_attempts {
                break;
            }
            let port = self.nth_from(state.cursor, offset);
            if state.reserved.contains(&port) {
                continue;
            }

            attempts += 1;
            match TcpListener::bind((self.host.as_str(), port)) {
                Ok(listener) => {
                    drop(listener);
                    state.reserved.insert(port);
                    state.cursor = self.nth_from(port, 1);
                    debug!("Allocated port {}", port);
                    return Ok(port);
                }
                Err(e) => {
                    debug!("Port {} unavailable: {}", port, e);
                }
            }
        }

        warn!(
            "Port allocation exhausted in {}-{} after {} attempts",
            self.range.start, self.range.end, attempts
        );
        Err(Error::PortAllocation {
            start: self.range.start,
            end: self.range.end,
            attempts,
        })
    }

    /// Release a reservation. Returns `false` if the port was not reserved.
    pub fn release(&self, port: u16) -> bool {
        let released = self.state.lock().reserved.remove(&port);
        if released {
            debug!("Released port {}", port);
        }
        released
    }

    /// Whether `port` is currently reserved
    pub fn is_reserved(&self, port: u16) -> bool {
        self.state.lock().reserved.contains(&port)
    }

    /// Currently reserved ports, ascending
    pub fn reserved(&self) -> Vec<u16> {
        self.state.lock().reserved.iter().copied().collect()
    }

    /// Configured range
    pub fn range(&self) -> PortRange {
        self.range
    }

    fn nth_from(&self, from: u16, offset: usize) -> u16 {
        let span = self.range.len();
        let base = from.saturating_sub(self.range.start) as usize;
        self.range.start + ((base + offset) % span) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_single_port_range_exhausts() {
        let port = free_port();
        let allocator = PortAllocator::new(PortRange::new(port, port), "127.0.0.1", 4);

        assert_eq!(allocator.allocate().unwrap(), port);
        let err = allocator.allocate().unwrap_err();
        assert!(matches!(err, Error::PortAllocation { .. }));

        assert!(allocator.release(port));
        assert_eq!(allocator.allocate().unwrap(), port);
    }

    #[test]
    fn test_occupied_port_is_skipped() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let allocator = PortAllocator::new(PortRange::new(port, port), "127.0.0.1", 4);

        let err = allocator.allocate().unwrap_err();
        assert!(matches!(err, Error::PortAllocation { attempts: 1, .. }));
        assert!(!allocator.is_reserved(port));
    }

    #[test]
    fn test_double_release_is_reported() {
        let port = free_port();
        let allocator = PortAllocator::new(PortRange::new(port, port), "127.0.0.1", 1);
        allocator.allocate().unwrap();

        assert!(allocator.release(port));
        assert!(!allocator.release(port));
        assert!(allocator.reserved().is_empty());
    }

    #[test]
    fn test_allocations_are_unique() {
        let start = free_port().min(u16::MAX - 16);
        let allocator = PortAllocator::new(PortRange::new(start, start + 15), "127.0.0.1", 16);

        let mut seen = BTreeSet::new();
        while let Ok(port) = allocator.allocate() {
            assert!(seen.insert(port), "port {} handed out twice", port);
        }
        assert_eq!(seen.len(), allocator.reserved().len());
    }
}
