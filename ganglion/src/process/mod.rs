//! Worker process supervision
//!
//! - [`PortAllocator`]: free ports from a fixed range
//! - [`Supervisor`]: spawn, exec, kill and observe worker processes
//! - [`OutputBuffer`]: bounded capture of worker stdout/stderr

pub mod output;
pub mod port;
pub mod supervisor;
pub mod worker;

pub use output::{OutputBuffer, OutputLine, OutputStream};
pub use port::PortAllocator;
pub use supervisor::{
    ExecCommand, ExecResult, OutputLineStream, SpawnConfig, Supervisor, SupervisorStats,
    render_args,
};
pub use worker::{ExitInfo, ProcessState, WorkerInfo, WorkerProcess};

/// Resolve once SIGINT or (on unix) SIGTERM arrives
pub async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
