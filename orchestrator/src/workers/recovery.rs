//! Recovery worker
//!
//! Periodically sweeps tasks left in PENDING, for example after a restart
//! lost their in-memory run, and starts one run per task. It keeps no record
//! of runs in flight; the PENDING to BUILDING swap in the pipeline makes a
//! duplicate start a no-op.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::deploy::runner::TaskRunner;

/// Recovery worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,

    /// Initial delay before the first sweep
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            initial_delay: Duration::ZERO,
        }
    }
}

/// Run the recovery worker until the shutdown signal resolves
///
/// Runs already started are detached and keep going after shutdown.
pub async fn run<S, F>(
    options: &Options,
    runner: &TaskRunner,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Recovery worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Recovery worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Recovery worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        debug!("Sweeping pending tasks...");
        match runner.sweep().await {
            Ok(handles) => {
                if !handles.is_empty() {
                    debug!("Started {} runs", handles.len());
                }
            }
            Err(e) => {
                error!("Pending task sweep failed: {}", e);
            }
        }
    }
}
