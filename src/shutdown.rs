//! Graceful shutdown for the worker process.
//!
//! Listening for signals is kept apart from the shutdown sequence itself so
//! the sequence can be driven by any future in tests.

use crate::{Result, service::QueueService};
use std::future::Future;
use tracing::{info, warn};

/// Resolve on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
pub async fn signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}

/// Stop accepting work, drain in-flight jobs, close the broker connection.
pub async fn graceful_shutdown<S: QueueService>(service: &S) -> Result<()> {
    info!("Shutting down gracefully");
    service.close().await?;
    info!("Shutdown complete");
    Ok(())
}

/// Wait for `trigger`, then run [`graceful_shutdown`].
pub async fn run_until<S, F>(service: &S, trigger: F) -> Result<()>
where
    S: QueueService,
    F: Future<Output = ()>,
{
    trigger.await;
    graceful_shutdown(service).await
}
