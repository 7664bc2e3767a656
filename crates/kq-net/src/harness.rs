//! RPC server harness: health flag, graceful shutdown with a deadline, and
//! named telemetry events, reimplemented with `tokio::select!` in place of
//! goroutines and channels.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::rpc::protocol::RpcError;

/// Named telemetry events, mirrored from the reference server's event
/// constants so dashboards built against that naming still line up.
pub mod events {
    pub const SERVER_STARTED: &str = "server_started";
    pub const SERVER_LISTEN_FAILED: &str = "server_listen_failed";
    pub const SERVER_STOPPING: &str = "server_stopping";
    pub const SERVER_STOPPED_GRACEFULLY: &str = "server_stopped_gracefully";
    pub const SERVER_STOP_TIMEOUT: &str = "server_stop_timeout";
    pub const REQUEST_TIMEOUT: &str = "request_timeout";
}

/// Shared serving flag, flipped once the listener is bound and cleared
/// before shutdown; a health RPC or `/healthz` handler reads this.
#[derive(Clone, Default)]
pub struct Health {
    serving: Arc<AtomicBool>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }
}

/// Runs `serve` to completion unless `shutdown` resolves first, then gives
/// `serve` up to `grace` to wind down before giving up on it.
///
/// `serve` for our tarpc listener loops never resolves on their own (the
/// TCP accept stream runs until the process exits), so in practice this
/// always returns once `shutdown` fires.
pub async fn run_with_shutdown<S, D>(
    name: &str,
    health: Health,
    serve: S,
    shutdown: D,
    grace: Duration,
) where
    S: Future<Output = ()>,
    D: Future<Output = ()>,
{
    health.set_serving(true);
    info!(server = name, event = events::SERVER_STARTED, "server started");

    tokio::pin!(serve);
    tokio::select! {
        _ = &mut serve => {
            health.set_serving(false);
        }
        _ = shutdown => {
            info!(server = name, event = events::SERVER_STOPPING, "stopping server");
            health.set_serving(false);
            match tokio::time::timeout(grace, &mut serve).await {
                Ok(()) => {
                    info!(server = name, event = events::SERVER_STOPPED_GRACEFULLY, "stopped gracefully");
                }
                Err(_) => {
                    warn!(server = name, event = events::SERVER_STOP_TIMEOUT, "graceful stop timed out");
                }
            }
        }
    }
}

/// Races `future` against `timeout`, logging a named telemetry event and
/// returning `RpcError::DeadlineExceeded` if the deadline wins, distinct
/// from a downstream `DependencyFailure` so callers can tell "this call
/// timed out" apart from "a dependency failed".
pub async fn with_timeout<F, T>(method: &str, timeout: Duration, future: F) -> Result<T, RpcError>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => Ok(value),
        Err(_) => {
            error!(method, event = events::REQUEST_TIMEOUT, "request timed out");
            Err(RpcError::DeadlineExceeded(format!(
                "{method} timed out after {:?}",
                timeout
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_flag_toggles_around_run_with_shutdown() {
        let health = Health::new();
        assert!(!health.is_serving());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let health_clone = health.clone();
        let handle = tokio::spawn(async move {
            run_with_shutdown(
                "test",
                health_clone,
                std::future::pending::<()>(),
                async move {
                    let _ = rx.await;
                },
                Duration::from_millis(100),
            )
            .await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(health.is_serving());

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(!health.is_serving());
    }

    #[tokio::test]
    async fn with_timeout_returns_deadline_exceeded_on_timeout() {
        let result: Result<(), RpcError> =
            with_timeout("slow_op", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
            .await;
        assert!(matches!(result, Err(RpcError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn with_timeout_returns_value_when_fast_enough() {
        let result = with_timeout("fast_op", Duration::from_millis(100), async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
