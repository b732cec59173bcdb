pub mod api;
pub mod client;
pub mod history;
pub mod launcher;
pub mod readiness;

use serde::Serialize;
use tokio::sync::watch;

use crate::{
    backend::readiness::{PollOutcome, PollStopper, ReadinessError, ReadinessPoller},
    config::BackendConfig,
};

/// What the UI is shown while it waits on the loading screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackendStatus {
    Starting,
    Ready,
    Failed { reason: String },
}

/// Starts the readiness handshake and publishes its result on `status`.
/// The returned stopper is the only way to cancel it.
pub fn spawn_readiness_monitor(
    config: &BackendConfig,
    status: watch::Sender<BackendStatus>,
) -> Result<PollStopper, ReadinessError> {
    let poller = ReadinessPoller::new(config.health_url(), config.readiness.clone())?;
    let ready_status = status.clone();
    let handle = poller.start(move || {
        ready_status.send_replace(BackendStatus::Ready);
    });
    let stopper = handle.stopper();

    tokio::spawn(async move {
        match handle.wait().await {
            PollOutcome::Ready { .. } => {}
            PollOutcome::Exhausted { attempts } => {
                status.send_replace(BackendStatus::Failed {
                    reason: format!("backend did not become healthy after {attempts} probes"),
                });
            }
            PollOutcome::Stopped { attempts } => {
                tracing::debug!(attempts, "readiness monitor finished without a result");
            }
        }
    });

    Ok(stopper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::readiness::tests::{fast_config, flaky_health_server},
        config::LaunchMode,
    };
    use std::path::PathBuf;

    fn backend_config(base_url: String, max_attempts: Option<u32>) -> BackendConfig {
        BackendConfig {
            launch: LaunchMode::Packaged {
                executable: PathBuf::from("unused"),
            },
            base_url,
            health_path: "/health".to_string(),
            readiness: fast_config(max_attempts),
        }
    }

    #[tokio::test]
    async fn publishes_ready_after_successful_probe() {
        let (base, _) = flaky_health_server(2).await;
        let (tx, mut rx) = watch::channel(BackendStatus::Starting);

        let _stopper = spawn_readiness_monitor(&backend_config(base, Some(10)), tx).unwrap();
        let status = rx
            .wait_for(|s| *s != BackendStatus::Starting)
            .await
            .unwrap()
            .clone();
        assert_eq!(status, BackendStatus::Ready);
    }

    #[tokio::test]
    async fn publishes_failure_when_attempts_run_out() {
        let (base, _) = flaky_health_server(u32::MAX).await;
        let (tx, mut rx) = watch::channel(BackendStatus::Starting);

        let _stopper = spawn_readiness_monitor(&backend_config(base, Some(2)), tx).unwrap();
        let status = rx
            .wait_for(|s| *s != BackendStatus::Starting)
            .await
            .unwrap()
            .clone();
        assert!(matches!(status, BackendStatus::Failed { reason } if reason.contains("2 probes")));
    }
}
