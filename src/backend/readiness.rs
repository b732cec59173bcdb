use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::config::ReadinessConfig;

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("failed to build health probe client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadinessState {
    pub ready: bool,
    pub attempts_used: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32 },
    Stopped { attempts: u32 },
}

/// Probes a health endpoint on a fixed interval until it answers 2xx.
pub struct ReadinessPoller {
    client: reqwest::Client,
    url: String,
    config: ReadinessConfig,
}

/// Stops a running poll loop. Cheap to clone; stopping twice is harmless.
#[derive(Clone)]
pub struct PollStopper {
    notify: Arc<Notify>,
}

impl PollStopper {
    pub fn stop(&self) {
        self.notify.notify_one();
    }
}

pub struct PollHandle {
    stopper: PollStopper,
    state: watch::Receiver<ReadinessState>,
    task: JoinHandle<PollOutcome>,
}

impl PollHandle {
    #[cfg(test)]
    pub fn stop(&self) {
        self.stopper.stop();
    }

    pub fn stopper(&self) -> PollStopper {
        self.stopper.clone()
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.borrow()
    }

    pub async fn wait(self) -> PollOutcome {
        let last = self.state();
        self.task.await.unwrap_or(PollOutcome::Stopped {
            attempts: last.attempts_used,
        })
    }
}

impl ReadinessPoller {
    pub fn new(url: impl Into<String>, config: ReadinessConfig) -> Result<Self, ReadinessError> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            config,
        })
    }

    /// `on_ready` runs at most once, on the first successful probe; no probe
    /// is issued after it.
    pub fn start<F>(self, on_ready: F) -> PollHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let stopper = PollStopper {
            notify: Arc::new(Notify::new()),
        };
        let (state_tx, state_rx) = watch::channel(ReadinessState::default());
        let notify = stopper.notify.clone();
        let task = tokio::spawn(async move { self.poll_loop(on_ready, notify, state_tx).await });

        PollHandle {
            stopper,
            state: state_rx,
            task,
        }
    }

    async fn poll_loop<F>(
        self,
        on_ready: F,
        stop: Arc<Notify>,
        state: watch::Sender<ReadinessState>,
    ) -> PollOutcome
    where
        F: FnOnce() + Send + 'static,
    {
        let mut on_ready = Some(on_ready);
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                _ = stop.notified() => {
                    tracing::info!(attempts, "readiness polling stopped");
                    return PollOutcome::Stopped { attempts };
                }
                _ = ticker.tick() => {}
            }

            attempts += 1;
            let healthy = tokio::select! {
                _ = stop.notified() => {
                    tracing::info!(attempts, "readiness polling stopped");
                    return PollOutcome::Stopped { attempts };
                }
                healthy = self.probe(attempts) => healthy,
            };
            state.send_replace(ReadinessState {
                ready: healthy,
                attempts_used: attempts,
            });

            if healthy {
                tracing::info!(attempts, url = %self.url, "backend is ready");
                if let Some(callback) = on_ready.take() {
                    callback();
                }
                return PollOutcome::Ready { attempts };
            }

            if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                tracing::warn!(attempts, url = %self.url, "backend never became ready");
                return PollOutcome::Exhausted { attempts };
            }
        }
    }

    async fn probe(&self, attempt: u32) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(attempt, status = response.status().as_u16(), "health probe not ready");
                false
            }
            Err(err) => {
                tracing::debug!(attempt, error = %err, "health probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    /// Serves `/health`, answering 503 for the first `failures` hits.
    pub(crate) async fn flaky_health_server(failures: u32) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/health",
            get(move || {
                let counter = counter.clone();
                async move {
                    let hit = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if hit > failures {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), hits)
    }

    pub(crate) fn fast_config(max_attempts: Option<u32>) -> ReadinessConfig {
        ReadinessConfig {
            interval: Duration::from_millis(10),
            max_attempts,
            probe_timeout: Duration::from_millis(500),
        }
    }

    fn counting_callback() -> (Arc<AtomicU32>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        (fired, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn fires_once_after_sixth_probe() {
        let (base, hits) = flaky_health_server(5).await;
        let (fired, on_ready) = counting_callback();

        let handle = ReadinessPoller::new(format!("{base}/health"), fast_config(Some(60)))
            .unwrap()
            .start(on_ready);
        let outcome = handle.wait().await;

        assert_eq!(outcome, PollOutcome::Ready { attempts: 6 });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn healthy_backend_fires_exactly_once() {
        let (base, hits) = flaky_health_server(0).await;
        let (fired, on_ready) = counting_callback();

        let handle = ReadinessPoller::new(format!("{base}/health"), fast_config(None))
            .unwrap()
            .start(on_ready);
        assert_eq!(handle.wait().await, PollOutcome::Ready { attempts: 1 });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_polling_gives_up() {
        let (base, hits) = flaky_health_server(u32::MAX).await;
        let (fired, on_ready) = counting_callback();

        let handle = ReadinessPoller::new(format!("{base}/health"), fast_config(Some(3)))
            .unwrap()
            .start(on_ready);
        assert_eq!(handle.wait().await, PollOutcome::Exhausted { attempts: 3 });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connection_refused_is_retried() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = ReadinessPoller::new(format!("http://{addr}/health"), fast_config(Some(2)))
            .unwrap()
            .start(|| {});
        assert_eq!(handle.wait().await, PollOutcome::Exhausted { attempts: 2 });
    }

    #[tokio::test]
    async fn stop_ends_unbounded_polling() {
        let (base, _hits) = flaky_health_server(u32::MAX).await;
        let (fired, on_ready) = counting_callback();

        let handle = ReadinessPoller::new(format!("{base}/health"), fast_config(None))
            .unwrap()
            .start(on_ready);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();

        let outcome = handle.wait().await;
        assert!(matches!(outcome, PollOutcome::Stopped { .. }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
