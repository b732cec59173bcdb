use std::sync::Arc;

use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender, error::TrySendError},
    oneshot,
};
use uuid::Uuid;

use crate::compile::{
    metrics::MetricsRegistry,
    models::{CompileFailure, CompileResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Compile only; reply with the loader script.
    CompileOnly,
    /// Compile and execute in the sandbox.
    Run,
}

#[derive(Debug)]
pub enum JobOutcome {
    Script(Result<String, CompileFailure>),
    Run(CompileResult),
}

#[derive(Debug)]
pub struct QueuedJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub source: String,
    pub reply: oneshot::Sender<JobOutcome>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("queue is full")]
    QueueFull,
    #[error("worker pool stopped")]
    Closed,
}

/// Bounded admission queue in front of the worker pool. Submissions never
/// wait for space: a full queue is reported to the caller immediately.
#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<QueuedJob>,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    pub fn new(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            metrics,
        }
    }

    pub fn submit(
        &self,
        kind: JobKind,
        source: String,
    ) -> Result<oneshot::Receiver<JobOutcome>, SubmitError> {
        let (reply, rx) = oneshot::channel();
        let job = QueuedJob {
            id: Uuid::new_v4(),
            kind,
            source,
            reply,
        };
        let id = job.id;
        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => {
                self.metrics.rejected();
                SubmitError::QueueFull
            }
            TrySendError::Closed(_) => SubmitError::Closed,
        })?;
        self.metrics.submitted();
        tracing::debug!(job_id = %id, ?kind, "job queued");
        Ok(rx)
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<QueuedJob>>> {
        self.receiver.clone()
    }
}
