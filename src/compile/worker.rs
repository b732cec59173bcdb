use std::sync::Arc;

use tokio::sync::{Mutex, mpsc::Receiver};

use crate::compile::{
    metrics::MetricsRegistry,
    pipeline::CompilePipeline,
    queue::{JobKind, JobOutcome, QueuedJob},
};

pub fn spawn_worker_pool(
    workers: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    pipeline: Arc<CompilePipeline>,
    metrics: Arc<MetricsRegistry>,
) {
    for worker_id in 0..workers {
        let receiver = receiver.clone();
        let pipeline = pipeline.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            worker_loop(worker_id, receiver, pipeline, metrics).await;
        });
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    pipeline: Arc<CompilePipeline>,
    metrics: Arc<MetricsRegistry>,
) {
    loop {
        let job = {
            let mut locked = receiver.lock().await;
            locked.recv().await
        };
        let Some(job) = job else {
            tracing::info!(worker_id, "job queue closed, worker exiting");
            break;
        };

        tracing::info!(worker_id, job_id = %job.id, kind = ?job.kind, "starting job");
        metrics.started();

        let outcome = match job.kind {
            JobKind::CompileOnly => {
                let script = pipeline.compile_script(&job.source).await;
                match &script {
                    Ok(_) => metrics.succeeded(),
                    Err(failure) => metrics.failed(failure.kind),
                }
                JobOutcome::Script(script)
            }
            JobKind::Run => {
                let result = pipeline.run(&job.source).await;
                match result.kind() {
                    None => metrics.succeeded(),
                    Some(kind) => metrics.failed(kind),
                }
                tracing::info!(worker_id, job_id = %job.id, success = result.is_success(), "run finished");
                JobOutcome::Run(result)
            }
        };

        if job.reply.send(outcome).is_err() {
            tracing::debug!(worker_id, job_id = %job.id, "caller went away before the job finished");
        }
    }
}
