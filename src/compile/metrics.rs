use std::sync::atomic::{AtomicU64, Ordering};

use crate::compile::models::ErrorKind;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    rejected_total: AtomicU64,
    started_total: AtomicU64,
    succeeded_total: AtomicU64,
    failed_total: AtomicU64,
    compile_errors_total: AtomicU64,
    timed_out_total: AtomicU64,
    queue_depth: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.decrement_queue_depth();
    }

    pub fn succeeded(&self) {
        self.succeeded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self, kind: ErrorKind) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        match kind {
            ErrorKind::CompileError => {
                self.compile_errors_total.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::ExecutionTimeout => {
                self.timed_out_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE compile_jobs_submitted_total counter\n",
                "compile_jobs_submitted_total {}\n",
                "# TYPE compile_jobs_rejected_total counter\n",
                "compile_jobs_rejected_total {}\n",
                "# TYPE compile_jobs_started_total counter\n",
                "compile_jobs_started_total {}\n",
                "# TYPE compile_jobs_succeeded_total counter\n",
                "compile_jobs_succeeded_total {}\n",
                "# TYPE compile_jobs_failed_total counter\n",
                "compile_jobs_failed_total {}\n",
                "# TYPE compile_errors_total counter\n",
                "compile_errors_total {}\n",
                "# TYPE compile_execution_timeouts_total counter\n",
                "compile_execution_timeouts_total {}\n",
                "# TYPE compile_queue_depth gauge\n",
                "compile_queue_depth {}\n"
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.rejected_total.load(Ordering::Relaxed),
            self.started_total.load(Ordering::Relaxed),
            self.succeeded_total.load(Ordering::Relaxed),
            self.failed_total.load(Ordering::Relaxed),
            self.compile_errors_total.load(Ordering::Relaxed),
            self.timed_out_total.load(Ordering::Relaxed),
            self.queue_depth.load(Ordering::Relaxed),
        )
    }

    fn decrement_queue_depth(&self) {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        while current > 0 {
            match self.queue_depth.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_depth_does_not_underflow() {
        let metrics = MetricsRegistry::new();
        metrics.started();
        assert!(metrics.render_prometheus().contains("compile_queue_depth 0"));
    }

    #[test]
    fn failures_are_bucketed_by_kind() {
        let metrics = MetricsRegistry::new();
        metrics.failed(ErrorKind::CompileError);
        metrics.failed(ErrorKind::ExecutionTimeout);
        metrics.failed(ErrorKind::ArtifactMissing);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("compile_jobs_failed_total 3"));
        assert!(rendered.contains("compile_errors_total 1"));
        assert!(rendered.contains("compile_execution_timeouts_total 1"));
    }
}
