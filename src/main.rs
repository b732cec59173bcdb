mod backend;
mod compile;
mod config;
mod error;

use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

use crate::{
    backend::{
        BackendStatus,
        client::BackendClient,
        history::{ChatHistory, HISTORY_CAPACITY},
        launcher::ServerLauncher,
    },
    compile::{
        metrics::MetricsRegistry, pipeline::CompilePipeline, queue::Scheduler,
        worker::spawn_worker_pool,
    },
    config::{HostConfig, LogFormat},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = HostConfig::from_env().context("failed to build host config")?;
    init_tracing(&cfg);

    if let Err(reason) = &cfg.compile.toolchain {
        tracing::error!(%reason, "toolchain unresolved; compile requests will be refused");
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let scheduler = Scheduler::new(cfg.compile.queue_capacity, metrics.clone());
    let pipeline = Arc::new(CompilePipeline::from_config(&cfg.compile));
    spawn_worker_pool(
        cfg.compile.worker_count,
        scheduler.receiver(),
        pipeline.clone(),
        metrics.clone(),
    );

    let (status_tx, status_rx) = watch::channel(BackendStatus::Starting);
    let server = match ServerLauncher::new(cfg.backend.launch.clone()).start() {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "backend launch failed");
            status_tx.send_replace(BackendStatus::Failed {
                reason: err.to_string(),
            });
            None
        }
    };

    let poll = if matches!(*status_tx.borrow(), BackendStatus::Failed { .. }) {
        None
    } else {
        Some(
            backend::spawn_readiness_monitor(&cfg.backend, status_tx.clone())
                .context("readiness monitor init failed")?,
        )
    };

    let client = BackendClient::new(&cfg.backend).context("backend client init failed")?;
    let app = compile::api::routes(pipeline, scheduler, metrics)
        .merge(backend::api::routes(
            status_rx,
            client,
            ChatHistory::new(HISTORY_CAPACITY),
        ));

    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .context("failed to bind listener")?;
    tracing::info!(addr = %cfg.bind_addr, "eduapp host listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("host server error");

    if let Some(poll) = poll {
        poll.stop();
    }
    if let Some(server) = server {
        server.terminate().await;
    }
    served
}

fn init_tracing(cfg: &HostConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,reqwest=warn", cfg.log_level)));

    match cfg.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}
