use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use inferq_ai::{AiInvoker, ScriptedInvoker};
use inferq_api::HttpInvoker;
use inferq_infra::jobs::WorkerPool;
use inferq_infra::{Pipeline, PipelineConfig};
use inferq_observability::alerts::DEFAULT_ALERT_CAPACITY;
use inferq_observability::{AlertDispatcher, LogAlertSink};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    inferq_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;

    let invoker: Arc<dyn AiInvoker> = match std::env::var("INFERQ_AI_ENDPOINT") {
        Ok(endpoint) if !endpoint.trim().is_empty() => Arc::new(
            HttpInvoker::new(endpoint, config.worker.call_timeout)
                .context("failed to build AI client")?,
        ),
        _ => {
            tracing::warn!("INFERQ_AI_ENDPOINT not set; using scripted dev invoker");
            Arc::new(ScriptedInvoker::new())
        }
    };

    let (alerts, _alert_task) = AlertDispatcher::spawn(Arc::new(LogAlertSink), DEFAULT_ALERT_CAPACITY);
    let pipeline = Arc::new(
        Pipeline::builder(config, invoker)
            .alerts(alerts)
            .build()
            .context("failed to build pipeline")?,
    );

    let workers = WorkerPool::spawn(pipeline.clone());
    let purger = tokio::spawn(purge_expired(pipeline.clone()));

    let bind_addr = std::env::var("INFERQ_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, inferq_api::build_app(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    purger.abort();
    let stats = workers.shutdown().await;
    tracing::info!(?stats, "workers stopped");
    Ok(())
}

async fn purge_expired(pipeline: Arc<Pipeline>) {
    let mut tick = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tick.tick().await;
        if let Err(e) = pipeline.purge_expired_dead_letters() {
            tracing::warn!(error = %e, "dead letter purge failed");
        }
        if let Err(e) = pipeline.purge_finished_jobs() {
            tracing::warn!(error = %e, "finished job purge failed");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
