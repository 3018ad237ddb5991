use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use product_visualizer::app_state::AppState;
use product_visualizer::config::AppConfig;
use product_visualizer::models::descriptor::load_batch;
use product_visualizer::routes;
use product_visualizer::services::aggregator::{Aggregator, LogWriter};
use product_visualizer::services::dispatcher::{preflight_credits, Dispatcher};
use product_visualizer::services::provider::{Provider, ProviderClient};
use product_visualizer::services::storage::ArtifactStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env()?;

    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    metrics::describe_counter!("generation_jobs_total", "Jobs dispatched in this run");
    metrics::describe_counter!("generation_jobs_succeeded", "Jobs that produced artifacts");
    metrics::describe_counter!("generation_jobs_failed", "Jobs that ended without artifacts");
    metrics::describe_counter!("generation_polls_total", "Provider status checks issued");
    metrics::describe_histogram!(
        "generation_job_seconds",
        "Time from submission to terminal state"
    );
    metrics::describe_gauge!(
        "generation_jobs_in_flight",
        "Jobs currently held by a worker"
    );

    tracing::info!(jobs_file = %config.jobs_file.display(), "Loading batch");
    let descriptors = load_batch(&config.jobs_file).await?;

    let provider = Provider::from_config(&config)?;
    tracing::info!(
        provider = %provider.kind(),
        workers = config.effective_workers(),
        descriptors = descriptors.len(),
        "Provider ready"
    );
    preflight_credits(&provider, config.min_credits).await?;
    let provider: Arc<dyn ProviderClient> = Arc::new(provider);

    let aggregator = Arc::new(Aggregator::new(provider.name()));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, no new jobs will be started");
            let _ = cancel_tx.send(true);
        }
    });

    let (done_tx, mut done_rx) = watch::channel(false);
    let server = if config.serve_progress {
        let app = routes::router(
            AppState::new(aggregator.clone()),
            Some(prometheus_handle.clone()),
        );
        let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
        tracing::info!("Progress server listening on {}", config.bind_addr);

        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = done_rx.wait_for(|done| *done).await;
                })
                .await
        }))
    } else {
        None
    };

    let store = Arc::new(ArtifactStore::new(config.output_dir.clone()));
    let dispatcher = Dispatcher::new(provider, store, config.dispatch_settings());
    let summary = dispatcher.run(descriptors, aggregator, cancel_rx).await?;

    let log_path = LogWriter::new(config.log_dir.clone()).write(&summary).await?;

    for entry in summary.failed_entries() {
        tracing::warn!(
            job_id = %entry.job_id,
            descriptor_id = %entry.descriptor_id,
            final_state = %entry.final_state,
            error_kind = ?entry.error_kind,
            error = entry.error_message.as_deref().unwrap_or(""),
            "Job failed"
        );
    }
    tracing::info!(
        run_id = %summary.run_id,
        total = summary.total,
        succeeded = summary.succeeded_count,
        failed = summary.failed_count,
        timed_out = summary.timed_out_count,
        peak_in_flight = summary.peak_in_flight,
        log = %log_path.display(),
        "Run finished"
    );

    let _ = done_tx.send(true);
    if let Some(server) = server {
        if let Ok(Err(e)) = server.await {
            tracing::error!(error = %e, "Progress server error");
        }
    }

    Ok(())
}
