use bill_extract::{
    app_state::AppState,
    config::AppConfig,
    db::{history, registry::PgRegistry},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const RECENT_BATCHES: i64 = 5;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting pending-image worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().expect("METRICS_ADDR is not a socket address");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        describe_metrics();
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize services");

    if let Some(pool) = &state.db {
        log_backlog(pool).await;
    }

    let interval = Duration::from_secs(config.pending_retry_interval_secs.max(1));
    tracing::info!(interval_secs = interval.as_secs(), "Worker ready, starting resubmission loop");

    loop {
        run_once(&state).await;
        sleep(interval).await;
    }
}

async fn run_once(state: &AppState) {
    let report = match state.engine.resubmit_pending().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Pending resubmission failed, will retry next cycle");
            return;
        }
    };

    if report.stats.total == 0 {
        tracing::debug!("No pending images");
        return;
    }

    if let Some(pool) = &state.db {
        if let Err(e) = history::record_batch(pool, &report).await {
            tracing::error!(batch_id = %report.batch_id, error = %e, "Failed to record extraction history");
        }
    }

    tracing::info!(
        batch_id = %report.batch_id,
        success = report.stats.success,
        failed = report.stats.failed,
        pending = report.stats.pending,
        stopped_due_to_quota = report.stats.stopped_due_to_quota,
        "Pending resubmission finished"
    );
}

/// Startup summary of what earlier runs left behind.
async fn log_backlog(pool: &PgPool) {
    match PgRegistry::new(pool.clone()).list_numbers().await {
        Ok(numbers) => tracing::info!(
            registered = numbers.len(),
            latest = numbers.first().map(String::as_str).unwrap_or("-"),
            "Consumer number registry loaded"
        ),
        Err(e) => tracing::warn!(error = %e, "Could not read consumer number registry"),
    }

    match history::recent(pool, RECENT_BATCHES).await {
        Ok(batches) => {
            for batch in batches {
                tracing::info!(
                    batch_id = %batch.batch_id,
                    recorded_at = %batch.recorded_at,
                    total = batch.total_images,
                    success = batch.success_count,
                    pending = batch.pending_count,
                    stopped_due_to_quota = batch.stopped_due_to_quota,
                    "Recent batch"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "Could not read extraction history"),
    }
}

fn describe_metrics() {
    metrics::describe_counter!(
        "bill_extract_attempts_total",
        "Recognition calls by classified outcome"
    );
    metrics::describe_counter!(
        "bill_extract_jobs_total",
        "Jobs routed, by terminal status"
    );
    metrics::describe_counter!(
        "bill_extract_duplicates_total",
        "Extracted numbers already present in the registry"
    );
    metrics::describe_histogram!(
        "bill_extract_recognition_seconds",
        "Latency of a single recognition call"
    );
}
