use bill_extract::{app_state::AppState, config::AppConfig, db::history, intake};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize services");

    let files = intake::load_dir(&config.image_dir)
        .await
        .expect("Failed to read image directory");
    if files.is_empty() {
        tracing::info!(dir = %config.image_dir.display(), "No images to process");
    }

    let (paths, inputs) = intake::split(files);
    let report = state.engine.run_batch(inputs).await;

    if let Some(pool) = &state.db {
        if let Err(e) = history::record_batch(pool, &report).await {
            tracing::error!(batch_id = %report.batch_id, error = %e, "Failed to record extraction history");
        }
    }

    for path in intake::routed_paths(&paths, &report) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(file = %path.display(), error = %e, "Failed to remove processed input");
        }
    }

    let json = serde_json::to_string_pretty(&report).expect("Failed to serialize report");
    println!("{json}");

    if report.stats.stopped_due_to_quota {
        tracing::warn!(
            pending = report.stats.pending,
            "Quota exhausted; pending images will be retried by the worker"
        );
    }
}
