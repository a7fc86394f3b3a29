use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod state;

use dataset_uploader::config;
use dataset_uploader::metadata::HttpMetadataClient;
use dataset_uploader::progress::ProgressRegistry;
use dataset_uploader::scheduler::{SchedulerLimits, UploadScheduler};
use dataset_uploader::storage::S3Connector;
use dataset_uploader::task::TaskManager;
use dataset_uploader::upload::{StageExecutor, UploadRunner};
use dataset_uploader::validator::AllowListValidator;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dataset_uploader=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration / 加载配置
    let app_config = config::load_config().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    tracing::info!("Server will listen on {}", app_config.get_bind_address());

    // Create staging directory if not exists / 创建暂存目录
    let staging_dir = app_config.get_staging_dir();
    if !staging_dir.exists() {
        std::fs::create_dir_all(&staging_dir)?;
        tracing::info!("Created staging directory: {:?}", staging_dir);
    }

    let metadata = Arc::new(HttpMetadataClient::new(&app_config.metadata)?);
    let store = Arc::new(S3Connector::new(&app_config.transfer));
    let validator = Arc::new(AllowListValidator::from_config(&app_config.allowed_paths));
    let executor = StageExecutor::new(metadata, store, &app_config.transfer);
    let runner = Arc::new(UploadRunner::new(executor, validator.clone()));

    let limits = SchedulerLimits::from(&app_config.scheduler);
    tracing::info!(
        "Upload slots: {} local, {} remote (url fetch unbounded)",
        limits.max_local,
        limits.max_remote
    );
    let scheduler = UploadScheduler::new(limits, TaskManager::new(), ProgressRegistry::new(), runner);

    let state = Arc::new(AppState {
        scheduler,
        validator,
        staging_dir,
    });

    let app = Router::new()
        .route("/api/health", get(api::server::health_check))
        .route("/api/upload/local", post(api::uploads::upload_local))
        .route("/api/upload/submit", post(api::uploads::submit))
        .route("/api/upload/progress/:upload_id", get(api::progress::progress_stream))
        .route("/api/tasks", get(api::tasks::get_tasks))
        .route("/api/tasks/get", post(api::tasks::get_task))
        .route("/api/tasks/remove", post(api::tasks::remove_task))
        .route("/api/tasks/clear", post(api::tasks::clear_tasks))
        .route("/api/tasks/clear_all", post(api::tasks::clear_all_tasks))
        .route("/api/tasks/events", get(api::tasks::task_events))
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(app_config.get_bind_address()).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
