use assessment_backend::{
    build_router,
    config::{get_config, init_config, StoreBackend},
    database::pool::{create_pool, run_migrations},
    error::Error,
    services::{
        grading_service::GradingService,
        judge_client::Judge0Client,
        pg_submission_store::PgSubmissionStore,
        recording_service::{NoopRecordingSink, RecordingSink, WebhookRecordingSink},
        session_service::SessionDeps,
        submission_store::{InMemoryStore, SubmissionStore},
    },
    utils::clock::SystemClock,
    AppState,
};
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const REAP_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    init_config()?;
    let config = get_config()?;

    let store: Arc<dyn SubmissionStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| Error::Config("DATABASE_URL is required".to_string()))?;
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            Arc::new(PgSubmissionStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; submissions are lost on restart");
            Arc::new(InMemoryStore::new())
        }
    };

    let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    let judge = Judge0Client::new(
        http_client.clone(),
        config.judge_base_url.clone(),
        config.judge_api_key.clone(),
    );
    let recorder: Arc<dyn RecordingSink> = match &config.recording_webhook_url {
        Some(url) => Arc::new(WebhookRecordingSink::new(http_client, url.clone())),
        None => Arc::new(NoopRecordingSink),
    };

    let deps = SessionDeps {
        store,
        grading: GradingService::new(Arc::new(judge), config.poll_policy()),
        recorder,
        clock: Arc::new(SystemClock),
        policy: config.monitor_policy(),
    };
    let state = AppState::new(deps);
    state.sessions.spawn_reaper(REAP_INTERVAL);

    let app = build_router(state);

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
