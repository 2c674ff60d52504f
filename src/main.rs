use std::{net::SocketAddr, sync::Arc};

use agent_control::config::Config;
use agent_control::db::{
    postgres_agent_config_repository::PostgresAgentConfigRepository,
    postgres_daily_usage_repository::PostgresDailyUsageRepository,
    postgres_workflow_binding_repository::PostgresWorkflowBindingRepository,
};
use agent_control::responses::JsonResponse;
use agent_control::routes;
use agent_control::services::engine::relay::HttpRelay;
use agent_control::state::{AppState, Repositories};
use agent_control::utils::encryption::CredentialCipher;
use agent_control::worker;
use anyhow::Context;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use reqwest::Client;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(config.json_logs);
    info!(?config, "configuration loaded");

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(config.rate_limit_ms)
            .burst_size(config.rate_limit_burst)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                )
                .into_response()
            })
            .finish()
            .context("invalid rate limiter settings")?,
    );

    // Drop idle clients from the limiter map.
    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || {
        let interval = std::time::Duration::from_secs(60);
        loop {
            std::thread::sleep(interval);
            governor_limiter.retain_recent();
        }
    });

    let pg_pool = establish_connection(&config.database_url).await?;
    let repos = Repositories {
        configs: Arc::new(PostgresAgentConfigRepository {
            pool: pg_pool.clone(),
        }),
        bindings: Arc::new(PostgresWorkflowBindingRepository {
            pool: pg_pool.clone(),
        }),
        daily_usage: Arc::new(PostgresDailyUsageRepository { pool: pg_pool }),
    };

    let cipher = config
        .credentials_encryption_key
        .as_deref()
        .map(CredentialCipher::from_base64)
        .transpose()
        .context("CREDENTIALS_ENCRYPTION_KEY is not a valid key")?;
    if cipher.is_none() {
        tracing::warn!("CREDENTIALS_ENCRYPTION_KEY not set, agent credentials are stored unencrypted");
    }

    let http_client = Client::new();
    let relay = HttpRelay::new(
        http_client.clone(),
        config.relay_url.clone(),
        config.relay_token.clone(),
    )
    .with_timeout(config.relay_timeout);

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .frontend_origin
                .parse::<HeaderValue>()
                .context("FRONTEND_ORIGIN is not a valid origin")?,
        )
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    let addr = config.bind_addr;
    let state = AppState::new(config, http_client, Arc::new(relay), repos, cipher);
    let state_for_worker = state.clone();

    let app = routes::app(state)
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .layer(cors);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    worker::start_background_workers(state_for_worker).await;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "agent control backend listening");
    axum::serve(listener, make_service).await?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("failed to verify database connection")?;

    info!("connected to the database");
    Ok(pool)
}
