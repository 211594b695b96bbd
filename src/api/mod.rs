use crate::{
    api::handlers::health,
    cli::globals::GlobalArgs,
    guard::{
        Fingerprinter, PgLedger, SystemClock, ThrottlePolicy,
        sweeper::{SweeperConfig, spawn_sweeper},
    },
    vault,
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

pub mod handlers;

/// Engine settings for the server process.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    policy: ThrottlePolicy,
    sweeper: SweeperConfig,
    salt_refresh: Duration,
    kv_mount: String,
    kv_path: String,
}

impl GuardConfig {
    #[must_use]
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            sweeper: SweeperConfig::new(),
            salt_refresh: Duration::from_secs(300),
            kv_mount: "secret/authguard".to_string(),
            kv_path: "config".to_string(),
        }
    }

    #[must_use]
    pub fn with_sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.sweeper = self.sweeper.with_interval_seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_salt_refresh_seconds(mut self, seconds: u64) -> Self {
        self.salt_refresh = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_kv_mount(mut self, mount: String) -> Self {
        self.kv_mount = mount;
        self
    }

    #[must_use]
    pub fn with_kv_path(mut self, path: String) -> Self {
        self.kv_path = path;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    #[must_use]
    pub fn sweeper(&self) -> SweeperConfig {
        self.sweeper
    }

    #[must_use]
    pub fn salt_refresh(&self) -> Duration {
        self.salt_refresh
    }

    #[must_use]
    pub fn kv_mount(&self) -> &str {
        &self.kv_mount
    }

    #[must_use]
    pub fn kv_path(&self) -> &str {
        &self.kv_path
    }
}

/// Health routes plus request id and tracing layers.
pub fn router(pool: sqlx::PgPool, fingerprinter: Arc<Fingerprinter>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(fingerprinter))
                .layer(Extension(pool)),
        )
}

/// Start the server
///
/// With Vault `globals`, the token and DB lease are renewed in the background and
/// the fingerprint salt is re-read every `salt_refresh`; a renewal that gives up
/// shuts the server down.
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    globals: Option<&GlobalArgs>,
    fingerprinter: Arc<Fingerprinter>,
    config: GuardConfig,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    if let Some(globals) = globals {
        vault::renew::try_renew(globals, tx.clone());
        vault::kv::spawn_salt_refresher(
            globals.clone(),
            fingerprinter.clone(),
            config.kv_mount().to_string(),
            config.kv_path().to_string(),
            config.salt_refresh(),
        );
    }

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let ledger = PgLedger::new(pool.clone());
    ledger
        .apply_schema()
        .await
        .context("Failed to prepare ledger tables")?;

    spawn_sweeper(
        Arc::new(ledger),
        Arc::new(config.policy().clone()),
        Arc::new(SystemClock),
        config.sweeper(),
    );

    let app = router(pool, fingerprinter);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = rx.recv() => info!("Vault renewal gave up, shutting down"),
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
            }
            // keep the sender alive while serving without Vault
            drop(tx);
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
