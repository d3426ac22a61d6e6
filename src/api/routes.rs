//! HTTP router, shared state and server lifecycle.

use std::sync::Arc;

use axum::middleware;
use axum::{
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::account::{AccountStore, ChannelStore};
use crate::billing::{PricingStore, SharedPricingStore};
use crate::config::Config;
use crate::provider::AdaptorRegistry;
use crate::relay::{Reconciler, Submitter, Sweeper};
use crate::storage::Database;
use crate::task::TaskStore;

use super::admin;
use super::auth;
use super::videos;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub accounts: AccountStore,
    pub channels: ChannelStore,
    pub tasks: TaskStore,
    /// Price tables, replaced only through the admin API.
    pub pricing: SharedPricingStore,
    pub registry: Arc<AdaptorRegistry>,
    pub submitter: Submitter,
    /// Shared with the background sweeper.
    pub reconciler: Reconciler,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Database,
        registry: Arc<AdaptorRegistry>,
        pricing: SharedPricingStore,
    ) -> Self {
        let tasks = TaskStore::new(db.clone());
        let channels = ChannelStore::new(db.clone());
        let submitter = Submitter::new(
            tasks.clone(),
            channels.clone(),
            Arc::clone(&registry),
            Arc::clone(&pricing),
        );
        let reconciler = Reconciler::new(
            tasks.clone(),
            channels.clone(),
            Arc::clone(&registry),
            Arc::clone(&pricing),
            config.task_timeout,
        );
        Self {
            accounts: AccountStore::new(db.clone()),
            config,
            db,
            channels,
            tasks,
            pricing,
            registry,
            submitter,
            reconciler,
        }
    }
}

/// Build the full router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login));

    let relay_routes = Router::new()
        .route("/v1/video/generations", post(videos::submit_generation))
        .route("/v1/video/generations/:task_id", get(videos::fetch_generation))
        .route("/v1/video/fetch", post(videos::fetch_batch))
        .route("/v1/videos", post(videos::submit_video))
        .route("/v1/videos/edits", post(videos::submit_edit))
        .route("/v1/videos/:video_id", get(videos::fetch_video))
        .route("/v1/videos/:video_id/remix", post(videos::submit_remix))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_token,
        ));

    let admin_routes = Router::new()
        .route("/api/admin/pricing", get(admin::get_pricing))
        .route("/api/admin/pricing", put(admin::put_pricing))
        .route("/api/admin/channels", post(admin::create_channel))
        .route("/api/admin/channels/:id/status", post(admin::set_channel_status))
        .route("/api/admin/users", post(admin::create_user))
        .route("/api/admin/users/:id/topup", post(admin::top_up_user))
        .route("/api/admin/tokens", post(admin::create_token))
        .route("/api/admin/logs", get(admin::list_logs))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_admin,
        ));

    Router::new()
        .merge(public_routes)
        .merge(relay_routes)
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and the reconciliation sweeper.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let db = Database::open(&config.database_path)?;
    tracing::info!("Opened database at {}", config.database_path.display());

    let pricing = Arc::new(PricingStore::new(config.pricing_path()).await);
    let registry = Arc::new(AdaptorRegistry::with_defaults(config.upstream_timeout)?);

    if config.admin.is_none() {
        tracing::warn!("ADMIN_PASSWORD not set; admin routes are disabled");
    }
    match config.task_timeout_minutes() {
        Some(minutes) => tracing::info!("Unfinished tasks time out after {} minute(s)", minutes),
        None => tracing::info!("Task timeout disabled"),
    }

    let state = Arc::new(AppState::new(config.clone(), db, registry, pricing));

    let shutdown = CancellationToken::new();
    let sweeper = Arc::new(Sweeper::new(
        state.reconciler.clone(),
        config.poll_concurrency,
    ));
    let sweeper_handle = sweeper.spawn(config.poll_interval, shutdown.clone());

    let app = router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        tracing::error!("Task sweeper ended abnormally: {}", e);
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    tracing::info!("Shutdown signal received, stopping server and sweeper");
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdminAuth;
    use crate::relay::tests::{seed_caller, seed_channel, ScriptedAdaptor};
    use crate::billing::PricingTable;
    use std::time::Duration;

    struct TestServer {
        base: String,
        client: reqwest::Client,
        db: Database,
        adaptor: Arc<ScriptedAdaptor>,
    }

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 0,
            data_dir: std::env::temp_dir(),
            database_path: ":memory:".into(),
            poll_interval: Duration::from_secs(60),
            task_timeout: None,
            upstream_timeout: Duration::from_secs(5),
            poll_concurrency: 2,
            admin: Some(AdminAuth {
                password: "hunter2".into(),
                jwt_secret: "test-secret".into(),
                jwt_ttl_days: 1,
            }),
        }
    }

    async fn start() -> TestServer {
        let db = Database::open_in_memory().unwrap();
        let adaptor = Arc::new(ScriptedAdaptor::new(json!({"status": "queued"})));
        let mut registry = AdaptorRegistry::new();
        registry.register(adaptor.clone());
        let mut table = PricingTable::default();
        table.model_price.insert("grok-imagine-video".into(), 0.1);
        let state = Arc::new(AppState::new(
            test_config(),
            db.clone(),
            Arc::new(registry),
            Arc::new(PricingStore::in_memory(table)),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        TestServer {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            db,
            adaptor,
        }
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let server = start().await;
        let resp = server
            .client
            .get(format!("{}/api/health", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_relay_requires_token() {
        let server = start().await;
        let resp = server
            .client
            .post(format!("{}/v1/video/generations", server.base))
            .json(&json!({"prompt": "p"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_submit_then_fetch() {
        let server = start().await;
        let caller = seed_caller(&server.db, 1_000_000);
        seed_channel(&server.db, None);

        let resp = server
            .client
            .post(format!("{}/v1/video/generations", server.base))
            .bearer_auth(&caller.token.key)
            .json(&json!({"model": "grok-imagine-video", "prompt": "a cat"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "success");
        assert_eq!(body["data"]["status"], "SUBMITTED");
        let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

        let resp = server
            .client
            .get(format!("{}/v1/video/generations/{}", server.base, task_id))
            .bearer_auth(&caller.token.key)
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["status"], "QUEUED");
        assert_eq!(body["data"]["progress"], "20%");

        server.adaptor.script(json!({"status": "done", "url": "https://cdn/v.mp4"}));
        let resp = server
            .client
            .get(format!("{}/v1/videos/{}", server.base, task_id))
            .bearer_auth(&caller.token.key)
            .send()
            .await
            .unwrap();
        let video: Value = resp.json().await.unwrap();
        assert_eq!(video["id"], task_id.as_str());
        assert_eq!(video["status"], "completed");

        let resp = server
            .client
            .post(format!("{}/v1/video/fetch", server.base))
            .bearer_auth(&caller.token.key)
            .json(&json!({"ids": [task_id, "missing"]}))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["status"], "SUCCESS");
    }

    #[tokio::test]
    async fn test_fetch_unknown_task() {
        let server = start().await;
        let caller = seed_caller(&server.db, 1_000);
        let resp = server
            .client
            .get(format!("{}/v1/video/generations/nope", server.base))
            .bearer_auth(&caller.token.key)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "task_not_exist");
    }

    #[tokio::test]
    async fn test_admin_flow() {
        let server = start().await;
        let url = |path: &str| format!("{}{}", server.base, path);

        let resp = server
            .client
            .get(url("/api/admin/pricing"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = server
            .client
            .post(url("/api/auth/login"))
            .json(&json!({"password": "wrong"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let login: auth::LoginResponse = server
            .client
            .post(url("/api/auth/login"))
            .json(&json!({"password": "hunter2"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let user: Value = server
            .client
            .post(url("/api/admin/users"))
            .bearer_auth(&login.token)
            .json(&json!({"username": "carol", "quota": 0}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let user_id = user["id"].as_i64().unwrap();

        let topped: Value = server
            .client
            .post(url(&format!("/api/admin/users/{}/topup", user_id)))
            .bearer_auth(&login.token)
            .json(&json!({"amount": 5000}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(topped["quota"], 5000);

        let resp = server
            .client
            .post(url("/api/admin/users"))
            .bearer_auth(&login.token)
            .json(&json!({"username": "bad name!"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = server
            .client
            .post(url("/api/admin/channels"))
            .bearer_auth(&login.token)
            .json(&json!({"name": "c", "platform": "sora", "base_url": "not a url", "api_key": "k"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let mut table = PricingTable::default();
        table.group_ratio.insert("vip".into(), 0.8);
        let resp = server
            .client
            .put(url("/api/admin/pricing"))
            .bearer_auth(&login.token)
            .json(&table)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let stored: PricingTable = server
            .client
            .get(url("/api/admin/pricing"))
            .bearer_auth(&login.token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stored, table);

        let logs: Value = server
            .client
            .get(url(&format!("/api/admin/logs?user_id={}", user_id)))
            .bearer_auth(&login.token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(logs.as_array().unwrap().len(), 1);
    }
}
