use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use breakoutglobe_server::config::Config;
use breakoutglobe_server::state::AppState;
use breakoutglobe_server::{db, handlers, store, websocket};

/// Middleware that restricts access to the metrics endpoint to loopback connections only.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing — JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "breakoutglobe_server=info,tower_http=info,sqlx=warn"
            .parse()
            .unwrap()
    });

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("🚀 BreakoutGlobe server starting...");

    let config = Config::from_env().expect("Failed to load configuration");
    info!("📝 Configuration loaded");

    // Postgres: users, maps, POIs.
    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    info!("✅ Database migrations applied");

    db::health_check(&pool)
        .await
        .expect("Database health check failed");
    info!("✅ Database health check passed");

    // Redis: presence, membership, rate limits, pub/sub.
    let redis_client =
        store::create_client(&config.redis_url).expect("Invalid REDIS_URL");
    let redis = store::create_connection(&redis_client)
        .await
        .expect("Failed to connect to Redis");
    store::health_check(&redis)
        .await
        .expect("Redis health check failed");
    info!("✅ Redis health check passed");

    // CORS: permissive in dev, origin-restricted in production.
    let cors = if config.is_dev {
        info!("🔓 CORS: permissive (dev mode)");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!(
                "🔒 CORS: no ALLOWED_ORIGINS configured — all cross-origin requests will be denied"
            );
        } else {
            info!(
                "🔒 CORS: production mode, allowing origins: {:?}",
                config.allowed_origins
            );
        }
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    };

    let addr = config.server_addr();
    let app_state = AppState::build(config, pool, redis);

    // Bridge bus events to connected clients on this instance.
    websocket::adapter::spawn(redis_client, app_state.hub.clone());

    // Prometheus metrics layer
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // ── Edge rate limiting ──────────────────────────────────────────────────
    // Coarse per-IP limit at the HTTP layer; the per-user, per-action
    // sliding windows live in the services.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(40)
            .finish()
            .expect("Invalid governor configuration"),
    );

    // Build router
    let app = Router::new()
        // Health check + metrics
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        // Session routes
        .route("/api/sessions", post(handlers::sessions::create_session))
        .route("/api/sessions/:id", get(handlers::sessions::get_session))
        .route(
            "/api/sessions/:id/avatar",
            put(handlers::sessions::update_avatar),
        )
        .route(
            "/api/sessions/:id/heartbeat",
            post(handlers::sessions::heartbeat),
        )
        .route(
            "/api/sessions/:id",
            delete(handlers::sessions::end_session),
        )
        .route(
            "/api/maps/:map_id/sessions",
            get(handlers::sessions::list_map_sessions),
        )
        // POI routes
        .route("/api/pois", get(handlers::pois::list_pois))
        .route("/api/pois", post(handlers::pois::create_poi))
        .route("/api/pois/:id", get(handlers::pois::get_poi))
        .route("/api/pois/:id", put(handlers::pois::update_poi))
        .route("/api/pois/:id", delete(handlers::pois::delete_poi))
        .route("/api/pois/:id/join", post(handlers::pois::join_poi))
        .route("/api/pois/:id/leave", post(handlers::pois::leave_poi))
        // User routes
        .route("/api/users/profile", put(handlers::users::update_profile))
        // WebSocket gateway
        .route("/ws", get(websocket::websocket_handler))
        // ── Edge rate limit (per IP) ────────────────────────────────────────
        .layer(GovernorLayer {
            config: governor_conf,
        })
        // ── Prometheus + CORS ──────────────────────────────────────────────
        .layer(prometheus_layer)
        .layer(cors)
        .with_state(app_state);

    // Start server
    info!("🎧 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // `into_make_service_with_connect_info` populates `ConnectInfo<SocketAddr>`
    // for GovernorLayer's per-IP keying and the /metrics loopback guard.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server failed to start");
}
