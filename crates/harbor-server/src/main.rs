use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::CookieJar;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use harbor_api::auth::{self, AppState, AppStateInner};
use harbor_api::mail::{HttpMailer, LogMailer, Mailer};
use harbor_api::middleware::ACCESS_COOKIE;
use harbor_api::tokens::Tokens;
use harbor_gateway::connection;
use harbor_gateway::dispatcher::Dispatcher;

mod sweep;

const SWEEP_INTERVAL_SECS: u64 = 60 * 60;

#[derive(Clone)]
struct ServerState {
    db: Arc<harbor_db::Database>,
    dispatcher: Dispatcher,
    tokens: Tokens,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harbor=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let access_secret =
        std::env::var("HARBOR_ACCESS_SECRET").unwrap_or_else(|_| "access-secret-change-me".into());
    let refresh_secret = std::env::var("HARBOR_REFRESH_SECRET")
        .unwrap_or_else(|_| "refresh-secret-change-me".into());
    let db_path = std::env::var("HARBOR_DB_PATH").unwrap_or_else(|_| "harbor.db".into());
    let host = std::env::var("HARBOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("HARBOR_PORT")
        .unwrap_or_else(|_| "3001".into())
        .parse()?;
    let cookie_secure = std::env::var("HARBOR_COOKIE_SECURE")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    let frontend_origin = std::env::var("HARBOR_FRONTEND_ORIGIN").ok();

    // Init database
    let db = Arc::new(harbor_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let tokens = Tokens::new(access_secret, refresh_secret);

    let mailer: Arc<dyn Mailer> = match std::env::var("HARBOR_MAIL_API_KEY") {
        Ok(api_key) if !api_key.is_empty() => {
            let from_name =
                std::env::var("HARBOR_MAIL_FROM_NAME").unwrap_or_else(|_| "Harbor".into());
            let from_email =
                std::env::var("HARBOR_MAIL_FROM").unwrap_or_else(|_| "no-reply@harbor.local".into());
            Arc::new(HttpMailer::new(api_key, from_name, from_email))
        }
        _ => {
            info!("HARBOR_MAIL_API_KEY not set; verification codes will be logged instead");
            Arc::new(LogMailer)
        }
    };

    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        tokens: tokens.clone(),
        mailer,
        cookie_secure,
    });

    let server_state = ServerState {
        db: db.clone(),
        dispatcher,
        tokens,
    };

    // Periodic sweep of expired tokens and pending registrations
    tokio::spawn(sweep::run_sweep_loop(db, SWEEP_INTERVAL_SECS));

    // CORS: a configured frontend origin gets credentialed CORS; otherwise
    // stay permissive for local development.
    let cors = match &frontend_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin.parse::<HeaderValue>()?)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
            .allow_credentials(true),
        None => CorsLayer::permissive(),
    };

    // Routes
    let app = Router::new()
        .route("/health", get(health))
        .merge(auth::routes(app_state))
        .merge(
            Router::new()
                .route("/gateway", get(ws_upgrade))
                .with_state(server_state),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Harbor server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// Connection gatekeeper: authenticates the upgrade request from the same
/// access-token cookie HTTP uses, before the socket is accepted. The two
/// rejection codes are client diagnostics only — neither says anything
/// about accounts.
async fn ws_upgrade(
    State(state): State<ServerState>,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, Json<serde_json::Value>)> {
    let Some(cookie) = jar.get(ACCESS_COOKIE) else {
        warn!("gateway handshake rejected: no access token presented");
        return Err(reject("NO_ACCESS_TOKEN"));
    };

    let identity = match state.tokens.verify_access(cookie.value()) {
        Ok(identity) => identity,
        Err(_) => {
            warn!("gateway handshake rejected: invalid or expired access token");
            return Err(reject("BAD_ACCESS_TOKEN"));
        }
    };

    Ok(ws
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, state.dispatcher, state.db, identity)
        })
        .into_response())
}

fn reject(code: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "code": code })),
    )
}
