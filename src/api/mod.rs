//! HTTP surface of the hub
//!
//! ## Endpoints
//!
//! Behind basic auth with the admin credential:
//!
//! - `GET /api/config` - raw text of the active config
//! - `PUT /api/config` - stage a config for the next reload
//! - `GET /api/reload` - validate, apply and persist the staged config
//! - `GET /static/*` - files under the configured static dir (agent binary)
//! - `GET /` - redirect to `/static/`
//!
//! Open:
//!
//! - `POST /search`, `POST /variable`, `POST /query` - dashboard protocol
//! - `WS /agentws?id=<target>&file=<file>` - agent log stream

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{RecordQuery, TableColumn, TableResponse, Variable, VariableQuery};

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g. "0.0.0.0")
    pub address: String,
    pub port: u16,
}

impl From<&Config> for ApiConfig {
    fn from(config: &Config) -> Self {
        Self {
            address: config.address.clone(),
            port: config.port,
        }
    }
}

/// Build the hub router
pub fn router(state: ApiState) -> Router {
    let admin = Router::new()
        .route(
            "/api/config",
            get(routes::admin::get_config).put(routes::admin::put_config),
        )
        .route("/api/reload", get(routes::admin::reload))
        .route("/", get(routes::admin::index))
        .nest_service(
            "/static",
            get(routes::admin::serve_static).with_state::<()>(state.clone()),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::basic_auth,
        ));

    let dashboard = Router::new()
        .route(
            "/search",
            post(routes::dashboard::search).get(routes::dashboard::search),
        )
        .route(
            "/variable",
            post(routes::dashboard::variable).get(routes::dashboard::variable),
        )
        .route(
            "/query",
            post(routes::dashboard::query).get(routes::dashboard::query),
        )
        .route("/agentws", get(websocket::agent_handler));

    Router::new()
        .merge(admin)
        .merge(dashboard)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Spawn the API server
///
/// This starts an Axum HTTP server in a background task.
/// Returns the server's local address.
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {}:{}", config.address, config.port);

    let app = router(state);

    let listener = tokio::net::TcpListener::bind((config.address.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
