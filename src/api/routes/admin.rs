//! Admin endpoints

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::api::{ApiError, ApiResult, ApiState};

/// GET /api/config
///
/// Raw text of the active config
pub async fn get_config(State(state): State<ApiState>) -> ApiResult<String> {
    state.manager.config_text().await.map_err(ApiError::bad_request)
}

/// PUT /api/config
///
/// Stage the body for the next reload
pub async fn put_config(State(state): State<ApiState>, body: String) -> ApiResult<&'static str> {
    state.manager.stage(body).await.map_err(ApiError::bad_request)?;
    Ok("ok")
}

/// GET /api/reload
pub async fn reload(State(state): State<ApiState>) -> ApiResult<&'static str> {
    if let Err(e) = state.manager.reload().await {
        error!("api reload failed: {e}");
        return Err(ApiError::bad_request(e));
    }
    info!("config reloaded");
    Ok("ok")
}

/// GET /
pub async fn index() -> impl IntoResponse {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/static/")])
}

/// GET /static/*
///
/// Files under the active config's `static_dir`, so a reload can move it
pub async fn serve_static(State(state): State<ApiState>, request: Request) -> Response {
    let config = match state.manager.config().await {
        Ok(config) => config,
        Err(e) => return ApiError::internal(e).into_response(),
    };
    match ServeDir::new(&config.static_dir).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}
