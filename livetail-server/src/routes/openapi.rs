use std::sync::Arc;

use crate::{app_state::AppState, openapi::ApiDoc};
use axum::{
    Router,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use utoipa::OpenApi;

async fn openapi_json() -> impl IntoResponse {
    match ApiDoc::openapi().to_pretty_json() {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("JSON error: {e}"),
        ),
    }
}

pub fn openapi_routes() -> Router<Arc<AppState>> {
    Router::new().route("/openapi/livetail.json", get(openapi_json))
}
