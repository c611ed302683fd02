use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{
    app_state::AppState,
    handlers::{admin, tail},
    middleware::auth::{AuthState, require_admin, require_principal},
};

/// Admin tails and session management. Every route requires an admin
/// principal.
pub fn create_router_admin(auth: AuthState) -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/logs/stream", get(tail::stream_logs))
        .route(
            "/admin/conversations/stream",
            get(tail::stream_conversations),
        )
        .route("/admin/tail/sessions", get(admin::list_sessions))
        .route("/admin/tail/flush", post(admin::flush_sessions))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(auth, require_principal))
}
