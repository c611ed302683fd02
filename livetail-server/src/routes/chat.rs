use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{
    app_state::AppState,
    handlers::chat,
    middleware::auth::{AuthState, require_principal},
};

pub fn create_router_chat(auth: AuthState) -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/stream", post(chat::stream))
        .route("/chat/{conversation_id}/abort", post(chat::abort))
        .route("/chat/{conversation_id}/messages", get(chat::messages))
        .route_layer(middleware::from_fn_with_state(auth, require_principal))
}
