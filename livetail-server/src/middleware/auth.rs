use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use crate::{
    auth::principal::{Principal, PrincipalResolver, ResolveError},
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
};

#[derive(Clone)]
pub struct AuthState {
    resolver: Arc<dyn PrincipalResolver>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState").finish_non_exhaustive()
    }
}

impl AuthState {
    pub fn new(resolver: Arc<dyn PrincipalResolver>) -> Self {
        Self { resolver }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Resolve the bearer credential into a [`Principal`].
///
/// Missing credentials answer a plain 401; unknown or expired ones answer 401
/// with an `invalid_token` challenge so clients know to refresh.
pub async fn require_principal(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("bearer credential required"))?;

    let principal = state.resolver.resolve(&token).await.map_err(|err| {
        if err == ResolveError::Expired {
            debug!("rejected expired credential");
        } else {
            warn!("rejected unknown credential");
        }
        ApiError::invalid_token(err.to_string())
    })?;

    if let Some(context) = request.extensions_mut().get_mut::<RequestContext>() {
        context.principal = Some(principal.clone());
    } else {
        request.extensions_mut().insert(RequestContext {
            request_id: String::new(),
            principal: Some(principal.clone()),
        });
    }
    request.extensions_mut().insert(principal);

    Ok(next.run(request).await)
}

/// Layered after [`require_principal`]; rejects non-admin callers.
pub async fn require_admin(request: Request<Body>, next: Next) -> AppResult<Response> {
    match request.extensions().get::<Principal>() {
        None => Err(ApiError::unauthorized("authentication required")),
        Some(principal) if !principal.is_admin => {
            Err(ApiError::forbidden("admin privileges required"))
        }
        Some(_) => Ok(next.run(request).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::principal::StaticTokenResolver;
    use axum::{
        Router,
        http::{StatusCode, header::WWW_AUTHENTICATE},
        middleware,
        routing::get,
    };
    use shared::config::server::{AuthConfig, StaticToken};
    use tower::ServiceExt;

    fn app() -> Router {
        let resolver = StaticTokenResolver::from_config(&AuthConfig {
            tokens: vec![
                StaticToken {
                    token: "admin-token".into(),
                    subject: "ops".into(),
                    is_admin: true,
                    expires_at: None,
                },
                StaticToken {
                    token: "user-token".into(),
                    subject: "dana".into(),
                    is_admin: false,
                    expires_at: None,
                },
                StaticToken {
                    token: "expired-token".into(),
                    subject: "ops".into(),
                    is_admin: true,
                    expires_at: Some(1),
                },
            ],
        });
        let state = AuthState::new(Arc::new(resolver));
        Router::new()
            .route("/admin", get(|| async { "ok" }))
            .route_layer(middleware::from_fn(require_admin))
            .route_layer(middleware::from_fn_with_state(state, require_principal))
    }

    async fn call(token: Option<&str>) -> Response {
        let mut builder = Request::builder().uri("/admin");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        app()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn parses_bearer_scheme_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn admin_passes() {
        assert_eq!(call(Some("admin-token")).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn non_admin_is_forbidden() {
        assert_eq!(call(Some("user-token")).await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn expired_token_gets_refresh_challenge() {
        let response = call(Some("expired-token")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(
            response
                .headers()
                .get(WWW_AUTHENTICATE)
                .unwrap()
                .to_str()
                .unwrap()
                .contains("invalid_token")
        );
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        assert_eq!(call(None).await.status(), StatusCode::UNAUTHORIZED);
    }
}
