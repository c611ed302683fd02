use axum::{
    body::Body,
    extract::MatchedPath,
    http::{Request, Response},
};
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{DefaultOnBodyChunk, DefaultOnEos, MakeSpan, TraceLayer};
use tracing::{Span, debug, error};

use crate::middleware::request_context::RequestContext;

type TraceLayerType = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    HttpMakeSpan,
    fn(&Request<Body>, &Span),
    fn(&Response<Body>, Duration, &Span),
    DefaultOnBodyChunk,
    DefaultOnEos,
    fn(ServerErrorsFailureClass, Duration, &Span),
>;

/// Span per request, keyed by the matched route so tail sessions with
/// different query strings share one label.
#[derive(Clone, Debug, Default)]
pub(crate) struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .extensions()
            .get::<RequestContext>()
            .map_or_else(|| "n/a".into(), |ctx| ctx.request_id.clone());
        let route = route_of(request);

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty
        )
    }
}

fn route_of<B>(request: &Request<B>) -> String {
    request.extensions().get::<MatchedPath>().map_or_else(
        || request.uri().path().to_string(),
        |matched| matched.as_str().to_string(),
    )
}

pub(crate) fn on_request_handler(request: &Request<Body>, span: &Span) {
    span.in_scope(|| {
        debug!(uri = %request.uri(), version = ?request.version(), "started processing request");
    });
}

/// For SSE routes this fires when headers are sent, not when the stream ends.
pub(crate) fn on_response_handler(response: &Response<Body>, latency: Duration, span: &Span) {
    let status = response.status().as_u16();
    span.record("status_code", status);
    metrics::histogram!("livetail_http_response_latency_ms", "status" => status.to_string())
        .record(latency.as_secs_f64() * 1000.0);
    span.in_scope(|| {
        debug!(status, latency_ms = latency.as_millis(), "response headers sent");
    });
}

pub(crate) fn on_failure_handler(error: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    span.in_scope(|| {
        error!(error = %error, latency = ?latency, "error processing request");
    });
}

pub fn create_trace_layer() -> TraceLayerType {
    TraceLayer::new_for_http()
        .make_span_with(HttpMakeSpan)
        .on_request(on_request_handler as fn(&Request<Body>, &Span))
        .on_response(on_response_handler as fn(&Response<Body>, Duration, &Span))
        .on_failure(on_failure_handler as fn(ServerErrorsFailureClass, Duration, &Span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use tracing::Level;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn span_falls_back_to_raw_path_without_matched_route() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/admin/logs/stream?search=alice")
            .body(Body::empty())
            .unwrap();
        assert_eq!(route_of(&request), "/api/admin/logs/stream");
    }

    #[test]
    fn span_carries_request_id_from_context() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .set_default();

        let mut request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        request.extensions_mut().insert(RequestContext {
            request_id: "req-1".into(),
            principal: None,
        });
        let span = HttpMakeSpan.make_span(&request);
        assert_eq!(span.metadata().map(|meta| meta.name()), Some("http_request"));
    }

    #[test]
    fn handlers_do_not_panic() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .set_default();
        let span = tracing::info_span!("test_span", status_code = tracing::field::Empty);

        let request = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        on_request_handler(&request, &span);

        let response = Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap();
        on_response_handler(&response, Duration::from_millis(3), &span);
        on_failure_handler(
            ServerErrorsFailureClass::StatusCode(StatusCode::INTERNAL_SERVER_ERROR),
            Duration::from_millis(5),
            &span,
        );
    }
}
