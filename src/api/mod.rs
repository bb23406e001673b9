use std::{sync::Arc, time::Instant};

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{Level, Span};

use crate::{
    api::{
        handlers::{api_health, create_payment, metrics, not_found},
        middleware::correlation_middleware,
    },
    app_state::AppState,
    infrastructure::context::{self, ContextKey},
};

pub mod handlers;
pub mod middleware;
pub mod response;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(metrics))
        .route("/api/payments", post(create_payment))
        .fallback(not_found)
        // 观测中间件：关联作用域在最外层，其余中间件（包括 TraceLayer 的 span）都运行在作用域内
        .layer(
            ServiceBuilder::new()
                .layer(from_fn_with_state(state.clone(), correlation_middleware))
                .layer(TraceLayer::new_for_http().make_span_with(request_span))
                .layer(from_fn(add_response_time_header))
                .layer(from_fn(trace_log)),
        )
        .with_state(state)
}

/// 请求 span 带上当前作用域的关联 ID
fn request_span<B>(req: &axum::http::Request<B>) -> Span {
    let correlation_id = context::get(ContextKey::CorrelationId).unwrap_or_else(|| "-".into());
    tracing::debug_span!(
        "request",
        method = %req.method(),
        uri = %req.uri(),
        correlation_id = %correlation_id
    )
}

async fn add_response_time_header(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let mut resp = next.run(req).await;
    let elapsed_ms = start.elapsed().as_millis().to_string();
    resp.headers_mut().insert(
        "x-response-time",
        HeaderValue::from_str(&format!("{}ms", elapsed_ms))
            .unwrap_or(HeaderValue::from_static("0ms")),
    );
    resp
}

async fn trace_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let resp = next.run(req).await;
    let status = resp.status();
    let elapsed = start.elapsed().as_millis();
    let correlation_id = context::get(ContextKey::CorrelationId).unwrap_or_else(|| "-".into());
    tracing::event!(Level::INFO, correlation_id=%correlation_id, method=%method, path=%path, status=%status.as_u16(), elapsed_ms=%elapsed, "http_request");
    resp
}
