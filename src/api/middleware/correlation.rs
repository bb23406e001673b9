//! 关联 ID 中间件
//!
//! 为每个请求推导关联上下文，在该上下文的作用域内处理请求，
//! 并把关联 ID 写回响应头。请求结束（包括客户端断开导致的取消）时作用域被释放。

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

use crate::{
    app_state::AppState,
    infrastructure::{
        context::{self, CorrelationContext, UnbindHook},
        correlation::InboundRequest,
    },
};

/// 认证层识别出的用户；由上游认证中间件放入请求扩展
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
}

impl AuthenticatedUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

fn request_context(state: &AppState, req: &Request) -> CorrelationContext {
    let peer_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let user_id = req
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.id.as_str());

    state.extractor.extract(&InboundRequest {
        headers: req.headers(),
        peer_addr,
        uri: req.uri().path(),
        method: req.method().as_str(),
        user_id,
    })
}

/// 关联 ID 中间件
pub async fn correlation_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = state.extractor.config();
    if !config.enabled {
        return next.run(req).await;
    }

    let ctx = request_context(&state, &req);
    let correlation_id = ctx.correlation_id().map(str::to_owned);
    crate::metrics::inc_scope_opened();

    let release: UnbindHook = Box::new(|ctx: &CorrelationContext| {
        tracing::debug!(
            correlation_id = ctx.correlation_id().unwrap_or("-"),
            bindings = ctx.len(),
            "Request scope released"
        );
    });
    let mut response = context::scope_with_unbind_hook(ctx, release, next.run(req)).await;

    // 将关联 ID 添加到响应头中
    if let Some(id) = correlation_id {
        match (
            HeaderName::from_bytes(config.header_name.as_bytes()),
            HeaderValue::from_str(&id),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = %config.header_name, "Cannot echo correlation id header"),
        }
    }

    response
}
