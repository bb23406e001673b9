//! 出站传播
//!
//! 下游调用前把关联 ID / 事务 ID（某些变体还有用户 ID）写进出站元数据。
//! 在其他执行单元上运行的调用必须先在父作用域内同步取快照，
//! 不能读取父作用域的实时存储。

use std::future::Future;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tokio::task::JoinHandle;

use crate::infrastructure::{
    context::{self, ContextKey, CorrelationContext},
    correlation::{HEADER_CORRELATION_ID, HEADER_TRANSACTION_ID, HEADER_USER_ID},
};

/// 出站携带哪些标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationStyle {
    /// 关联 ID + 事务 ID
    #[default]
    Standard,
    /// 额外携带用户 ID
    WithUser,
}

impl PropagationStyle {
    fn keys(&self) -> &'static [(ContextKey, &'static str)] {
        const STANDARD: &[(ContextKey, &str)] = &[
            (ContextKey::CorrelationId, HEADER_CORRELATION_ID),
            (ContextKey::TransactionId, HEADER_TRANSACTION_ID),
        ];
        const WITH_USER: &[(ContextKey, &str)] = &[
            (ContextKey::CorrelationId, HEADER_CORRELATION_ID),
            (ContextKey::TransactionId, HEADER_TRANSACTION_ID),
            (ContextKey::UserId, HEADER_USER_ID),
        ];
        match self {
            PropagationStyle::Standard => STANDARD,
            PropagationStyle::WithUser => WITH_USER,
        }
    }
}

/// 从上下文计算出站头部（未设置的键不会出现）
pub fn outbound_headers(
    ctx: &CorrelationContext,
    style: PropagationStyle,
) -> Vec<(&'static str, String)> {
    style
        .keys()
        .iter()
        .filter_map(|(key, header)| ctx.get(*key).map(|v| (*header, v.to_string())))
        .collect()
}

/// 当前作用域的出站头部；不在作用域内时为空
pub fn current_outbound_headers(style: PropagationStyle) -> Vec<(&'static str, String)> {
    context::with_current(|ctx| outbound_headers(ctx, style)).unwrap_or_default()
}

/// 通用 HTTP / RPC 元数据适配：写入（覆盖）对应头部。
/// 返回实际写入的头部数量；非法头部值会被跳过。
pub fn inject_headers(
    headers: &mut HeaderMap,
    ctx: &CorrelationContext,
    style: PropagationStyle,
) -> usize {
    let mut injected = 0;
    for (name, value) in outbound_headers(ctx, style) {
        let (Ok(header), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            tracing::warn!(header = name, "Skipping invalid propagation header");
            continue;
        };
        headers.insert(header, value);
        injected += 1;
    }
    injected
}

/// reqwest 客户端适配
pub trait CorrelationRequestExt {
    /// 从当前作用域读取标识并写入请求头
    fn with_correlation(self, style: PropagationStyle) -> Self;

    /// 从显式快照写入（调用在其他执行单元上构建时使用）
    fn with_context(self, ctx: &CorrelationContext, style: PropagationStyle) -> Self;
}

impl CorrelationRequestExt for reqwest::RequestBuilder {
    fn with_correlation(self, style: PropagationStyle) -> Self {
        current_outbound_headers(style)
            .into_iter()
            .fold(self, |req, (name, value)| req.header(name, value))
    }

    fn with_context(self, ctx: &CorrelationContext, style: PropagationStyle) -> Self {
        outbound_headers(ctx, style)
            .into_iter()
            .fold(self, |req, (name, value)| req.header(name, value))
    }
}

/// 立即取当前作用域的快照，并让 `fut` 在以该快照开启的新作用域中运行
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let snapshot = context::snapshot().unwrap_or_default();
    context::scope(snapshot, fut)
}

/// 带上下文地派生任务（快照在调用时同步获取）
pub fn spawn_with_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(propagate(fut))
}
