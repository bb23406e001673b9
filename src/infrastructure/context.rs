//! 关联上下文
//!
//! 一个作用域（一次入站请求、一次出站调用、一个任务）拥有自己的一份
//! `CorrelationContext`。作用域绑定在执行单元上（基于 `tokio::task_local`），
//! 同步代码用 `sync_scope`，异步代码用 `scope`。
//!
//! 跨执行单元传播只能通过 `snapshot()` 拿到一份独立副本，再用它开启新作用域；
//! 两个同时活跃的作用域之间从不共享可变存储。
//!
//! 作用域结束时（正常返回、错误、panic 展开、future 被取消）其绑定恰好被释放一次。

use std::{cell::RefCell, collections::BTreeMap, fmt, future::Future};

use serde::{ser::Serializer, Serialize};

use crate::error::LoggingError;

/// 上下文键（固定词表）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextKey {
    CorrelationId,
    TransactionId,
    Operation,
    OperationId,
    ClientIp,
    RequestUri,
    RequestMethod,
    UserId,
}

impl ContextKey {
    pub const ALL: [ContextKey; 8] = [
        ContextKey::CorrelationId,
        ContextKey::TransactionId,
        ContextKey::Operation,
        ContextKey::OperationId,
        ContextKey::ClientIp,
        ContextKey::RequestUri,
        ContextKey::RequestMethod,
        ContextKey::UserId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKey::CorrelationId => "correlation_id",
            ContextKey::TransactionId => "transaction_id",
            ContextKey::Operation => "operation",
            ContextKey::OperationId => "operation_id",
            ContextKey::ClientIp => "client_ip",
            ContextKey::RequestUri => "request_uri",
            ContextKey::RequestMethod => "request_method",
            ContextKey::UserId => "user_id",
        }
    }

    /// 一旦在作用域内确立就不可再改
    pub fn is_immutable(&self) -> bool {
        matches!(self, ContextKey::CorrelationId)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 作用域内的键值绑定
///
/// 不存在的键就是 “未设置”，空白值永远不会被存进来。
/// `Clone` 即独立副本，副本与原值之间互不可见。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    values: BTreeMap<ContextKey, String>,
}

impl CorrelationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构建期使用的链式绑定；冲突时保留已有值
    pub fn with(mut self, key: ContextKey, value: impl Into<String>) -> Self {
        if let Err(e) = self.bind(key, value) {
            tracing::warn!(error = %e, "Ignoring conflicting context binding");
        }
        self
    }

    pub fn bind(&mut self, key: ContextKey, value: impl Into<String>) -> Result<(), LoggingError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Ok(());
        }

        if key.is_immutable() {
            if let Some(existing) = self.values.get(&key) {
                if *existing != value {
                    return Err(LoggingError::ImmutableContextKey(key));
                }
                return Ok(());
            }
        }

        self.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: ContextKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    pub fn contains(&self, key: ContextKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(ContextKey::CorrelationId)
    }

    pub fn remove(&mut self, key: ContextKey) -> Option<String> {
        self.values.remove(&key)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContextKey, &str)> {
        self.values.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// 日志字段形式（键名 → 值）
    pub fn to_fields(&self) -> Vec<(String, String)> {
        self.iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_string()))
            .collect()
    }
}

impl Serialize for CorrelationContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter().map(|(k, v)| (k.as_str(), v)))
    }
}

/// 作用域释放时的回调（收到释放前的绑定）
pub type UnbindHook = Box<dyn FnOnce(&CorrelationContext) + Send>;

struct ScopeState {
    ctx: CorrelationContext,
    on_unbind: Option<UnbindHook>,
}

impl ScopeState {
    fn new(ctx: CorrelationContext, on_unbind: Option<UnbindHook>) -> RefCell<Self> {
        RefCell::new(Self { ctx, on_unbind })
    }
}

impl Drop for ScopeState {
    fn drop(&mut self) {
        if let Some(hook) = self.on_unbind.take() {
            hook(&self.ctx);
        }
        self.ctx.clear();
    }
}

tokio::task_local! {
    static CURRENT_SCOPE: RefCell<ScopeState>;
}

/// 以 `ctx` 作为当前作用域执行异步工作
pub fn scope<F: Future>(ctx: CorrelationContext, fut: F) -> impl Future<Output = F::Output> {
    CURRENT_SCOPE.scope(ScopeState::new(ctx, None), fut)
}

/// 同 `scope`，并在绑定被释放时调用 `hook`（任何退出路径上恰好一次）
pub fn scope_with_unbind_hook<F: Future>(
    ctx: CorrelationContext,
    hook: UnbindHook,
    fut: F,
) -> impl Future<Output = F::Output> {
    CURRENT_SCOPE.scope(ScopeState::new(ctx, Some(hook)), fut)
}

/// 以 `ctx` 作为当前作用域执行同步闭包
pub fn sync_scope<R>(ctx: CorrelationContext, f: impl FnOnce() -> R) -> R {
    CURRENT_SCOPE.sync_scope(ScopeState::new(ctx, None), f)
}

pub fn sync_scope_with_unbind_hook<R>(
    ctx: CorrelationContext,
    hook: UnbindHook,
    f: impl FnOnce() -> R,
) -> R {
    CURRENT_SCOPE.sync_scope(ScopeState::new(ctx, Some(hook)), f)
}

/// 当前执行单元是否处于某个作用域内
pub fn is_active() -> bool {
    CURRENT_SCOPE.try_with(|_| ()).is_ok()
}

/// 在当前作用域绑定一个键
pub fn bind(key: ContextKey, value: impl Into<String>) -> Result<(), LoggingError> {
    let value = value.into();
    CURRENT_SCOPE
        .try_with(|state| state.borrow_mut().ctx.bind(key, value))
        .map_err(|_| LoggingError::NoActiveScope)?
}

pub fn get(key: ContextKey) -> Option<String> {
    CURRENT_SCOPE
        .try_with(|state| state.borrow().ctx.get(key).map(str::to_owned))
        .ok()
        .flatten()
}

/// 借用当前作用域的绑定，避免整体克隆
pub fn with_current<R>(f: impl FnOnce(&CorrelationContext) -> R) -> Option<R> {
    CURRENT_SCOPE.try_with(|state| f(&state.borrow().ctx)).ok()
}

/// 为传播到新执行单元准备的独立副本；必须在父作用域内同步调用
pub fn snapshot() -> Option<CorrelationContext> {
    with_current(CorrelationContext::clone)
}

/// 清空当前作用域的全部绑定；返回调用时是否处于作用域内
pub fn unbind_all() -> bool {
    CURRENT_SCOPE
        .try_with(|state| state.borrow_mut().ctx.clear())
        .is_ok()
}
