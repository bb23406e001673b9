//! 操作拦截器
//!
//! 把一次业务调用包起来：生成操作 ID、在子作用域中绑定 `operation` / `operation_id`、
//! 记录 ENTRY / EXIT / ERROR 生命周期事件、检查耗时阈值，按需输出审计记录。
//!
//! 业务调用的返回值和错误原样交还给调用方；所有记录都是旁路输出。

use std::{
    fmt::{Debug, Display},
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::Either;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    config::InterceptorConfig,
    infrastructure::{
        context::{self, ContextKey, CorrelationContext, UnbindHook},
        emitter::{EmittedRecord, EventEmitter, RecordKind, Severity},
        masking::{DataMasker, Loggable},
    },
    metrics,
};

pub const DEFAULT_AUDIT_TYPE: &str = "PAYMENT_OPERATION";

/// ENTRY / EXIT 允许使用的级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
}

impl From<LogLevel> for Severity {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Severity::Trace,
            LogLevel::Debug => Severity::Debug,
            LogLevel::Info => Severity::Info,
            LogLevel::Warn => Severity::Warn,
        }
    }
}

/// 一个被拦截操作的日志策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    /// 为空时使用大写的方法名
    pub operation: Option<String>,
    pub log_params: bool,
    pub log_result: bool,
    pub audit_enabled: bool,
    /// 未设置或为 0 时使用拦截器的默认阈值
    pub performance_threshold_ms: Option<u64>,
    pub entry_level: LogLevel,
    pub exit_level: LogLevel,
    pub audit_type: String,
}

impl Default for OperationDescriptor {
    fn default() -> Self {
        Self {
            operation: None,
            log_params: true,
            log_result: true,
            audit_enabled: false,
            performance_threshold_ms: None,
            entry_level: LogLevel::Info,
            exit_level: LogLevel::Info,
            audit_type: DEFAULT_AUDIT_TYPE.to_string(),
        }
    }
}

impl OperationDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(operation: impl Into<String>) -> Self {
        Self::default().operation(operation)
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        self.operation = (!operation.trim().is_empty()).then_some(operation);
        self
    }

    pub fn log_params(mut self, enabled: bool) -> Self {
        self.log_params = enabled;
        self
    }

    pub fn log_result(mut self, enabled: bool) -> Self {
        self.log_result = enabled;
        self
    }

    pub fn audit(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }

    pub fn threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.performance_threshold_ms = Some(threshold_ms);
        self
    }

    pub fn entry_level(mut self, level: LogLevel) -> Self {
        self.entry_level = level;
        self
    }

    pub fn exit_level(mut self, level: LogLevel) -> Self {
        self.exit_level = level;
        self
    }

    pub fn audit_type(mut self, audit_type: impl Into<String>) -> Self {
        self.audit_type = audit_type.into();
        self
    }
}

/// 方法级策略
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MethodPolicy {
    /// 沿用类型级描述
    #[default]
    Inherit,
    Override(OperationDescriptor),
    /// 显式不记录
    Exclude,
}

/// 拦截目标：类型名 + 方法名 + 两级描述
#[derive(Debug, Clone)]
pub struct CallSite {
    type_name: String,
    method_name: String,
    type_descriptor: Option<OperationDescriptor>,
    method_policy: MethodPolicy,
}

impl CallSite {
    pub fn new(type_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method_name: method_name.into(),
            type_descriptor: None,
            method_policy: MethodPolicy::Inherit,
        }
    }

    /// 方法级描述
    pub fn method(
        type_name: impl Into<String>,
        method_name: impl Into<String>,
        descriptor: OperationDescriptor,
    ) -> Self {
        Self::new(type_name, method_name).with_method_policy(MethodPolicy::Override(descriptor))
    }

    pub fn with_type_descriptor(mut self, descriptor: OperationDescriptor) -> Self {
        self.type_descriptor = Some(descriptor);
        self
    }

    pub fn with_method_policy(mut self, policy: MethodPolicy) -> Self {
        self.method_policy = policy;
        self
    }

    pub fn excluded(self) -> Self {
        self.with_method_policy(MethodPolicy::Exclude)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// 方法级优先，其次类型级；`None` 表示直通
    pub fn resolve(&self) -> Option<&OperationDescriptor> {
        match &self.method_policy {
            MethodPolicy::Exclude => None,
            MethodPolicy::Override(descriptor) => Some(descriptor),
            MethodPolicy::Inherit => self.type_descriptor.as_ref(),
        }
    }

    pub fn operation_name(&self, descriptor: &OperationDescriptor) -> String {
        descriptor
            .operation
            .clone()
            .unwrap_or_else(|| self.method_name.to_uppercase())
    }
}

/// 生命周期事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase", rename_all = "UPPERCASE")]
pub enum LifecycleEvent {
    Entry {
        operation: String,
        class: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Map<String, Value>>,
    },
    Exit {
        operation: String,
        class: String,
        method: String,
        execution_time_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        operation: String,
        class: String,
        method: String,
        execution_time_ms: u64,
        /// 错误的静态类型名（`type_name`），装箱的 trait 对象只能报告为 `Box<dyn Error>`
        exception_type: String,
        exception_message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceWarning {
    pub operation: String,
    pub execution_time_ms: u64,
    pub threshold_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// 审计记录（与生命周期事件分开输出）
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub audit_type: String,
    pub timestamp: String,
    pub operation: String,
    pub operation_id: String,
    pub status: AuditStatus,
    pub execution_time_ms: u64,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    /// 同 `LifecycleEvent::Error::exception_type`，是静态类型名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// 短操作 ID：UUID 的前 8 个十六进制字符
pub fn generate_operation_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// 操作拦截器
///
/// 无可变状态，可以通过 `Arc` 在任意多个并发作用域间共享。
#[derive(Clone)]
pub struct OperationInterceptor {
    masker: Arc<DataMasker>,
    emitter: Arc<dyn EventEmitter>,
    enabled: bool,
    default_threshold_ms: u64,
}

impl std::fmt::Debug for OperationInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationInterceptor")
            .field("enabled", &self.enabled)
            .field("default_threshold_ms", &self.default_threshold_ms)
            .finish()
    }
}

impl OperationInterceptor {
    pub fn new(
        masker: Arc<DataMasker>,
        emitter: Arc<dyn EventEmitter>,
        config: &InterceptorConfig,
    ) -> Self {
        Self {
            masker,
            emitter,
            enabled: config.enabled,
            default_threshold_ms: config.performance_threshold_ms,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_threshold_ms(&self) -> u64 {
        self.default_threshold_ms
    }

    /// 拦截同步调用
    pub fn intercept<T, E, F>(
        &self,
        site: &CallSite,
        args: &[(&str, &dyn Loggable)],
        thunk: F,
    ) -> Result<T, E>
    where
        T: Serialize + Debug,
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let Some(invocation) = self.prepare(site) else {
            return thunk();
        };

        let child = invocation.child_context();
        let started = Instant::now();
        invocation.entry(&child, args);

        context::sync_scope_with_unbind_hook(child, invocation.release_hook(), || {
            let outcome = thunk();
            invocation.complete(&outcome, started.elapsed());
            outcome
        })
    }

    /// 拦截异步调用
    ///
    /// 错误类型只要求 `Display`，`anyhow::Error` 之类的错误同样可以透传。
    /// 快照与 ENTRY 在调用时同步完成；返回的 future 不借用参数。
    /// future 被丢弃时子作用域照常释放，但不输出 ERROR / 审计记录。
    pub fn intercept_async<T, E, Fut>(
        &self,
        site: &CallSite,
        args: &[(&str, &dyn Loggable)],
        fut: Fut,
    ) -> impl Future<Output = Result<T, E>>
    where
        T: Serialize + Debug,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(invocation) = self.prepare(site) else {
            return Either::Left(fut);
        };

        let child = invocation.child_context();
        let started = Instant::now();
        invocation.entry(&child, args);

        let release = invocation.release_hook();
        Either::Right(context::scope_with_unbind_hook(child, release, async move {
            let outcome = fut.await;
            invocation.complete(&outcome, started.elapsed());
            outcome
        }))
    }

    fn prepare(&self, site: &CallSite) -> Option<Invocation> {
        if !self.enabled {
            return None;
        }
        let descriptor = site.resolve()?;
        let threshold_ms = descriptor
            .performance_threshold_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_threshold_ms);

        Some(Invocation {
            masker: Arc::clone(&self.masker),
            emitter: Arc::clone(&self.emitter),
            operation: site.operation_name(descriptor),
            operation_id: generate_operation_id(),
            class: site.type_name.clone(),
            method: site.method_name.clone(),
            threshold_ms,
            descriptor: descriptor.clone(),
        })
    }
}

/// 一次拦截调用的全部状态（不借用拦截器或调用方）
struct Invocation {
    masker: Arc<DataMasker>,
    emitter: Arc<dyn EventEmitter>,
    descriptor: OperationDescriptor,
    operation: String,
    operation_id: String,
    class: String,
    method: String,
    threshold_ms: u64,
}

impl Invocation {
    /// 调用方作用域的快照 + 本次操作的键
    fn child_context(&self) -> CorrelationContext {
        context::snapshot()
            .unwrap_or_default()
            .with(ContextKey::Operation, self.operation.clone())
            .with(ContextKey::OperationId, self.operation_id.clone())
    }

    /// 子作用域释放时计数（成功、错误、panic 与取消各一次）
    fn release_hook(&self) -> UnbindHook {
        let operation = self.operation.clone();
        Box::new(move |ctx: &CorrelationContext| {
            metrics::inc_scope_released(&operation);
            tracing::trace!(
                operation = %operation,
                operation_id = ctx.get(ContextKey::OperationId).unwrap_or("-"),
                "Operation scope released"
            );
        })
    }

    fn entry(&self, child: &CorrelationContext, args: &[(&str, &dyn Loggable)]) {
        let severity = Severity::from(self.descriptor.entry_level);
        if !self.emitter.is_enabled(severity) {
            return;
        }

        let params = (self.descriptor.log_params && !args.is_empty()).then(|| {
            args.iter()
                .enumerate()
                .map(|(i, (name, value))| {
                    let name = if name.is_empty() {
                        format!("arg{}", i)
                    } else {
                        name.to_string()
                    };
                    (name, self.masker.mask_loggable(*value))
                })
                .collect::<Map<String, Value>>()
        });

        let event = LifecycleEvent::Entry {
            operation: self.operation.clone(),
            class: self.class.clone(),
            method: self.method.clone(),
            params,
        };
        self.emit(
            severity,
            RecordKind::Lifecycle,
            "Operation started",
            &event,
            child.to_fields(),
        );
    }

    /// 在子作用域内调用：EXIT / 阈值 / ERROR / 审计
    fn complete<T, E>(&self, outcome: &Result<T, E>, elapsed: Duration)
    where
        T: Serialize + Debug,
        E: Display,
    {
        let execution_time_ms = elapsed_ms(elapsed);
        match outcome {
            Ok(value) => {
                self.exit(value, execution_time_ms);
                self.check_threshold(execution_time_ms);
                if self.descriptor.audit_enabled {
                    self.audit(AuditStatus::Success, execution_time_ms, None::<&E>);
                }
                metrics::observe_operation(&self.operation, true, execution_time_ms);
            }
            Err(err) => {
                self.error(err, execution_time_ms);
                if self.descriptor.audit_enabled {
                    self.audit(AuditStatus::Failure, execution_time_ms, Some(err));
                }
                metrics::observe_operation(&self.operation, false, execution_time_ms);
            }
        }
    }

    fn exit<T: Serialize + Debug>(&self, value: &T, execution_time_ms: u64) {
        let severity = Severity::from(self.descriptor.exit_level);
        if !self.emitter.is_enabled(severity) {
            return;
        }

        let result = if self.descriptor.log_result {
            Some(self.masker.mask_loggable(value)).filter(|v| !v.is_null())
        } else {
            None
        };
        let event = LifecycleEvent::Exit {
            operation: self.operation.clone(),
            class: self.class.clone(),
            method: self.method.clone(),
            execution_time_ms,
            result,
        };
        self.emit(
            severity,
            RecordKind::Lifecycle,
            "Operation completed",
            &event,
            current_fields(),
        );
    }

    fn check_threshold(&self, execution_time_ms: u64) {
        if execution_time_ms <= self.threshold_ms {
            return;
        }
        metrics::inc_threshold_breach(&self.operation);
        let warning = PerformanceWarning {
            operation: self.operation.clone(),
            execution_time_ms,
            threshold_ms: self.threshold_ms,
        };
        self.emit(
            Severity::Warn,
            RecordKind::Performance,
            "Performance threshold exceeded",
            &warning,
            current_fields(),
        );
    }

    /// 错误从不受级别门控
    fn error<E: Display>(&self, err: &E, execution_time_ms: u64) {
        let event = LifecycleEvent::Error {
            operation: self.operation.clone(),
            class: self.class.clone(),
            method: self.method.clone(),
            execution_time_ms,
            exception_type: std::any::type_name::<E>().to_string(),
            exception_message: self.masker.mask(&err.to_string()).into_owned(),
        };
        self.emit(
            Severity::Error,
            RecordKind::Lifecycle,
            "Operation failed",
            &event,
            current_fields(),
        );
    }

    fn audit<E: Display>(&self, status: AuditStatus, execution_time_ms: u64, err: Option<&E>) {
        let record = AuditRecord {
            audit_type: self.descriptor.audit_type.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation: self.operation.clone(),
            operation_id: self.operation_id.clone(),
            status,
            execution_time_ms,
            correlation_id: context::get(ContextKey::CorrelationId),
            user_id: context::get(ContextKey::UserId),
            error_type: err.map(|_| std::any::type_name::<E>().to_string()),
            error_message: err.map(|e| self.masker.mask(&e.to_string()).into_owned()),
        };
        self.emit(
            Severity::Info,
            RecordKind::Audit,
            "AUDIT",
            &record,
            current_fields(),
        );
    }

    fn emit(
        &self,
        severity: Severity,
        kind: RecordKind,
        message: &str,
        payload: &impl Serialize,
        context: Vec<(String, String)>,
    ) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, operation = %self.operation, "Failed to serialize log record");
                return;
            }
        };
        self.emitter.emit(EmittedRecord {
            severity,
            kind,
            message: message.to_string(),
            payload,
            context,
        });
    }
}

fn current_fields() -> Vec<(String, String)> {
    context::with_current(CorrelationContext::to_fields).unwrap_or_default()
}
