//! IronLog - 支付链路的结构化日志与关联追踪
//!
//! 敏感数据脱敏、请求级关联上下文、操作拦截（生命周期事件 / 性能阈值 / 审计）、
//! 出站调用的关联标识传播。

pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod metrics;
pub mod service;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::{AppError, AppErrorCode, LoggingError};

pub mod prelude {
    pub use crate::{
        error::LoggingError,
        infrastructure::{
            context::{self, ContextKey, CorrelationContext},
            correlation::CorrelationExtractor,
            emitter::{EventEmitter, MemoryEmitter, Severity, TracingEmitter},
            interceptor::{CallSite, LogLevel, MethodPolicy, OperationDescriptor, OperationInterceptor},
            masking::{DataMasker, Loggable, MaskingRule, MaskingRuleSet},
            propagation::{self, CorrelationRequestExt, PropagationStyle},
        },
    };
}
