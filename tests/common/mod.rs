//! 测试辅助模块
//! 提供测试工具和辅助函数

#![allow(dead_code)]

use std::{fmt, sync::Arc};

use ironlog::{
    config::{Config, InterceptorConfig},
    infrastructure::{
        emitter::{EventEmitter, MemoryEmitter},
        interceptor::OperationInterceptor,
        masking::DataMasker,
    },
    AppState,
};
use serde::Serialize;

/// 内置规则的脱敏器
pub fn masker() -> Arc<DataMasker> {
    Arc::new(DataMasker::with_default_rules().expect("built-in rules compile"))
}

/// 记录全部级别的拦截器
pub fn recording_interceptor(threshold_ms: u64) -> (Arc<OperationInterceptor>, Arc<MemoryEmitter>) {
    let emitter = Arc::new(MemoryEmitter::default());
    let sink: Arc<dyn EventEmitter> = emitter.clone();
    let interceptor = OperationInterceptor::new(
        masker(),
        sink,
        &InterceptorConfig {
            enabled: true,
            performance_threshold_ms: threshold_ms,
        },
    );
    (Arc::new(interceptor), emitter)
}

/// 使用内存输出端的应用状态
pub fn test_app_state(config: Config) -> (Arc<AppState>, Arc<MemoryEmitter>) {
    let emitter = Arc::new(MemoryEmitter::default());
    let state = AppState::with_parts(Arc::new(config), masker(), emitter.clone())
        .expect("Failed to create test app state");
    (Arc::new(state), emitter)
}

#[derive(Debug, Serialize)]
pub struct CardPayment {
    pub card_number: String,
    pub holder_email: String,
    pub amount_cents: u64,
}

impl CardPayment {
    pub fn sample() -> Self {
        Self {
            card_number: "4111111234561234".into(),
            holder_email: "john.doe@example.com".into(),
            amount_cents: 4200,
        }
    }
}

/// 业务错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    pub code: u16,
    pub detail: String,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gateway error {}: {}", self.code, self.detail)
    }
}

impl std::error::Error for GatewayError {}
