use std::sync::Arc;

use anyhow::Context;

use crate::{
    config::Config,
    infrastructure::{
        correlation::CorrelationExtractor,
        emitter::{EventEmitter, TracingEmitter},
        interceptor::OperationInterceptor,
        masking::DataMasker,
    },
    service::{payment_service::PaymentService, upstream::UpstreamClient},
};

/// 应用状态
/// 包含所有共享资源（全部只读，可在任意并发请求间共享）
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub masker: Arc<DataMasker>,
    pub interceptor: Arc<OperationInterceptor>,
    pub extractor: Arc<CorrelationExtractor>,
    pub upstream: Arc<UpstreamClient>,
    pub payments: Arc<PaymentService>,
}

impl AppState {
    /// 创建新的应用状态，事件输出到 tracing
    pub fn new(config: Arc<Config>, masker: Arc<DataMasker>) -> anyhow::Result<Self> {
        Self::with_parts(config, masker, Arc::new(TracingEmitter::new()))
    }

    /// 按配置编译脱敏规则；自定义规则非法时启动失败
    pub fn build_masker(config: &Config) -> anyhow::Result<Arc<DataMasker>> {
        let masker =
            DataMasker::from_config(&config.masking).context("Failed to build masking rules")?;
        Ok(Arc::new(masker))
    }

    /// 指定脱敏器与事件输出端（测试与嵌入方使用）
    pub fn with_parts(
        config: Arc<Config>,
        masker: Arc<DataMasker>,
        emitter: Arc<dyn EventEmitter>,
    ) -> anyhow::Result<Self> {
        let interceptor = Arc::new(OperationInterceptor::new(
            Arc::clone(&masker),
            emitter,
            &config.interceptor,
        ));
        let extractor = Arc::new(CorrelationExtractor::new(config.correlation.clone()));
        let upstream = Arc::new(
            UpstreamClient::new(&config.service, &config.propagation)
                .context("Failed to build upstream client")?,
        );
        let payments = Arc::new(PaymentService::new(
            Arc::clone(&interceptor),
            Arc::clone(&upstream),
        ));

        tracing::info!(
            masking_rules = masker.rule_set().len(),
            masking_enabled = masker.is_enabled(),
            interceptor_enabled = interceptor.is_enabled(),
            "Application state initialized"
        );

        Ok(Self {
            config,
            masker,
            interceptor,
            extractor,
            upstream,
            payments,
        })
    }
}
