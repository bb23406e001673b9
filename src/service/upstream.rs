//! 下游通知客户端：带超时/重试的最小实现
//!
//! 每次出站请求都带上关联标识头；在派生任务中调用时使用显式快照。

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::{
    config::{PropagationConfig, ServiceConfig},
    infrastructure::{
        context::CorrelationContext,
        propagation::{CorrelationRequestExt, PropagationStyle},
    },
};

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    pub notify_url: Option<String>,
    pub timeout: Duration,
    pub retries: usize,
    /// 为 `None` 时不携带关联标识
    pub propagation: Option<PropagationStyle>,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(service: &ServiceConfig, propagation: &PropagationConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(service.upstream_timeout_ms);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            notify_url: service.notify_url.clone(),
            timeout,
            retries: service.upstream_retries,
            propagation: propagation.enabled.then(|| propagation.style()),
            client,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.notify_url.is_some()
    }

    /// 发送通知；未配置下游时直接返回
    ///
    /// `ctx` 是调用方作用域的快照，调用可能已不在原作用域中执行。
    pub async fn notify<T: Serialize + ?Sized>(
        &self,
        ctx: &CorrelationContext,
        body: &T,
    ) -> anyhow::Result<()> {
        let Some(url) = self.notify_url.as_deref() else {
            return Ok(());
        };

        let mut attempt = 0usize;
        loop {
            let start = Instant::now();
            let mut req = self.client.post(url).json(body);
            if let Some(style) = self.propagation {
                req = req.with_context(ctx, style);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    crate::metrics::observe_upstream_latency_ms(start.elapsed().as_millis(), true);
                    return Ok(());
                }
                Ok(resp) => {
                    crate::metrics::observe_upstream_latency_ms(start.elapsed().as_millis(), false);
                    tracing::warn!(status = %resp.status(), attempt, "Notification rejected by upstream");
                    attempt += 1;
                }
                Err(e) => {
                    crate::metrics::observe_upstream_latency_ms(start.elapsed().as_millis(), false);
                    tracing::warn!(error = %e, attempt, "Notification request failed");
                    attempt += 1;
                }
            }
            if attempt > self.retries {
                break;
            }
            let backoff = 50 * (1u64 << attempt.min(5)); // 简单指数回退，最大 ~1600ms
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
        Err(anyhow::anyhow!("upstream notification failed after retries"))
    }
}
