//! 入站关联标识推导
//!
//! 从传输层头部推导关联 ID、事务 ID、客户端 IP 等，生成一次请求作用域的初始上下文。
//! 这里只做纯推导，不接触任何全局状态；由边界适配器（axum 中间件）负责开启作用域。

use std::{collections::HashMap, net::IpAddr};

use axum::http::HeaderMap;
use uuid::Uuid;

use crate::{
    config::CorrelationConfig,
    infrastructure::context::{ContextKey, CorrelationContext},
};

pub const HEADER_CORRELATION_ID: &str = "X-Correlation-ID";
pub const HEADER_TRANSACTION_ID: &str = "X-Transaction-ID";
pub const HEADER_REQUEST_ID: &str = "X-Request-ID";
pub const HEADER_USER_ID: &str = "X-User-ID";

/// 代理链头部，按顺序检查
const CLIENT_IP_HEADERS: [&str; 3] = ["X-Forwarded-For", "X-Real-IP", "Proxy-Client-IP"];

/// 可以按名称读取头部的来源
pub trait HeaderSource {
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderSource for HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }
}

/// 头部名不区分大小写
impl HeaderSource for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 非空白的头部值
fn non_blank<'a>(headers: &'a impl HeaderSource, name: &str) -> Option<&'a str> {
    headers
        .header(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// 一次入站请求中与上下文相关的部分
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a, H: HeaderSource> {
    pub headers: &'a H,
    pub peer_addr: Option<IpAddr>,
    pub uri: &'a str,
    pub method: &'a str,
    /// 认证层识别出的用户（若有）
    pub user_id: Option<&'a str>,
}

/// 按配置推导请求作用域的初始上下文
#[derive(Debug, Clone)]
pub struct CorrelationExtractor {
    config: CorrelationConfig,
}

impl CorrelationExtractor {
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// 生成新的关联 ID
    pub fn generate() -> String {
        Uuid::new_v4().to_string()
    }

    /// 配置的头部 → X-Request-ID → 生成（若允许）→ 不设置
    pub fn derive_correlation_id(&self, headers: &impl HeaderSource) -> Option<String> {
        non_blank(headers, &self.config.header_name)
            .or_else(|| non_blank(headers, HEADER_REQUEST_ID))
            .map(str::to_string)
            .or_else(|| self.config.generate_if_missing.then(Self::generate))
    }

    /// 依次检查代理头部，逗号分隔时取第一个；都没有时使用传输层对端地址
    pub fn derive_client_ip(
        &self,
        headers: &impl HeaderSource,
        peer_addr: Option<IpAddr>,
    ) -> Option<String> {
        for name in CLIENT_IP_HEADERS {
            let Some(value) = non_blank(headers, name) else {
                continue;
            };
            if value.eq_ignore_ascii_case("unknown") {
                continue;
            }
            let first = value.split(',').next().unwrap_or(value).trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
        peer_addr.map(|ip| ip.to_string())
    }

    pub fn extract<H: HeaderSource>(&self, request: &InboundRequest<'_, H>) -> CorrelationContext {
        let mut ctx = CorrelationContext::new();

        if let Some(correlation_id) = self.derive_correlation_id(request.headers) {
            ctx = ctx.with(ContextKey::CorrelationId, correlation_id);
        }

        if let Some(transaction_id) = non_blank(request.headers, HEADER_TRANSACTION_ID) {
            ctx = ctx.with(ContextKey::TransactionId, transaction_id);
        }

        if self.config.include_client_ip {
            if let Some(ip) = self.derive_client_ip(request.headers, request.peer_addr) {
                ctx = ctx.with(ContextKey::ClientIp, ip);
            }
        }

        if self.config.include_request_uri {
            ctx = ctx
                .with(ContextKey::RequestUri, request.uri)
                .with(ContextKey::RequestMethod, request.method);
        }

        if let Some(user_id) = request.user_id {
            ctx = ctx.with(ContextKey::UserId, user_id);
        }

        ctx
    }
}

impl Default for CorrelationExtractor {
    fn default() -> Self {
        Self::new(CorrelationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn extractor(generate_if_missing: bool) -> CorrelationExtractor {
        CorrelationExtractor::new(CorrelationConfig {
            generate_if_missing,
            ..CorrelationConfig::default()
        })
    }

    #[test]
    fn test_correlation_id_prefers_configured_header() {
        let h = headers(&[("x-correlation-id", "corr-1"), ("X-Request-ID", "req-1")]);
        assert_eq!(
            extractor(true).derive_correlation_id(&h).as_deref(),
            Some("corr-1")
        );
    }

    #[test]
    fn test_correlation_id_falls_back_to_request_id() {
        let h = headers(&[("X-Correlation-ID", "  "), ("X-Request-ID", "req-1")]);
        assert_eq!(
            extractor(true).derive_correlation_id(&h).as_deref(),
            Some("req-1")
        );
    }

    #[test]
    fn test_correlation_id_generated_or_unset() {
        let h = headers(&[]);
        let generated = extractor(true).derive_correlation_id(&h).unwrap();
        assert!(Uuid::parse_str(&generated).is_ok());
        assert_eq!(extractor(false).derive_correlation_id(&h), None);
    }

    #[test]
    fn test_custom_header_name() {
        let ext = CorrelationExtractor::new(CorrelationConfig {
            header_name: "X-Trace-Id".into(),
            ..CorrelationConfig::default()
        });
        let h = headers(&[("X-Trace-Id", "trace-9"), ("X-Correlation-ID", "ignored")]);
        assert_eq!(ext.derive_correlation_id(&h).as_deref(), Some("trace-9"));
    }

    #[test]
    fn test_client_ip_takes_first_proxy_entry() {
        let h = headers(&[("X-Forwarded-For", "203.0.113.7, 10.0.0.1, 10.0.0.2")]);
        assert_eq!(
            extractor(true).derive_client_ip(&h, None).as_deref(),
            Some("203.0.113.7")
        );
    }

    #[test]
    fn test_client_ip_header_order_and_unknown() {
        let h = headers(&[
            ("X-Forwarded-For", "unknown"),
            ("X-Real-IP", "198.51.100.4"),
            ("Proxy-Client-IP", "192.0.2.1"),
        ]);
        assert_eq!(
            extractor(true).derive_client_ip(&h, None).as_deref(),
            Some("198.51.100.4")
        );
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            extractor(true)
                .derive_client_ip(&headers(&[]), Some(peer))
                .as_deref(),
            Some("127.0.0.1")
        );
        assert_eq!(extractor(true).derive_client_ip(&headers(&[]), None), None);
    }

    #[test]
    fn test_extract_full_context() {
        let mut h = HeaderMap::new();
        h.insert("x-correlation-id", HeaderValue::from_static("corr-7"));
        h.insert("x-transaction-id", HeaderValue::from_static("tx-7"));
        h.insert("x-real-ip", HeaderValue::from_static("198.51.100.9"));

        let request = InboundRequest {
            headers: &h,
            peer_addr: None,
            uri: "/api/payments",
            method: "POST",
            user_id: Some("alice"),
        };
        let ctx = extractor(true).extract(&request);

        assert_eq!(ctx.get(ContextKey::CorrelationId), Some("corr-7"));
        assert_eq!(ctx.get(ContextKey::TransactionId), Some("tx-7"));
        assert_eq!(ctx.get(ContextKey::ClientIp), Some("198.51.100.9"));
        assert_eq!(ctx.get(ContextKey::RequestUri), Some("/api/payments"));
        assert_eq!(ctx.get(ContextKey::RequestMethod), Some("POST"));
        assert_eq!(ctx.get(ContextKey::UserId), Some("alice"));
    }

    #[test]
    fn test_extract_respects_include_flags() {
        let ext = CorrelationExtractor::new(CorrelationConfig {
            include_client_ip: false,
            include_request_uri: false,
            generate_if_missing: false,
            ..CorrelationConfig::default()
        });
        let h = headers(&[("X-Forwarded-For", "203.0.113.7")]);
        let request = InboundRequest {
            headers: &h,
            peer_addr: None,
            uri: "/x",
            method: "GET",
            user_id: None,
        };
        assert!(ext.extract(&request).is_empty());
    }
}
