//! 支付授权（演示业务）
//!
//! 授权调用经过 `OperationInterceptor`，开启审计；授权成功后把通知交给后台任务，
//! 后台任务带着请求作用域的快照运行。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    infrastructure::{
        context::{self, ContextKey},
        interceptor::{CallSite, OperationDescriptor, OperationInterceptor},
        propagation,
    },
    service::upstream::UpstreamClient,
};

pub const AUTHORIZE_OPERATION: &str = "AUTHORIZE_PAYMENT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub card_number: String,
    #[serde(default)]
    pub cvv: Option<String>,
    pub amount_cents: u64,
    pub currency: String,
    #[serde(default)]
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub payment_id: String,
    pub status: String,
    pub card_last4: String,
    pub amount_cents: u64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),
    #[error("invalid card number {0}")]
    InvalidCard(String),
    #[error("card {0} declined by issuer")]
    Declined(String),
}

const SUPPORTED_CURRENCIES: [&str; 3] = ["EUR", "USD", "GBP"];

/// Luhn 校验
fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

/// 去掉空格和连字符后的卡号
fn normalize_card(card_number: &str) -> String {
    card_number
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

/// 纯业务规则，不涉及日志
pub fn authorize(request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
    if request.amount_cents == 0 {
        return Err(PaymentError::InvalidAmount);
    }
    let currency = request.currency.to_ascii_uppercase();
    if !SUPPORTED_CURRENCIES.contains(&currency.as_str()) {
        return Err(PaymentError::UnsupportedCurrency(request.currency.clone()));
    }

    let card = normalize_card(&request.card_number);
    if !(12..=19).contains(&card.len()) || !card.chars().all(|c| c.is_ascii_digit()) {
        return Err(PaymentError::InvalidCard(request.card_number.clone()));
    }
    if !luhn_valid(&card) {
        return Err(PaymentError::Declined(card));
    }

    Ok(PaymentReceipt {
        payment_id: Uuid::new_v4().to_string(),
        status: "AUTHORIZED".to_string(),
        card_last4: card[card.len() - 4..].to_string(),
        amount_cents: request.amount_cents,
        currency,
    })
}

#[derive(Debug, Clone, Serialize)]
struct PaymentNotification<'a> {
    event: &'a str,
    payment_id: &'a str,
    amount_cents: u64,
    currency: &'a str,
}

#[derive(Debug, Clone)]
pub struct PaymentService {
    interceptor: Arc<OperationInterceptor>,
    upstream: Arc<UpstreamClient>,
    site: CallSite,
}

impl PaymentService {
    pub fn new(interceptor: Arc<OperationInterceptor>, upstream: Arc<UpstreamClient>) -> Self {
        let site = CallSite::method(
            "PaymentService",
            "authorize",
            OperationDescriptor::named(AUTHORIZE_OPERATION).audit(true),
        );
        Self {
            interceptor,
            upstream,
            site,
        }
    }

    pub async fn authorize(&self, request: PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
        // 参数切片是临时值，不能跨 await 存活
        let authorized =
            self.interceptor
                .intercept_async(&self.site, &[("request", &request)], async {
                    authorize(&request)
                });
        let receipt = authorized.await?;

        if self.upstream.is_configured() {
            self.notify_in_background(&receipt);
        }
        Ok(receipt)
    }

    /// 快照在此同步获取，后台任务不会读到请求结束后被清空的作用域
    fn notify_in_background(&self, receipt: &PaymentReceipt) {
        let upstream = Arc::clone(&self.upstream);
        let payment_id = receipt.payment_id.clone();
        let amount_cents = receipt.amount_cents;
        let currency = receipt.currency.clone();

        propagation::spawn_with_context(async move {
            let ctx = context::snapshot().unwrap_or_default();
            let body = PaymentNotification {
                event: "payment.authorized",
                payment_id: &payment_id,
                amount_cents,
                currency: &currency,
            };
            if let Err(e) = upstream.notify(&ctx, &body).await {
                tracing::warn!(
                    error = %e,
                    correlation_id = ?ctx.get(ContextKey::CorrelationId),
                    "Payment notification failed"
                );
            }
        });
    }
}
