use std::sync::Arc;

use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::{
    api::response::{success_response, ApiResponse},
    app_state::AppState,
    error::{AppError, AppErrorCode},
    infrastructure::context::{self, ContextKey},
    service::{PaymentError, PaymentReceipt, PaymentRequest},
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

pub async fn api_health(
    State(st): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<HealthResponse>>, AppError> {
    crate::metrics::count_ok("GET /health");
    success_response(HealthResponse {
        status: "ok".into(),
        service: st.config.service.name.clone(),
        version: env!("CARGO_PKG_VERSION").into(),
        correlation_id: context::get(ContextKey::CorrelationId),
    })
}

/// 未匹配路由
pub async fn not_found(uri: Uri) -> AppError {
    crate::metrics::count_err("fallback");
    AppError::not_found(format!("no route for {}", uri.path()))
}

pub async fn metrics() -> impl IntoResponse {
    crate::metrics::render_prometheus()
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        let (code, status) = match &err {
            PaymentError::InvalidAmount => (AppErrorCode::InvalidAmount, StatusCode::BAD_REQUEST),
            PaymentError::UnsupportedCurrency(_) => {
                (AppErrorCode::BadRequest, StatusCode::BAD_REQUEST)
            }
            PaymentError::InvalidCard(_) => {
                (AppErrorCode::InvalidCard, StatusCode::UNPROCESSABLE_ENTITY)
            }
            PaymentError::Declined(_) => (AppErrorCode::PaymentDeclined, StatusCode::PAYMENT_REQUIRED),
        };
        // 带卡号的错误消息不返回给客户端
        let message = match &err {
            PaymentError::InvalidCard(_) => "invalid card number".to_string(),
            PaymentError::Declined(_) => "card declined by issuer".to_string(),
            other => other.to_string(),
        };
        AppError::new(code, status, message)
    }
}

pub async fn create_payment(
    State(st): State<Arc<AppState>>,
    Json(req): Json<PaymentRequest>,
) -> Result<Json<ApiResponse<PaymentReceipt>>, AppError> {
    match st.payments.authorize(req).await {
        Ok(receipt) => {
            crate::metrics::count_ok("POST /api/payments");
            success_response(receipt)
        }
        Err(e) => {
            crate::metrics::count_err("POST /api/payments");
            Err(e.into())
        }
    }
}
