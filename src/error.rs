//! 错误类型
//!
//! 只覆盖插桩层自身的错误：配置错误（启动期）与上下文使用错误。
//! 被包装的业务错误永远原样返回，不会被转换成这里的任何变体。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::infrastructure::context::{self, ContextKey};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// 脱敏规则无法编译（仅在构建规则集时出现）
    #[error("invalid masking pattern `{pattern}`: {source}")]
    InvalidMaskingPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// 试图覆盖一个在作用域生命周期内不可变的键
    #[error("context key `{}` is already bound and cannot be overwritten", .0.as_str())]
    ImmutableContextKey(ContextKey),

    /// 当前执行单元没有激活的上下文作用域
    #[error("no correlation scope is active on the current execution unit")]
    NoActiveScope,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LoggingError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// 是否为启动期致命错误
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMaskingPattern { .. } | Self::InvalidConfig(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorCode {
    BadRequest,
    NotFound,
    Internal,
    // 业务错误码
    InvalidAmount,
    InvalidCard,
    PaymentDeclined,
}

impl AppErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppErrorCode::BadRequest => "bad_request",
            AppErrorCode::NotFound => "not_found",
            AppErrorCode::Internal => "internal",
            AppErrorCode::InvalidAmount => "invalid_amount",
            AppErrorCode::InvalidCard => "invalid_card",
            AppErrorCode::PaymentDeclined => "payment_declined",
        }
    }
}

/// HTTP 层错误
#[derive(Debug, Clone)]
pub struct AppError {
    pub code: AppErrorCode,
    pub message: String,
    pub status: StatusCode,
    pub correlation_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.as_str(),
            message: &self.message,
            correlation_id: self.correlation_id.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl AppError {
    /// 关联 ID 取自当前作用域
    pub fn new(code: AppErrorCode, status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            status,
            correlation_id: context::get(ContextKey::CorrelationId),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::BadRequest, StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::NotFound, StatusCode::NOT_FOUND, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Internal, StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}
