//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::{net::SocketAddr, path::Path};

use anyhow::{Context, Result};
use axum::http::HeaderName;
use serde::{Deserialize, Serialize};

use crate::infrastructure::{masking::MaskingRuleSet, propagation::PropagationStyle};

/// 应用配置结构体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub masking: MaskingConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub interceptor: InterceptorConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
}

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub bind_addr: String,
    /// 支付完成后通知的下游地址（不设置则不通知）
    pub notify_url: Option<String>,
    pub upstream_timeout_ms: u64,
    pub upstream_retries: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_file_logging: bool,
    /// 日志文件路径，其所在目录用作滚动目录，文件名用作前缀
    pub log_file_path: Option<String>,
}

/// 脱敏配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    pub enabled: bool,
    /// 追加在内置规则之后，按顺序应用
    pub custom_rules: Vec<CustomMaskingRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomMaskingRule {
    #[serde(default)]
    pub name: Option<String>,
    pub pattern: String,
    pub replacement: String,
}

/// 关联 ID 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub enabled: bool,
    pub header_name: String,
    pub generate_if_missing: bool,
    pub include_client_ip: bool,
    pub include_request_uri: bool,
}

/// 拦截器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    pub enabled: bool,
    pub performance_threshold_ms: u64,
}

/// 出站传播配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub enabled: bool,
    /// 是否额外携带用户 ID
    pub include_user_id: bool,
}

impl PropagationConfig {
    pub fn style(&self) -> PropagationStyle {
        if self.include_user_id {
            PropagationStyle::WithUser
        } else {
            PropagationStyle::Standard
        }
    }
}

/// 布尔环境变量：1/true/yes 为真，0/false/no 为假，其余取默认值
fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "ironlog".into()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8088".into()),
            notify_url: std::env::var("NOTIFY_URL").ok().filter(|v| !v.is_empty()),
            upstream_timeout_ms: std::env::var("UPSTREAM_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2000),
            upstream_retries: std::env::var("UPSTREAM_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
            enable_file_logging: env_flag("LOG_FILE_ENABLED", false),
            log_file_path: std::env::var("LOG_FILE_PATH").ok(),
        }
    }
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("MASKING_ENABLED", true),
            custom_rules: Vec::new(),
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("CORRELATION_ENABLED", true),
            header_name: std::env::var("CORRELATION_HEADER_NAME")
                .unwrap_or_else(|_| "X-Correlation-ID".into()),
            generate_if_missing: env_flag("CORRELATION_GENERATE_IF_MISSING", true),
            include_client_ip: env_flag("CORRELATION_INCLUDE_CLIENT_IP", true),
            include_request_uri: env_flag("CORRELATION_INCLUDE_REQUEST_URI", true),
        }
    }
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("INTERCEPTOR_ENABLED", true),
            performance_threshold_ms: std::env::var("PERFORMANCE_THRESHOLD_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        }
    }
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("PROPAGATION_ENABLED", true),
            include_user_id: env_flag("PROPAGATION_INCLUDE_USER_ID", false),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            masking: MaskingConfig::default(),
            correlation: CorrelationConfig::default(),
            interceptor: InterceptorConfig::default(),
            propagation: PropagationConfig::default(),
        })
    }

    /// 从配置文件加载配置（缺省的段和字段取环境变量默认值）
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        self.service
            .bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("BIND_ADDR is not a socket address: {}", self.service.bind_addr))?;

        // 验证日志级别
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        // 验证日志格式
        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        if HeaderName::from_bytes(self.correlation.header_name.as_bytes()).is_err() {
            anyhow::bail!(
                "CORRELATION_HEADER_NAME is not a valid header name: {}",
                self.correlation.header_name
            );
        }

        if self.interceptor.performance_threshold_ms == 0 {
            anyhow::bail!("PERFORMANCE_THRESHOLD_MS must be positive");
        }

        // 自定义规则在启动时编译，失败即终止
        MaskingRuleSet::from_config(&self.masking).context("Invalid custom masking rule")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn base_config() -> Config {
        Config {
            service: ServiceConfig {
                bind_addr: "127.0.0.1:8088".into(),
                ..ServiceConfig::default()
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                enable_file_logging: false,
                log_file_path: None,
            },
            correlation: CorrelationConfig {
                header_name: "X-Correlation-ID".into(),
                ..CorrelationConfig::default()
            },
            interceptor: InterceptorConfig {
                enabled: true,
                performance_threshold_ms: 1000,
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "payments"
bind_addr = "0.0.0.0:9090"

[logging]
level = "debug"
format = "json"

[masking]
enabled = true

[[masking.custom_rules]]
name = "account_ref"
pattern = 'ACC-(\d{{2}})\d+'
replacement = "ACC-${{1}}****"

[correlation]
header_name = "X-Trace-ID"
generate_if_missing = false

[interceptor]
performance_threshold_ms = 250

[propagation]
include_user_id = true
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.service.name, "payments");
        assert_eq!(config.service.bind_addr, "0.0.0.0:9090");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.masking.custom_rules.len(), 1);
        assert_eq!(config.masking.custom_rules[0].pattern, r"ACC-(\d{2})\d+");
        assert_eq!(config.masking.custom_rules[0].replacement, "ACC-${1}****");
        assert_eq!(config.correlation.header_name, "X-Trace-ID");
        assert!(!config.correlation.generate_if_missing);
        assert_eq!(config.interceptor.performance_threshold_ms, 250);
        assert_eq!(config.propagation.style(), PropagationStyle::WithUser);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_missing_file_uses_env() {
        let config = Config::from_env_and_file(Some("/nonexistent/ironlog.toml")).unwrap();
        assert!(!config.correlation.header_name.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(base_config().validate().is_ok());

        let mut bad_level = base_config();
        bad_level.logging.level = "verbose".into();
        assert!(bad_level.validate().is_err());

        let mut bad_format = base_config();
        bad_format.logging.format = "xml".into();
        assert!(bad_format.validate().is_err());

        let mut bad_header = base_config();
        bad_header.correlation.header_name = "X Correlation".into();
        assert!(bad_header.validate().is_err());

        let mut zero_threshold = base_config();
        zero_threshold.interceptor.performance_threshold_ms = 0;
        assert!(zero_threshold.validate().is_err());

        let mut bad_rule = base_config();
        bad_rule.masking.custom_rules.push(CustomMaskingRule {
            name: None,
            pattern: "([unclosed".into(),
            replacement: "***".into(),
        });
        let err = bad_rule.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid custom masking rule"));
    }

    #[test]
    fn test_propagation_style() {
        let standard = PropagationConfig {
            enabled: true,
            include_user_id: false,
        };
        assert_eq!(standard.style(), PropagationStyle::Standard);
    }
}
