//! 日志系统配置模块
//! 支持结构化日志、日志级别配置和日志轮转
//!
//! 直接用 `tracing::info!` 写出的内容在落地前同样会被脱敏：
//! JSON 格式由 `MaskingJsonFormat` 在编码前逐字段脱敏，
//! 文本格式由 `MaskingMakeWriter` 对整行脱敏。

use std::{
    fmt::Write as _,
    io::{self, Write},
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{
        self,
        format::{FormatEvent, FormatFields, Writer},
        time::{ChronoUtc, FormatTime},
        FmtContext, FormattedFields, MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::{
    config::LoggingConfig,
    infrastructure::{
        context::{self, CorrelationContext},
        masking::DataMasker,
    },
};

const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_LOG_FILE: &str = "ironlog.log";

/// 持有文件日志的后台写线程；丢弃后缓冲区被刷新，文件日志停止
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 为每条日志创建一个脱敏写入器（文本格式使用；JSON 格式见 `MaskingJsonFormat`）
#[derive(Clone)]
pub struct MaskingMakeWriter<M> {
    inner: M,
    masker: Arc<DataMasker>,
}

impl<M> MaskingMakeWriter<M> {
    pub fn new(inner: M, masker: Arc<DataMasker>) -> Self {
        Self { inner, masker }
    }
}

impl<'a, M> MakeWriter<'a> for MaskingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = MaskingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        MaskingWriter::new(self.inner.make_writer(), Arc::clone(&self.masker))
    }
}

/// fmt 层把一条格式化好的记录一次性写入，这里对整段内容脱敏后再交给下游
pub struct MaskingWriter<W> {
    inner: W,
    masker: Arc<DataMasker>,
}

impl<W: Write> MaskingWriter<W> {
    pub fn new(inner: W, masker: Arc<DataMasker>) -> Self {
        Self { inner, masker }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let masked = self.masker.mask(&text);
        self.inner.write_all(masked.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// 字段值脱敏。有些规则依赖字段名（如 `cvv`），所以把 `name: value` 一起匹配一次，
/// 命中后去掉字段名前缀；否则只对值本身脱敏。
fn mask_field(masker: &DataMasker, name: &str, value: &str) -> String {
    let prefix = format!("{}: ", name);
    let keyed = format!("{}{}", prefix, value);
    let masked = masker.mask(&keyed);
    if masked != keyed.as_str() {
        if let Some(rest) = masked.strip_prefix(prefix.as_str()) {
            return rest.to_string();
        }
        if let Some(rest) = masked.strip_prefix(name) {
            return rest
                .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
                .to_string();
        }
    }
    masker.mask(value).into_owned()
}

/// 收集事件字段，每个值在进入 JSON 之前脱敏
struct MaskingVisitor<'a> {
    masker: &'a DataMasker,
    fields: Map<String, Value>,
}

impl<'a> MaskingVisitor<'a> {
    fn new(masker: &'a DataMasker) -> Self {
        Self {
            masker,
            fields: Map::new(),
        }
    }

    fn insert_text(&mut self, field: &Field, text: &str) {
        let masked = mask_field(self.masker, field.name(), text);
        self.fields
            .insert(field.name().to_string(), Value::String(masked));
    }

    /// 数字也可能是卡号；被规则改写时以字符串形式保留
    fn insert_number(&mut self, field: &Field, number: Value) {
        let text = number.to_string();
        let masked = mask_field(self.masker, field.name(), &text);
        let value = if masked == text {
            number
        } else {
            Value::String(masked)
        };
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for MaskingVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert_text(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert_number(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert_number(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert_text(field, &value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert_text(field, &format!("{:?}", value));
    }
}

/// JSON 行格式：消息、字段、关联上下文与 span 字段逐个脱敏后再编码，每行都是合法 JSON
#[derive(Clone)]
pub struct MaskingJsonFormat {
    masker: Arc<DataMasker>,
    timer: ChronoUtc,
}

impl MaskingJsonFormat {
    pub fn new(masker: Arc<DataMasker>) -> Self {
        Self {
            masker,
            timer: ChronoUtc::rfc_3339(),
        }
    }

    fn masked_context(&self) -> Option<Map<String, Value>> {
        let bindings = context::with_current(CorrelationContext::to_fields)?;
        if bindings.is_empty() {
            return None;
        }
        Some(
            bindings
                .into_iter()
                .map(|(key, value)| {
                    let masked = mask_field(&self.masker, &key, &value);
                    (key, Value::String(masked))
                })
                .collect(),
        )
    }
}

impl<S, N> FormatEvent<S, N> for MaskingJsonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let mut record = Map::new();

        let mut timestamp = String::new();
        if self.timer.format_time(&mut Writer::new(&mut timestamp)).is_ok() {
            record.insert("timestamp".into(), Value::String(timestamp));
        }
        record.insert("level".into(), Value::String(meta.level().to_string()));
        record.insert("target".into(), Value::String(meta.target().to_string()));

        let mut visitor = MaskingVisitor::new(&self.masker);
        event.record(&mut visitor);
        record.insert("fields".into(), Value::Object(visitor.fields));

        if let Some(bindings) = self.masked_context() {
            record.insert("context".into(), Value::Object(bindings));
        }

        if let Some(scope) = ctx.event_scope() {
            let spans: Vec<Value> = scope
                .from_root()
                .map(|span| {
                    let mut entry = Map::new();
                    entry.insert("name".into(), Value::String(span.name().to_string()));
                    if let Some(formatted) = span.extensions().get::<FormattedFields<N>>() {
                        if !formatted.fields.is_empty() {
                            let masked = self.masker.mask(&formatted.fields).into_owned();
                            entry.insert("fields".into(), Value::String(masked));
                        }
                    }
                    Value::Object(entry)
                })
                .collect();
            if !spans.is_empty() {
                record.insert("spans".into(), Value::Array(spans));
            }
        }

        let line = serde_json::to_string(&record).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{}", line)
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// 滚动目录与文件名前缀
fn file_target(config: &LoggingConfig) -> (&Path, &str) {
    let path = config.log_file_path.as_deref().map(Path::new);
    let dir = path
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new(DEFAULT_LOG_DIR));
    let prefix = path
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    (dir, prefix)
}

/// 初始化日志系统
pub fn init_logging(config: &LoggingConfig, masker: Arc<DataMasker>) -> Result<LoggingGuard> {
    let filter = build_filter(config);
    let json = config.format == "json";

    let (file_writer, file_guard) = if config.enable_file_logging {
        let (dir, prefix) = file_target(config);
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {:?}", dir))?;

        let file_appender = rolling::daily(dir, prefix);
        let (non_blocking_appender, guard) = non_blocking(file_appender);
        (Some(non_blocking_appender), Some(guard))
    } else {
        (None, None)
    };

    // 控制台日志
    let stdout_json = json.then(|| {
        fmt::layer()
            .event_format(MaskingJsonFormat::new(Arc::clone(&masker)))
            .with_writer(io::stdout)
    });
    let stdout_text = (!json).then(|| {
        fmt::layer()
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_writer(MaskingMakeWriter::new(io::stdout, Arc::clone(&masker)))
    });

    // 文件日志
    let file_json = file_writer.clone().filter(|_| json).map(|writer| {
        fmt::layer()
            .event_format(MaskingJsonFormat::new(Arc::clone(&masker)))
            .with_writer(writer)
    });
    let file_text = file_writer.filter(|_| !json).map(|writer| {
        fmt::layer()
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false)
            .with_writer(MaskingMakeWriter::new(writer, Arc::clone(&masker)))
    });

    Registry::default()
        .with(filter)
        .with(stdout_json)
        .with(stdout_text)
        .with(file_json)
        .with(file_text)
        .try_init()
        .context("Failed to install global tracing subscriber")?;

    tracing::debug!(
        format = %config.format,
        file_logging = config.enable_file_logging,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// 简化初始化（使用默认配置）
pub fn init_default_logging() -> Option<LoggingGuard> {
    let config = LoggingConfig::default();
    let masker = match DataMasker::with_default_rules() {
        Ok(masker) => Arc::new(masker),
        Err(e) => {
            eprintln!("Failed to build masking rules: {}", e);
            Arc::new(DataMasker::disabled())
        }
    };
    match init_logging(&config, masker) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        }
    }
}
