//! 事件输出
//!
//! 核心只依赖一个能力：按级别接收已脱敏的结构化记录，并回答 “该级别是否启用”。
//! `TracingEmitter` 接到 tracing 上；`MemoryEmitter` 把记录留在内存里供检查。

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;

/// tracing target：生命周期与性能记录
pub const OPERATION_TARGET: &str = "ironlog::operation";
/// tracing target：审计记录
pub const AUDIT_TARGET: &str = "audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Lifecycle,
    Performance,
    Audit,
}

/// 交给输出端的一条记录（payload 已脱敏）
#[derive(Debug, Clone, Serialize)]
pub struct EmittedRecord {
    pub severity: Severity,
    pub kind: RecordKind,
    pub message: String,
    pub payload: Value,
    /// 发出时所在作用域的关联字段
    pub context: Vec<(String, String)>,
}

impl EmittedRecord {
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub trait EventEmitter: Send + Sync {
    fn is_enabled(&self, severity: Severity) -> bool;

    fn emit(&self, record: EmittedRecord);
}

/// 输出到 tracing
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmitter;

impl TracingEmitter {
    pub fn new() -> Self {
        Self
    }
}

fn context_field(record: &EmittedRecord, key: &str) -> String {
    record.context_value(key).unwrap_or("-").to_string()
}

/// tracing 的级别必须是常量，这里逐级展开
macro_rules! emit_at {
    ($target:expr, $level:expr, $record:expr, $payload:expr) => {{
        let correlation_id = context_field($record, "correlation_id");
        let operation_id = context_field($record, "operation_id");
        match $level {
            Severity::Trace => tracing::trace!(target: $target, correlation_id = %correlation_id, operation_id = %operation_id, "{}: {}", $record.message, $payload),
            Severity::Debug => tracing::debug!(target: $target, correlation_id = %correlation_id, operation_id = %operation_id, "{}: {}", $record.message, $payload),
            Severity::Info => tracing::info!(target: $target, correlation_id = %correlation_id, operation_id = %operation_id, "{}: {}", $record.message, $payload),
            Severity::Warn => tracing::warn!(target: $target, correlation_id = %correlation_id, operation_id = %operation_id, "{}: {}", $record.message, $payload),
            Severity::Error => tracing::error!(target: $target, correlation_id = %correlation_id, operation_id = %operation_id, "{}: {}", $record.message, $payload),
        }
    }};
}

impl EventEmitter for TracingEmitter {
    fn is_enabled(&self, severity: Severity) -> bool {
        match severity {
            Severity::Trace => tracing::enabled!(target: OPERATION_TARGET, tracing::Level::TRACE),
            Severity::Debug => tracing::enabled!(target: OPERATION_TARGET, tracing::Level::DEBUG),
            Severity::Info => tracing::enabled!(target: OPERATION_TARGET, tracing::Level::INFO),
            Severity::Warn => tracing::enabled!(target: OPERATION_TARGET, tracing::Level::WARN),
            Severity::Error => tracing::enabled!(target: OPERATION_TARGET, tracing::Level::ERROR),
        }
    }

    fn emit(&self, record: EmittedRecord) {
        let payload = record.payload.to_string();
        match record.kind {
            RecordKind::Audit => emit_at!(AUDIT_TARGET, record.severity, &record, payload),
            RecordKind::Lifecycle | RecordKind::Performance => {
                emit_at!(OPERATION_TARGET, record.severity, &record, payload)
            }
        }
    }
}

/// 内存输出端
#[derive(Debug)]
pub struct MemoryEmitter {
    min_severity: Severity,
    records: Mutex<Vec<EmittedRecord>>,
}

impl MemoryEmitter {
    pub fn new(min_severity: Severity) -> Self {
        Self {
            min_severity,
            records: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EmittedRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn records(&self) -> Vec<EmittedRecord> {
        self.lock().clone()
    }

    pub fn records_of(&self, kind: RecordKind) -> Vec<EmittedRecord> {
        self.lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// 生命周期记录的 phase 序列
    pub fn phases(&self) -> Vec<String> {
        self.records_of(RecordKind::Lifecycle)
            .iter()
            .filter_map(|r| r.payload.get("phase").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for MemoryEmitter {
    fn default() -> Self {
        Self::new(Severity::Trace)
    }
}

impl EventEmitter for MemoryEmitter {
    fn is_enabled(&self, severity: Severity) -> bool {
        severity >= self.min_severity
    }

    fn emit(&self, record: EmittedRecord) {
        self.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(kind: RecordKind, severity: Severity, phase: &str) -> EmittedRecord {
        EmittedRecord {
            severity,
            kind,
            message: "Operation".into(),
            payload: json!({ "phase": phase }),
            context: vec![("correlation_id".into(), "c-1".into())],
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Trace < Severity::Debug);
        assert!(Severity::Warn < Severity::Error);
    }

    #[test]
    fn test_memory_emitter_gating() {
        let emitter = MemoryEmitter::new(Severity::Info);
        assert!(!emitter.is_enabled(Severity::Debug));
        assert!(emitter.is_enabled(Severity::Info));
        assert!(emitter.is_enabled(Severity::Error));
    }

    #[test]
    fn test_memory_emitter_records() {
        let emitter = MemoryEmitter::default();
        emitter.emit(record(RecordKind::Lifecycle, Severity::Info, "ENTRY"));
        emitter.emit(record(RecordKind::Audit, Severity::Info, "-"));
        emitter.emit(record(RecordKind::Lifecycle, Severity::Info, "EXIT"));

        assert_eq!(emitter.records().len(), 3);
        assert_eq!(emitter.records_of(RecordKind::Audit).len(), 1);
        assert_eq!(emitter.phases(), vec!["ENTRY", "EXIT"]);
        assert_eq!(
            emitter.records()[0].context_value("correlation_id"),
            Some("c-1")
        );

        emitter.clear();
        assert!(emitter.records().is_empty());
    }

    #[test]
    fn test_tracing_emitter_without_subscriber() {
        let emitter = TracingEmitter::new();
        emitter.emit(record(RecordKind::Audit, Severity::Info, "-"));
        emitter.emit(record(RecordKind::Performance, Severity::Warn, "-"));
    }

    #[test]
    fn test_severity_serializes_uppercase() {
        assert_eq!(serde_json::to_value(Severity::Warn).unwrap(), json!("WARN"));
    }
}
