use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, OnceLock},
};

static METRICS: OnceLock<Mutex<MetricsState>> = OnceLock::new();

/// 时延分桶上界（毫秒）：<50, <100, <250, <500, <1000, >=1000
const LATENCY_BOUNDS_MS: [u64; 5] = [50, 100, 250, 500, 1000];

#[derive(Default)]
struct MetricsState {
    total: u64,
    errors: u64,
    per_endpoint: BTreeMap<&'static str, u64>,
    per_endpoint_err: BTreeMap<&'static str, u64>,
    // 被拦截的业务操作
    operation_ok: BTreeMap<String, u64>,
    operation_err: BTreeMap<String, u64>,
    operation_latency_sum_ms: u128,
    operation_hist_buckets: [u64; 6],
    threshold_breaches: BTreeMap<String, u64>,
    scopes_opened: u64,
    // 操作子作用域的释放次数
    scopes_released: BTreeMap<String, u64>,
    // 下游调用
    upstream_ok: u64,
    upstream_err: u64,
    upstream_latency_sum_ms: u128,
}

fn state() -> MutexGuard<'static, MetricsState> {
    let lock = METRICS.get_or_init(|| Mutex::new(MetricsState::default()));
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(), // 避免因锁污染导致 panic
    }
}

fn bucket_index(latency_ms: u64) -> usize {
    LATENCY_BOUNDS_MS
        .iter()
        .position(|bound| latency_ms < *bound)
        .unwrap_or(LATENCY_BOUNDS_MS.len())
}

pub fn count_ok(endpoint: &'static str) {
    let mut s = state();
    s.total += 1;
    *s.per_endpoint.entry(endpoint).or_insert(0) += 1;
}

pub fn count_err(endpoint: &'static str) {
    let mut s = state();
    s.total += 1;
    s.errors += 1;
    *s.per_endpoint.entry(endpoint).or_insert(0) += 1;
    *s.per_endpoint_err.entry(endpoint).or_insert(0) += 1;
}

/// 一次被拦截操作的结果与耗时
pub fn observe_operation(operation: &str, ok: bool, latency_ms: u64) {
    let mut s = state();
    let counters = if ok {
        &mut s.operation_ok
    } else {
        &mut s.operation_err
    };
    *counters.entry(operation.to_string()).or_insert(0) += 1;
    s.operation_latency_sum_ms += u128::from(latency_ms);
    s.operation_hist_buckets[bucket_index(latency_ms)] += 1;
}

pub fn inc_threshold_breach(operation: &str) {
    *state()
        .threshold_breaches
        .entry(operation.to_string())
        .or_insert(0) += 1;
}

pub fn inc_scope_opened() {
    state().scopes_opened += 1;
}

pub fn inc_scope_released(operation: &str) {
    *state()
        .scopes_released
        .entry(operation.to_string())
        .or_insert(0) += 1;
}

pub fn observe_upstream_latency_ms(latency_ms: u128, ok: bool) {
    let mut s = state();
    if ok {
        s.upstream_ok += 1;
    } else {
        s.upstream_err += 1;
    }
    s.upstream_latency_sum_ms += latency_ms;
}

/// 某个操作目前的 (成功, 失败) 次数
pub fn operation_counts(operation: &str) -> (u64, u64) {
    let s = state();
    (
        s.operation_ok.get(operation).copied().unwrap_or(0),
        s.operation_err.get(operation).copied().unwrap_or(0),
    )
}

pub fn threshold_breaches(operation: &str) -> u64 {
    state()
        .threshold_breaches
        .get(operation)
        .copied()
        .unwrap_or(0)
}

pub fn scopes_released(operation: &str) -> u64 {
    state()
        .scopes_released
        .get(operation)
        .copied()
        .unwrap_or(0)
}

pub fn render_prometheus() -> String {
    let s = state();
    let mut out = String::new();
    out.push_str("# HELP ironlog_requests_total Total requests\n");
    out.push_str("# TYPE ironlog_requests_total counter\n");
    out.push_str(&format!("ironlog_requests_total {}\n", s.total));

    out.push_str("# HELP ironlog_errors_total Total error responses\n");
    out.push_str("# TYPE ironlog_errors_total counter\n");
    out.push_str(&format!("ironlog_errors_total {}\n", s.errors));

    out.push_str("# HELP ironlog_endpoint_requests_total Requests per endpoint\n");
    out.push_str("# TYPE ironlog_endpoint_requests_total counter\n");
    for (k, v) in s.per_endpoint.iter() {
        out.push_str(&format!(
            "ironlog_endpoint_requests_total{{endpoint=\"{}\"}} {}\n",
            k, v
        ));
    }

    out.push_str("# HELP ironlog_endpoint_errors_total Errors per endpoint\n");
    out.push_str("# TYPE ironlog_endpoint_errors_total counter\n");
    for (k, v) in s.per_endpoint_err.iter() {
        out.push_str(&format!(
            "ironlog_endpoint_errors_total{{endpoint=\"{}\"}} {}\n",
            k, v
        ));
    }

    // 操作统计
    out.push_str("# HELP ironlog_operations_total Intercepted operations\n");
    out.push_str("# TYPE ironlog_operations_total counter\n");
    for (k, v) in s.operation_ok.iter() {
        out.push_str(&format!(
            "ironlog_operations_total{{operation=\"{}\",result=\"ok\"}} {}\n",
            k, v
        ));
    }
    for (k, v) in s.operation_err.iter() {
        out.push_str(&format!(
            "ironlog_operations_total{{operation=\"{}\",result=\"err\"}} {}\n",
            k, v
        ));
    }

    out.push_str("# HELP ironlog_operation_latency_ms_sum Sum of operation latency in ms\n");
    out.push_str("# TYPE ironlog_operation_latency_ms_sum counter\n");
    out.push_str(&format!(
        "ironlog_operation_latency_ms_sum {}\n",
        s.operation_latency_sum_ms
    ));

    out.push_str("# HELP ironlog_operation_latency_ms_bucket Operation latency histogram buckets\n");
    out.push_str("# TYPE ironlog_operation_latency_ms_bucket histogram\n");
    // 累积桶
    let mut cumulative = 0;
    for (i, bound) in LATENCY_BOUNDS_MS.iter().enumerate() {
        cumulative += s.operation_hist_buckets[i];
        out.push_str(&format!(
            "ironlog_operation_latency_ms_bucket{{le=\"{}\"}} {}\n",
            bound, cumulative
        ));
    }
    out.push_str(&format!(
        "ironlog_operation_latency_ms_bucket{{le=\"+Inf\"}} {}\n",
        s.operation_hist_buckets.iter().sum::<u64>()
    ));

    out.push_str("# HELP ironlog_threshold_exceeded_total Operations slower than their threshold\n");
    out.push_str("# TYPE ironlog_threshold_exceeded_total counter\n");
    for (k, v) in s.threshold_breaches.iter() {
        out.push_str(&format!(
            "ironlog_threshold_exceeded_total{{operation=\"{}\"}} {}\n",
            k, v
        ));
    }

    out.push_str("# HELP ironlog_scopes_opened_total Request scopes opened\n");
    out.push_str("# TYPE ironlog_scopes_opened_total counter\n");
    out.push_str(&format!("ironlog_scopes_opened_total {}\n", s.scopes_opened));

    out.push_str("# HELP ironlog_operation_scopes_released_total Operation scopes released\n");
    out.push_str("# TYPE ironlog_operation_scopes_released_total counter\n");
    for (k, v) in s.scopes_released.iter() {
        out.push_str(&format!(
            "ironlog_operation_scopes_released_total{{operation=\"{}\"}} {}\n",
            k, v
        ));
    }

    // 下游统计
    out.push_str("# HELP ironlog_upstream_requests_total Upstream requests\n");
    out.push_str("# TYPE ironlog_upstream_requests_total counter\n");
    out.push_str(&format!(
        "ironlog_upstream_requests_total{{result=\"ok\"}} {}\n",
        s.upstream_ok
    ));
    out.push_str(&format!(
        "ironlog_upstream_requests_total{{result=\"err\"}} {}\n",
        s.upstream_err
    ));
    out.push_str("# HELP ironlog_upstream_latency_ms_sum Sum of upstream latency in ms\n");
    out.push_str("# TYPE ironlog_upstream_latency_ms_sum counter\n");
    out.push_str(&format!(
        "ironlog_upstream_latency_ms_sum {}\n",
        s.upstream_latency_sum_ms
    ));

    out
}
