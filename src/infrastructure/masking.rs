//! 日志脱敏引擎
//!
//! 有序的 “正则 → 替换模板” 规则流水线：每条规则的输出是下一条规则的输入。
//! 规则顺序本身是契约的一部分，例如长卡号规则必须先于分段卡号规则执行，
//! 否则同一串数字会被两条规则以不同形状各脱敏一次。
//!
//! 规则集在启动时构建一次，之后只读共享；`mask` 不加锁、不会失败。

use std::{borrow::Cow, fmt, sync::Arc};

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;

use crate::{config::MaskingConfig, error::LoggingError};

/// 单条规则编译后的大小上限，防止配置进来的病态模式撑爆内存
const RULE_SIZE_LIMIT: usize = 1 << 20;

/// 脱敏规则：模式 + 替换模板（模板用 `${n}` 引用捕获组）
#[derive(Debug, Clone)]
pub struct MaskingRule {
    name: String,
    pattern: Regex,
    replacement: String,
}

impl MaskingRule {
    /// 编译规则；无法编译的模式在这里失败，而不是在 `mask` 时
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, LoggingError> {
        let compiled = RegexBuilder::new(pattern)
            .size_limit(RULE_SIZE_LIMIT)
            .build()
            .map_err(|source| LoggingError::InvalidMaskingPattern {
                pattern: pattern.to_string(),
                source,
            })?;

        Ok(Self {
            name: "custom".to_string(),
            pattern: compiled,
            replacement: replacement.to_string(),
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    /// 对输入应用本规则；未命中时返回 None，避免无谓的分配
    fn apply(&self, input: &str) -> Option<String> {
        match self.pattern.replace_all(input, self.replacement.as_str()) {
            Cow::Owned(replaced) => Some(replaced),
            Cow::Borrowed(_) => None,
        }
    }
}

/// 内置规则（顺序固定）
const DEFAULT_RULES: &[(&str, &str, &str)] = &[
    // 卡号：保留前6位和后4位
    ("pan", r"\b([3-6]\d{5})\d{4,9}(\d{4})\b", "${1}******${2}"),
    // 带分隔符的卡号：保留首尾两组
    (
        "pan_separated",
        r"\b([3-6]\d{3})[- ]?(\d{4})[- ]?(\d{4})[- ]?(\d{4})\b",
        "${1}-****-****-${4}",
    ),
    // IBAN：保留国家码+校验位和末4位
    (
        "iban",
        r"\b([A-Z]{2}\d{2})[A-Z0-9]{8,26}([A-Z0-9]{4})\b",
        "${1}************${2}",
    ),
    // Email：保留首字符和域名
    (
        "email",
        r"\b([a-zA-Z0-9])[a-zA-Z0-9._%+-]*@([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})\b",
        "${1}***@${2}",
    ),
    // 法国电话号码
    (
        "phone_fr",
        r"\b(\+?33|0)([1-9])(\d{2})(\d{2})(\d{2})(\d{2})\b",
        "${1}${2}******${6}",
    ),
    // CVV/CVC：保留键名，值全部替换
    ("cvv", r#"(?i)(cvv|cvc|cvn)[":\s]*(\d{3,4})"#, "${1}:***"),
];

/// 有序、不可变的规则集
#[derive(Debug, Clone)]
pub struct MaskingRuleSet {
    rules: Vec<MaskingRule>,
}

impl MaskingRuleSet {
    /// 内置规则集
    pub fn default_rules() -> Result<Self, LoggingError> {
        Self::with_custom_rules(Vec::new())
    }

    /// 内置规则在前，调用方规则按给定顺序追加在后
    pub fn with_custom_rules(custom: Vec<MaskingRule>) -> Result<Self, LoggingError> {
        let mut rules = DEFAULT_RULES
            .iter()
            .map(|(name, pattern, replacement)| {
                MaskingRule::new(pattern, replacement).map(|r| r.named(*name))
            })
            .collect::<Result<Vec<_>, _>>()?;
        rules.extend(custom);
        Ok(Self { rules })
    }

    /// 完全由调用方决定顺序的规则集（例如按司法辖区替换电话规则）
    pub fn from_rules(rules: Vec<MaskingRule>) -> Self {
        Self { rules }
    }

    /// 从配置构建：任何一条自定义规则无法编译都会让启动失败
    pub fn from_config(config: &MaskingConfig) -> Result<Self, LoggingError> {
        let custom = config
            .custom_rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| {
                let name = rule
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("custom_{}", idx));
                MaskingRule::new(&rule.pattern, &rule.replacement).map(|r| r.named(name))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_custom_rules(custom)
    }

    pub fn rules(&self) -> &[MaskingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// 可以被写进日志的值：优先规范化为 JSON，失败时退回到 Debug 文本
pub trait Loggable {
    fn to_canonical(&self) -> Result<String, serde_json::Error>;
    fn to_plain(&self) -> String;
}

impl<T: Serialize + fmt::Debug + ?Sized> Loggable for T {
    fn to_canonical(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn to_plain(&self) -> String {
        format!("{:?}", self)
    }
}

/// 脱敏器
///
/// 无状态、无副作用，可在任意多个并发作用域间通过 `Arc` 共享。
#[derive(Debug, Clone)]
pub struct DataMasker {
    rules: Arc<MaskingRuleSet>,
    enabled: bool,
}

impl DataMasker {
    pub fn new(rules: MaskingRuleSet) -> Self {
        Self {
            rules: Arc::new(rules),
            enabled: true,
        }
    }

    /// 内置规则的脱敏器
    pub fn with_default_rules() -> Result<Self, LoggingError> {
        Ok(Self::new(MaskingRuleSet::default_rules()?))
    }

    /// 关闭脱敏（`masking.enabled = false`）时使用的直通实现
    pub fn disabled() -> Self {
        Self {
            rules: Arc::new(MaskingRuleSet::from_rules(Vec::new())),
            enabled: false,
        }
    }

    pub fn from_config(config: &MaskingConfig) -> Result<Self, LoggingError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let rules = MaskingRuleSet::from_config(config)?;
        tracing::debug!(rules = rules.len(), "Masking rule set compiled");
        Ok(Self::new(rules))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rule_set(&self) -> &MaskingRuleSet {
        &self.rules
    }

    /// 依次应用每条规则；空白输入原样返回
    pub fn mask<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if !self.enabled || text.trim().is_empty() {
            return Cow::Borrowed(text);
        }

        let mut current = Cow::Borrowed(text);
        for rule in self.rules.rules() {
            if let Some(replaced) = rule.apply(&current) {
                current = Cow::Owned(replaced);
            }
        }
        current
    }

    /// 脱敏 JSON 值：序列化 → 脱敏 → 反序列化；
    /// 脱敏后不再是合法 JSON 时（例如 CVV 规则吞掉了引号）保留为脱敏后的字符串
    pub fn mask_json(&self, value: &Value) -> Value {
        match serde_json::to_string(value) {
            Ok(json) => self.reparse(json),
            Err(_) => Value::String(self.mask(&value.to_string()).into_owned()),
        }
    }

    /// 脱敏任意可记录的值；无法规范化序列化时对其文本形式脱敏，
    /// 原始值在任何路径上都不会以未脱敏形式返回
    pub fn mask_loggable(&self, value: &dyn Loggable) -> Value {
        match value.to_canonical() {
            Ok(json) => self.reparse(json),
            Err(e) => {
                tracing::trace!(error = %e, "Canonical serialization failed, masking plain text");
                Value::String(self.mask(&value.to_plain()).into_owned())
            }
        }
    }

    fn reparse(&self, json: String) -> Value {
        let masked = self.mask(&json).into_owned();
        serde_json::from_str(&masked).unwrap_or(Value::String(masked))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn masker() -> DataMasker {
        DataMasker::with_default_rules().unwrap()
    }

    #[test]
    fn test_default_rule_order() {
        let rules = MaskingRuleSet::default_rules().unwrap();
        let names: Vec<_> = rules.rules().iter().map(|r| r.name()).collect();
        assert_eq!(
            names,
            vec!["pan", "pan_separated", "iban", "email", "phone_fr", "cvv"]
        );
    }

    #[test]
    fn test_mask_card_number() {
        assert_eq!(masker().mask("4111111234561234"), "411111******1234");
        assert_eq!(
            masker().mask("card=5500000000000004 ok"),
            "card=550000******0004 ok"
        );
    }

    #[test]
    fn test_card_middle_digits_removed() {
        let input = "4539148803436467";
        let masked = masker().mask(input).into_owned();
        assert_eq!(&masked[..6], &input[..6]);
        assert_eq!(&masked[masked.len() - 4..], &input[input.len() - 4..]);
        let middle = &masked[6..masked.len() - 4];
        assert!(middle.chars().all(|c| c == '*'));
    }

    #[test]
    fn test_mask_separated_card_number() {
        assert_eq!(
            masker().mask("pay with 4111 1111 1111 1234"),
            "pay with 4111-****-****-1234"
        );
        assert_eq!(
            masker().mask("4111-1111-1111-1234"),
            "4111-****-****-1234"
        );
    }

    #[test]
    fn test_mask_iban() {
        assert_eq!(
            masker().mask("iban FR7630006000011234567890189"),
            "iban FR76************0189"
        );
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(masker().mask("john.doe@example.com"), "j***@example.com");
        assert_eq!(
            masker().mask("contact: a@b.io, x_y@corp.example.org"),
            "contact: a***@b.io, x***@corp.example.org"
        );
    }

    #[test]
    fn test_mask_phone() {
        assert_eq!(masker().mask("tel 0612345678"), "tel 06******78");
        assert_eq!(masker().mask("tel +33612345678"), "tel +336******78");
    }

    #[test]
    fn test_mask_cvv() {
        assert_eq!(masker().mask("CVV: 123"), "CVV:***");
        assert_eq!(masker().mask(r#"{"cvc":"4321"}"#), r#"{"cvc:***"}"#);
    }

    #[test]
    fn test_unmatched_input_unchanged() {
        let m = masker();
        for input in [
            "plain log line",
            "order 42 shipped",
            "amount=12.50 EUR",
            "id=abc-123",
        ] {
            assert_eq!(m.mask(input), input);
            assert!(matches!(m.mask(input), Cow::Borrowed(_)));
        }
    }

    #[test]
    fn test_blank_input_unchanged() {
        let m = masker();
        assert_eq!(m.mask(""), "");
        assert_eq!(m.mask("   "), "   ");
    }

    #[test]
    fn test_mask_is_idempotent() {
        let m = masker();
        for input in [
            "4111111234561234",
            "4111 1111 1111 1234",
            "FR7630006000011234567890189",
            "john.doe@example.com",
            "+33612345678",
            "cvv=987",
            "user jane@bank.fr paid 5500000000000004 cvc 123 from DE89370400440532013000",
        ] {
            let once = m.mask(input).into_owned();
            let twice = m.mask(&once).into_owned();
            assert_eq!(once, twice, "second pass changed {:?}", input);
        }
    }

    #[test]
    fn test_rule_order_matters() {
        let defaults = MaskingRuleSet::default_rules().unwrap();
        let mut reversed = defaults.rules().to_vec();
        reversed.reverse();

        let ordered = DataMasker::new(defaults);
        let reversed = DataMasker::new(MaskingRuleSet::from_rules(reversed));

        let input = "4111111111111111";
        assert_eq!(ordered.mask(input), "411111******1111");
        assert_eq!(reversed.mask(input), "4111-****-****-1111");
        assert_ne!(ordered.mask(input), reversed.mask(input));
    }

    #[test]
    fn test_custom_rules_run_after_builtins() {
        let custom = MaskingRule::new(r"(?i)(token=)\S+", "${1}[REDACTED]")
            .unwrap()
            .named("token");
        let rules = MaskingRuleSet::with_custom_rules(vec![custom]).unwrap();
        assert_eq!(rules.len(), DEFAULT_RULES.len() + 1);
        assert_eq!(rules.rules().last().unwrap().name(), "token");

        let m = DataMasker::new(rules);
        assert_eq!(
            m.mask("token=abc123 mail a@b.com"),
            "token=[REDACTED] mail a***@b.com"
        );
    }

    #[test]
    fn test_malformed_custom_rule_fails_at_construction() {
        let err = MaskingRule::new(r"(\d{3", "***").unwrap_err();
        assert!(matches!(err, LoggingError::InvalidMaskingPattern { .. }));

        let config = MaskingConfig {
            enabled: true,
            custom_rules: vec![crate::config::CustomMaskingRule {
                name: None,
                pattern: "[".into(),
                replacement: "*".into(),
            }],
        };
        assert!(DataMasker::from_config(&config).is_err());
    }

    #[test]
    fn test_disabled_masker_passes_through() {
        let m = DataMasker::disabled();
        assert!(!m.is_enabled());
        assert_eq!(m.mask("john.doe@example.com"), "john.doe@example.com");
    }

    #[test]
    fn test_mask_loggable_struct() {
        #[derive(Debug, Serialize)]
        struct Payer {
            email: String,
            card: String,
        }

        let payer = Payer {
            email: "john.doe@example.com".into(),
            card: "4111111234561234".into(),
        };
        let masked = masker().mask_loggable(&payer);
        assert_eq!(
            masked,
            json!({"email": "j***@example.com", "card": "411111******1234"})
        );
    }

    #[test]
    fn test_mask_loggable_falls_back_to_plain_text() {
        // 非字符串键的 map 无法序列化为 JSON
        let mut odd: HashMap<(u8, u8), String> = HashMap::new();
        odd.insert((1, 2), "john.doe@example.com".into());
        assert!(odd.to_canonical().is_err());

        let masked = masker().mask_loggable(&odd);
        let text = masked.as_str().unwrap();
        assert!(text.contains("j***@example.com"));
        assert!(!text.contains("john.doe"));
    }

    #[test]
    fn test_mask_json_keeps_text_when_reparse_fails() {
        let masked = masker().mask_json(&json!({"cvv": "123"}));
        assert_eq!(masked, Value::String(r#"{"cvv:***"}"#.to_string()));
    }

    #[test]
    fn test_linear_time_on_pathological_input() {
        let input = "4".repeat(200_000) + "@";
        let masked = masker().mask(&input);
        assert!(masked.len() <= input.len() + 16);
    }
}
