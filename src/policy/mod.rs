//! Access policies.
//!
//! A policy is a versioned list of typed conditions over an
//! `EvaluationContext` plus the actions to take when any of them fails.
//! Conditions are closed variants: every attribute a policy can inspect is
//! named by `ConditionType`, and values are checked against the attribute's
//! shape at evaluation time.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::audit::Severity;

pub mod calendar;
pub mod context;
pub mod defaults;
mod engine;

pub use calendar::CriticalDayCalendar;
pub use context::{AppInfo, ConnectionType, DeviceInfo, EvaluationContext, NetworkInfo};
pub use defaults::default_policies;
pub use engine::{
    AccessDecision, EvaluationLogEntry, EvaluationLogKind, EvaluationResult, OverrideDecision,
    PolicyEngine, PolicyEngineConfig, FAIL_CLOSED_MESSAGE,
};

/// Role wildcard in `applicable_roles`.
pub const ALL_ROLES: &str = "all";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    Advisory,
    Warning,
    Blocking,
}

impl EnforcementLevel {
    /// Severity of a failed condition that is not inherently critical.
    pub fn violation_severity(&self) -> Severity {
        match self {
            EnforcementLevel::Blocking => Severity::High,
            EnforcementLevel::Warning => Severity::Medium,
            EnforcementLevel::Advisory => Severity::Low,
        }
    }
}

impl std::fmt::Display for EnforcementLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnforcementLevel::Advisory => "advisory",
            EnforcementLevel::Warning => "warning",
            EnforcementLevel::Blocking => "blocking",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    DeviceEncryption,
    CertificateValidation,
    BiometricAvailable,
    ScreenLock,
    JailbreakDetection,
    NetworkSecurity,
    VpnActive,
    ConnectionType,
    AppVersion,
    AppIntegrity,
    OsVersion,
}

impl ConditionType {
    /// Encryption and certificate failures are critical regardless of level
    /// and can never be bypassed.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ConditionType::DeviceEncryption | ConditionType::CertificateValidation
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::DeviceEncryption => "device_encryption",
            ConditionType::CertificateValidation => "certificate_validation",
            ConditionType::BiometricAvailable => "biometric_available",
            ConditionType::ScreenLock => "screen_lock",
            ConditionType::JailbreakDetection => "jailbreak_detection",
            ConditionType::NetworkSecurity => "network_security",
            ConditionType::VpnActive => "vpn_active",
            ConditionType::ConnectionType => "connection_type",
            ConditionType::AppVersion => "app_version",
            ConditionType::AppIntegrity => "app_integrity",
            ConditionType::OsVersion => "os_version",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterOrEqual,
    LessThan,
    In,
    NotIn,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Text(String),
    List(Vec<String>),
}

impl std::fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionValue::Bool(b) => write!(f, "{}", b),
            ConditionValue::Text(s) => write!(f, "'{}'", s),
            ConditionValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// Attribute as read from a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AttributeValue {
    Bool(bool),
    Text(String),
    Version(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub operator: Operator,
    pub value: ConditionValue,
    #[serde(default)]
    pub contextually_relaxed: bool,
}

impl PolicyCondition {
    pub fn new(condition_type: ConditionType, operator: Operator, value: ConditionValue) -> Self {
        Self {
            condition_type,
            operator,
            value,
            contextually_relaxed: false,
        }
    }

    pub fn relaxed(mut self) -> Self {
        self.contextually_relaxed = true;
        self
    }

    /// `Err` means the condition is malformed for its attribute, which the
    /// engine treats as an internal fault.
    pub fn evaluate(&self, ctx: &EvaluationContext) -> Result<bool> {
        let actual = ctx.attribute(self.condition_type);
        compare(&actual, self.operator, &self.value).map_err(|e| {
            anyhow!(
                "condition {} {:?} {}: {}",
                self.condition_type,
                self.operator,
                self.value,
                e
            )
        })
    }

    pub fn describe(&self) -> String {
        format!(
            "{} must be {} {}",
            self.condition_type,
            operator_phrase(self.operator),
            self.value
        )
    }
}

fn operator_phrase(op: Operator) -> &'static str {
    match op {
        Operator::Equals => "equal to",
        Operator::NotEquals => "different from",
        Operator::GreaterOrEqual => "at least",
        Operator::LessThan => "below",
        Operator::In => "one of",
        Operator::NotIn => "none of",
    }
}

fn compare(actual: &AttributeValue, op: Operator, expected: &ConditionValue) -> Result<bool> {
    match (actual, op, expected) {
        (AttributeValue::Bool(a), Operator::Equals, ConditionValue::Bool(b)) => Ok(a == b),
        (AttributeValue::Bool(a), Operator::NotEquals, ConditionValue::Bool(b)) => Ok(a != b),
        (AttributeValue::Text(a), Operator::Equals, ConditionValue::Text(b)) => {
            Ok(a.eq_ignore_ascii_case(b))
        }
        (AttributeValue::Text(a), Operator::NotEquals, ConditionValue::Text(b)) => {
            Ok(!a.eq_ignore_ascii_case(b))
        }
        (AttributeValue::Text(a), Operator::In, ConditionValue::List(items)) => {
            Ok(items.iter().any(|item| item.eq_ignore_ascii_case(a)))
        }
        (AttributeValue::Text(a), Operator::NotIn, ConditionValue::List(items)) => {
            Ok(!items.iter().any(|item| item.eq_ignore_ascii_case(a)))
        }
        (AttributeValue::Version(a), _, ConditionValue::Text(b)) => {
            let ordering = compare_versions(a, b)?;
            match op {
                Operator::Equals => Ok(ordering.is_eq()),
                Operator::NotEquals => Ok(ordering.is_ne()),
                Operator::GreaterOrEqual => Ok(ordering.is_ge()),
                Operator::LessThan => Ok(ordering.is_lt()),
                Operator::In | Operator::NotIn => {
                    Err(anyhow!("version attributes do not support set operators"))
                }
            }
        }
        _ => Err(anyhow!("operator does not apply to this attribute/value shape")),
    }
}

/// Dotted numeric versions; missing components count as zero.
/// A leading `v` and any `-suffix` are ignored.
pub fn compare_versions(a: &str, b: &str) -> Result<std::cmp::Ordering> {
    let pa = parse_version(a)?;
    let pb = parse_version(b)?;
    let len = pa.len().max(pb.len());
    for idx in 0..len {
        let x = pa.get(idx).copied().unwrap_or(0);
        let y = pb.get(idx).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(std::cmp::Ordering::Equal)
}

fn parse_version(raw: &str) -> Result<Vec<u64>> {
    let trimmed = raw.trim().trim_start_matches('v');
    let core = trimmed.split('-').next().unwrap_or(trimmed);
    if core.is_empty() {
        return Err(anyhow!("empty version string"));
    }
    core.split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| anyhow!("invalid version component '{}' in '{}'", part, raw))
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Allow,
    Deny,
    Log,
    Escalate,
    RequireReauth,
    NotifyAdmin,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub priority: u8,
}

impl PolicyAction {
    pub fn new(kind: ActionKind, priority: u8) -> Self {
        Self {
            kind,
            parameters: BTreeMap::new(),
            priority,
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub active: bool,
    pub enforcement_level: EnforcementLevel,
    pub applicable_roles: Vec<String>,
    pub conditions: Vec<PolicyCondition>,
    #[serde(default)]
    pub actions: Vec<PolicyAction>,
    /// Whether a violation of this policy may be bypassed on a critical day.
    #[serde(default)]
    pub allow_override: bool,
}

impl SecurityPolicy {
    pub fn applies_to(&self, role: &str) -> bool {
        self.applicable_roles
            .iter()
            .any(|r| r == ALL_ROLES || r.eq_ignore_ascii_case(role))
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow!("policy id cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(anyhow!("policy {} has an empty name", self.id));
        }
        if self.applicable_roles.is_empty() {
            return Err(anyhow!("policy {} applies to no roles", self.id));
        }
        if self.conditions.is_empty() {
            return Err(anyhow!("policy {} has no conditions", self.id));
        }
        Ok(())
    }
}

/// Record of a failed condition. Only `resolved`/`resolution_method` change
/// after creation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyViolation {
    pub id: String,
    pub policy_id: String,
    pub policy_name: String,
    pub condition: ConditionType,
    pub severity: Severity,
    pub enforcement_level: EnforcementLevel,
    pub message: String,
    pub user_id: String,
    pub context_hash: String,
    pub timestamp_ms: u64,
    pub resolved: bool,
    pub resolution_method: Option<String>,
}

/// Critical condition types are always critical; others follow the level.
pub fn violation_severity(condition: ConditionType, level: EnforcementLevel) -> Severity {
    if condition.is_critical() {
        Severity::Critical
    } else {
        level.violation_severity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn severity_mapping() {
        assert_eq!(
            violation_severity(ConditionType::DeviceEncryption, EnforcementLevel::Advisory),
            Severity::Critical
        );
        assert_eq!(
            violation_severity(ConditionType::CertificateValidation, EnforcementLevel::Warning),
            Severity::Critical
        );
        assert_eq!(
            violation_severity(ConditionType::ScreenLock, EnforcementLevel::Blocking),
            Severity::High
        );
        assert_eq!(
            violation_severity(ConditionType::ScreenLock, EnforcementLevel::Warning),
            Severity::Medium
        );
        assert_eq!(
            violation_severity(ConditionType::ScreenLock, EnforcementLevel::Advisory),
            Severity::Low
        );
    }

    #[test]
    fn version_ordering() {
        assert_eq!(compare_versions("2.10.0", "2.9.9").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("v3.1", "3.1.0").unwrap(), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0-beta", "1.0.1").unwrap(), Ordering::Less);
        assert!(compare_versions("1.x", "1.0").is_err());
    }

    #[test]
    fn compare_rejects_shape_mismatch() {
        assert!(compare(
            &AttributeValue::Bool(true),
            Operator::In,
            &ConditionValue::List(vec!["a".to_string()])
        )
        .is_err());
        assert!(compare(
            &AttributeValue::Text("wifi".to_string()),
            Operator::Equals,
            &ConditionValue::Bool(true)
        )
        .is_err());
        assert!(compare(
            &AttributeValue::Text("wifi".to_string()),
            Operator::In,
            &ConditionValue::List(vec!["WiFi".to_string(), "ethernet".to_string()])
        )
        .unwrap());
    }

    #[test]
    fn role_matching_supports_wildcard() {
        let mut policy = defaults::default_policies().remove(0);
        policy.applicable_roles = vec!["planner".to_string()];
        assert!(policy.applies_to("Planner"));
        assert!(!policy.applies_to("guest"));
        policy.applicable_roles = vec![ALL_ROLES.to_string()];
        assert!(policy.applies_to("guest"));
    }

    #[test]
    fn condition_deserializes_from_json() {
        let json = r#"{"type":"app_version","operator":"greater_or_equal","value":"2.4.0","contextually_relaxed":true}"#;
        let cond: PolicyCondition = serde_json::from_str(json).unwrap();
        assert_eq!(cond.condition_type, ConditionType::AppVersion);
        assert_eq!(cond.value, ConditionValue::Text("2.4.0".to_string()));
        assert!(cond.contextually_relaxed);
    }
}
