use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use super::{
    ActionKind, ConditionType, ConditionValue, EnforcementLevel, Operator, PolicyAction,
    PolicyCondition, SecurityPolicy, ALL_ROLES,
};

/// Built-in policy set seeded at startup.
pub fn default_policies() -> Vec<SecurityPolicy> {
    vec![
        SecurityPolicy {
            id: "device-encryption".to_string(),
            name: "Device storage encryption".to_string(),
            version: 1,
            active: true,
            enforcement_level: EnforcementLevel::Blocking,
            applicable_roles: vec![ALL_ROLES.to_string()],
            conditions: vec![PolicyCondition::new(
                ConditionType::DeviceEncryption,
                Operator::Equals,
                ConditionValue::Bool(true),
            )],
            actions: vec![
                PolicyAction::new(ActionKind::Deny, 100),
                PolicyAction::new(ActionKind::Log, 10),
            ],
            allow_override: false,
        },
        SecurityPolicy {
            id: "certificate-validation".to_string(),
            name: "TLS certificate validation".to_string(),
            version: 1,
            active: true,
            enforcement_level: EnforcementLevel::Blocking,
            applicable_roles: vec![ALL_ROLES.to_string()],
            conditions: vec![PolicyCondition::new(
                ConditionType::CertificateValidation,
                Operator::Equals,
                ConditionValue::Bool(true),
            )],
            actions: vec![
                PolicyAction::new(ActionKind::Deny, 100),
                PolicyAction::new(ActionKind::Escalate, 50).with_param("notify", "security"),
            ],
            allow_override: false,
        },
        SecurityPolicy {
            id: "device-integrity".to_string(),
            name: "Device and app integrity".to_string(),
            version: 1,
            active: true,
            enforcement_level: EnforcementLevel::Blocking,
            applicable_roles: vec![ALL_ROLES.to_string()],
            conditions: vec![
                PolicyCondition::new(
                    ConditionType::JailbreakDetection,
                    Operator::Equals,
                    ConditionValue::Bool(false),
                ),
                PolicyCondition::new(
                    ConditionType::AppIntegrity,
                    Operator::Equals,
                    ConditionValue::Bool(true),
                ),
            ],
            actions: vec![
                PolicyAction::new(ActionKind::RequireReauth, 80),
                PolicyAction::new(ActionKind::NotifyAdmin, 40),
            ],
            allow_override: true,
        },
        SecurityPolicy {
            id: "biometric-auth".to_string(),
            name: "Biometric authentication".to_string(),
            version: 1,
            active: true,
            enforcement_level: EnforcementLevel::Warning,
            applicable_roles: vec![
                "planner".to_string(),
                "coordinator".to_string(),
                "admin".to_string(),
            ],
            conditions: vec![PolicyCondition::new(
                ConditionType::BiometricAvailable,
                Operator::Equals,
                ConditionValue::Bool(true),
            )
            .relaxed()],
            actions: vec![PolicyAction::new(ActionKind::Log, 10)],
            allow_override: true,
        },
        SecurityPolicy {
            id: "secure-network".to_string(),
            name: "Secure network connection".to_string(),
            version: 1,
            active: true,
            enforcement_level: EnforcementLevel::Warning,
            applicable_roles: vec![ALL_ROLES.to_string()],
            conditions: vec![
                PolicyCondition::new(
                    ConditionType::NetworkSecurity,
                    Operator::Equals,
                    ConditionValue::Bool(true),
                )
                .relaxed(),
                PolicyCondition::new(
                    ConditionType::ConnectionType,
                    Operator::NotIn,
                    ConditionValue::List(vec!["offline".to_string(), "unknown".to_string()]),
                )
                .relaxed(),
            ],
            actions: vec![PolicyAction::new(ActionKind::Log, 20)],
            allow_override: true,
        },
        SecurityPolicy {
            id: "app-version".to_string(),
            name: "Minimum app version".to_string(),
            version: 1,
            active: true,
            enforcement_level: EnforcementLevel::Warning,
            applicable_roles: vec![ALL_ROLES.to_string()],
            conditions: vec![PolicyCondition::new(
                ConditionType::AppVersion,
                Operator::GreaterOrEqual,
                ConditionValue::Text("2.0.0".to_string()),
            )
            .relaxed()],
            actions: vec![PolicyAction::new(ActionKind::Log, 10).with_param("remedy", "update")],
            allow_override: true,
        },
        SecurityPolicy {
            id: "screen-lock".to_string(),
            name: "Screen lock enabled".to_string(),
            version: 1,
            active: true,
            enforcement_level: EnforcementLevel::Advisory,
            applicable_roles: vec![ALL_ROLES.to_string()],
            conditions: vec![PolicyCondition::new(
                ConditionType::ScreenLock,
                Operator::Equals,
                ConditionValue::Bool(true),
            )],
            actions: vec![PolicyAction::new(ActionKind::Log, 5)],
            allow_override: true,
        },
    ]
}

#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<SecurityPolicy>,
}

/// Extra policies from a `{ "policies": [...] }` document. `.toml` files are
/// parsed as TOML, anything else as JSON.
pub fn load_policy_file(path: &Path) -> Result<Vec<SecurityPolicy>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read policy file {}: {}", path.display(), e))?;
    let file: PolicyFile = if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("failed to parse policy file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("failed to parse policy file {}: {}", path.display(), e))?
    };
    for policy in &file.policies {
        policy.validate()?;
    }
    Ok(file.policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn seed_set_is_valid_and_unique() {
        let policies = default_policies();
        let ids: HashSet<_> = policies.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), policies.len());
        for policy in &policies {
            policy.validate().unwrap();
        }
    }

    #[test]
    fn critical_conditions_are_never_relaxed_or_overridable() {
        for policy in default_policies() {
            for cond in &policy.conditions {
                if cond.condition_type.is_critical() {
                    assert!(!cond.contextually_relaxed, "{}", policy.id);
                    assert!(!policy.allow_override, "{}", policy.id);
                }
            }
        }
    }

    #[test]
    fn loads_toml_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.toml");
        std::fs::write(
            &path,
            r#"
[[policies]]
id = "vpn-for-vendors"
name = "Vendors must use a VPN"
version = 1
active = true
enforcement_level = "warning"
applicable_roles = ["vendor"]

[[policies.conditions]]
type = "vpn_active"
operator = "equals"
value = true

[[policies.actions]]
type = "log"
priority = 5
"#,
        )
        .unwrap();
        let loaded = load_policy_file(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].conditions[0].condition_type, ConditionType::VpnActive);
        assert!(!loaded[0].allow_override);
    }

    #[test]
    fn rejects_policy_without_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            r#"{"policies":[{"id":"p","name":"n","version":1,"active":true,
                "enforcement_level":"advisory","applicable_roles":["all"],"conditions":[]}]}"#,
        )
        .unwrap();
        assert!(load_policy_file(&path).is_err());
    }
}
