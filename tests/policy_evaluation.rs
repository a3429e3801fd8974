use std::sync::Arc;

use token_guard::audit::{EventQuery, Severity};
use token_guard::clock::{ManualClock, DAY_MS};
use token_guard::policy::{
    ActionKind, AppInfo, ConditionType, ConditionValue, ConnectionType, CriticalDayCalendar,
    DeviceInfo, EnforcementLevel, EvaluationContext, NetworkInfo, Operator, PolicyAction,
    PolicyCondition, PolicyEngine, PolicyEngineConfig, SecurityPolicy,
};
use token_guard::storage::CredentialStore;
use token_guard::{AccessDecision, InMemoryCredentialStore};

// 2024-06-13 09:00 UTC, a Thursday.
const THURSDAY: u64 = 1_718_269_200_000;
const SATURDAY: u64 = THURSDAY + 2 * DAY_MS;

fn context() -> EvaluationContext {
    EvaluationContext {
        user_id: "planner-7".to_string(),
        role: "planner".to_string(),
        device: DeviceInfo {
            device_id: "phone-7".to_string(),
            platform: "android".to_string(),
            os_version: "14".to_string(),
            encrypted: true,
            biometric_available: true,
            screen_lock_enabled: true,
            jailbroken: false,
        },
        network: NetworkInfo {
            connection_type: ConnectionType::Wifi,
            secure: true,
            vpn_active: false,
            certificate_valid: true,
        },
        app: AppInfo {
            version: "2.3.0".to_string(),
            build: "230".to_string(),
            integrity_verified: true,
        },
        wedding: None,
    }
}

fn encryption_policy() -> SecurityPolicy {
    SecurityPolicy {
        id: "require-encryption".to_string(),
        name: "Require device encryption".to_string(),
        version: 1,
        active: true,
        enforcement_level: EnforcementLevel::Blocking,
        applicable_roles: vec!["all".to_string()],
        conditions: vec![PolicyCondition::new(
            ConditionType::DeviceEncryption,
            Operator::Equals,
            ConditionValue::Bool(true),
        )],
        actions: vec![PolicyAction::new(ActionKind::Deny, 100)],
        allow_override: false,
    }
}

fn venue_network_policy() -> SecurityPolicy {
    SecurityPolicy {
        id: "venue-network".to_string(),
        name: "Secure network".to_string(),
        version: 1,
        active: true,
        enforcement_level: EnforcementLevel::Blocking,
        applicable_roles: vec!["all".to_string()],
        conditions: vec![PolicyCondition::new(
            ConditionType::NetworkSecurity,
            Operator::Equals,
            ConditionValue::Bool(true),
        )
        .relaxed()],
        actions: vec![PolicyAction::new(ActionKind::RequireReauth, 60)],
        allow_override: true,
    }
}

struct Harness {
    engine: PolicyEngine,
    clock: Arc<ManualClock>,
}

fn harness(at: u64, policies: Vec<SecurityPolicy>) -> Harness {
    let clock = Arc::new(ManualClock::new(at));
    let config = PolicyEngineConfig {
        cache_ttl_ms: 30_000,
        calendar: CriticalDayCalendar::default(),
        max_log_entries: 100,
    };
    let engine = PolicyEngine::new(
        config,
        policies,
        Box::new(InMemoryCredentialStore::default()),
        clock.clone(),
    )
    .expect("engine");
    Harness { engine, clock }
}

#[test]
fn unencrypted_device_is_denied_with_one_critical_violation() {
    let mut h = harness(THURSDAY, vec![encryption_policy()]);
    let mut ctx = context();
    ctx.device.encrypted = false;

    let result = h.engine.evaluate(&ctx);
    assert!(!result.allowed);
    assert_eq!(result.violations.len(), 1);
    assert_eq!(result.violations[0].severity, Severity::Critical);
    assert_eq!(result.violations[0].condition, ConditionType::DeviceEncryption);
    assert_eq!(result.enforcement_level, EnforcementLevel::Blocking);
    assert_eq!(result.required_actions[0].kind, ActionKind::Deny);
    assert_eq!(h.engine.violations().len(), 1);
}

#[test]
fn encrypted_device_is_allowed_with_no_violations() {
    let mut h = harness(THURSDAY, vec![encryption_policy()]);
    let result = h.engine.evaluate(&context());
    assert!(result.allowed);
    assert!(result.violations.is_empty());
    assert!(result.warnings.is_empty());
    assert!(h.engine.violations().is_empty());
}

#[test]
fn identical_context_within_ttl_returns_same_result_object() {
    let mut h = harness(THURSDAY, vec![encryption_policy()]);
    let mut ctx = context();
    ctx.device.encrypted = false;

    let first = h.engine.evaluate(&ctx);
    h.clock.advance(10_000);
    let second = h.engine.evaluate(&ctx);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.engine.violations().len(), 1);

    h.clock.advance(30_000);
    let third = h.engine.evaluate(&ctx);
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(h.engine.violations().len(), 2);
}

#[test]
fn changed_context_is_evaluated_fresh() {
    let mut h = harness(THURSDAY, vec![encryption_policy()]);
    let first = h.engine.evaluate(&context());
    let mut other = context();
    other.app.build = "231".to_string();
    let second = h.engine.evaluate(&other);
    assert!(!Arc::ptr_eq(&first, &second));
}

#[test]
fn relaxed_condition_passes_on_critical_day_regardless_of_value() {
    let mut ctx = context();
    ctx.network.secure = false;

    let mut weekday = harness(THURSDAY, vec![venue_network_policy()]);
    let result = weekday.engine.evaluate(&ctx);
    assert_eq!(result.violations.len(), 1);
    assert_eq!(result.violations[0].severity, Severity::High);
    assert!(result.allowed);
    assert!(!result.context_override_applied);

    let mut saturday = harness(SATURDAY, vec![venue_network_policy()]);
    let result = saturday.engine.evaluate(&ctx);
    assert!(result.violations.is_empty());
    assert!(result.context_override_applied);
}

#[test]
fn caller_event_flag_does_not_unlock_relaxation() {
    let mut h = harness(THURSDAY, vec![venue_network_policy()]);
    let mut ctx = context();
    ctx.network.secure = false;
    ctx.wedding = Some(token_guard::token::WeddingContext {
        event_id: "wedding-1".to_string(),
        event_date: chrono::NaiveDate::from_ymd_opt(2024, 6, 13).unwrap(),
        is_event_day: true,
        emergency_access: true,
        team_role: "planner".to_string(),
    });
    let result = h.engine.evaluate(&ctx);
    assert_eq!(result.violations.len(), 1);
    assert!(!result.context_override_applied);
}

#[test]
fn denied_decision_only_allowed_through_override() {
    let mut h = harness(THURSDAY, vec![encryption_policy()]);
    let mut ctx = context();
    ctx.device.encrypted = false;

    let (decision, result) = h.engine.decide(&ctx).unwrap();
    assert_eq!(decision, AccessDecision::Denied);
    assert!(!result.allowed);

    let context_id = ctx.fingerprint().unwrap();
    let rejected = h
        .engine
        .request_override("planner-7", &context_id, "ceremony starting")
        .unwrap();
    assert!(!rejected.approved);
    assert_eq!(decision.apply_override(&rejected).unwrap(), AccessDecision::Denied);

    h.clock.set(SATURDAY);
    let approved = h
        .engine
        .request_override("planner-7", &context_id, "ceremony starting")
        .unwrap();
    assert!(approved.approved);
    assert_eq!(decision.apply_override(&approved).unwrap(), AccessDecision::Allowed);

    // The override is recorded but policies are untouched.
    assert_eq!(h.engine.policies(), &[encryption_policy()][..]);
    let overrides = h
        .engine
        .evaluation_log()
        .filter(|entry| {
            matches!(
                entry.kind,
                token_guard::policy::EvaluationLogKind::OverrideRequested { .. }
            )
        })
        .count();
    assert_eq!(overrides, 2);
}

#[test]
fn warnings_produce_allowed_with_warning() {
    let warning = SecurityPolicy {
        id: "min-app".to_string(),
        name: "Minimum app version".to_string(),
        version: 1,
        active: true,
        enforcement_level: EnforcementLevel::Warning,
        applicable_roles: vec!["planner".to_string()],
        conditions: vec![PolicyCondition::new(
            ConditionType::AppVersion,
            Operator::GreaterOrEqual,
            ConditionValue::Text("2.5".to_string()),
        )],
        actions: vec![PolicyAction::new(ActionKind::Log, 1)],
        allow_override: true,
    };
    let mut h = harness(THURSDAY, vec![warning]);
    let (decision, result) = h.engine.decide(&context()).unwrap();
    assert_eq!(decision, AccessDecision::AllowedWithWarning);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.violations[0].severity, Severity::Medium);
}

#[test]
fn type_mismatch_fails_closed() {
    let mut broken = encryption_policy();
    broken.conditions[0].value = ConditionValue::Text("yes".to_string());
    let mut h = harness(THURSDAY, vec![broken]);

    let result = h.engine.evaluate(&context());
    assert!(!result.allowed);
    assert_eq!(result.enforcement_level, EnforcementLevel::Blocking);
    assert_eq!(result.warnings, vec![token_guard::policy::FAIL_CLOSED_MESSAGE]);
}

#[test]
fn violations_are_persisted_and_reloaded() {
    let clock = Arc::new(ManualClock::new(THURSDAY));
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("policy.db");
    let db = db.to_str().unwrap();

    let violation_id = {
        let store = token_guard::SqliteCredentialStore::open(db).unwrap();
        let mut engine = PolicyEngine::new(
            PolicyEngineConfig::default(),
            vec![encryption_policy()],
            Box::new(store),
            clock.clone(),
        )
        .unwrap();
        let mut ctx = context();
        ctx.device.encrypted = false;
        let result = engine.evaluate(&ctx);
        result.violations[0].id.clone()
    };

    let store = token_guard::SqliteCredentialStore::open(db).unwrap();
    let mut engine = PolicyEngine::new(
        PolicyEngineConfig::default(),
        vec![encryption_policy()],
        Box::new(store),
        clock,
    )
    .unwrap();
    assert_eq!(engine.violations().len(), 1);
    assert!(engine.resolve_violation(&violation_id, "device re-encrypted").unwrap());

    let mut check = token_guard::SqliteCredentialStore::open(db).unwrap();
    let stored = check.load_violations().unwrap();
    assert!(stored[0].resolved);
    let events = check
        .security_events(&EventQuery {
            min_severity: Some(Severity::Critical),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(events.len(), 1);
}
