use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{
    violation_severity, ActionKind, CriticalDayCalendar, EnforcementLevel, EvaluationContext,
    PolicyAction, PolicyViolation, SecurityPolicy,
};
use crate::audit::{SecurityEvent, SecurityEventKind, Severity};
use crate::clock::Clock;
use crate::storage::CredentialStore;

/// Remediation text returned when evaluation fails closed.
pub const FAIL_CLOSED_MESSAGE: &str =
    "Access could not be verified. Retry, or contact your administrator if the problem persists.";

const OVERRIDE_NOTE: &str =
    "Critical-day override available: request an override to proceed despite these violations.";

#[derive(Clone, Debug)]
pub struct PolicyEngineConfig {
    pub cache_ttl_ms: u64,
    pub calendar: CriticalDayCalendar,
    /// Evaluation log entries kept in memory (oldest dropped first).
    pub max_log_entries: usize,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,
            calendar: CriticalDayCalendar::default(),
            max_log_entries: 1_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvaluationResult {
    pub allowed: bool,
    pub violations: Vec<PolicyViolation>,
    pub required_actions: Vec<PolicyAction>,
    pub warnings: Vec<String>,
    pub enforcement_level: EnforcementLevel,
    pub bypass_available: bool,
    /// True when at least one relaxable condition was skipped on a critical day.
    pub context_override_applied: bool,
    pub evaluated_at_ms: u64,
}

impl EvaluationResult {
    fn fail_closed(now_ms: u64) -> Self {
        Self {
            allowed: false,
            violations: Vec::new(),
            required_actions: vec![PolicyAction::new(ActionKind::Deny, u8::MAX)],
            warnings: vec![FAIL_CLOSED_MESSAGE.to_string()],
            enforcement_level: EnforcementLevel::Blocking,
            bypass_available: false,
            context_override_applied: false,
            evaluated_at_ms: now_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OverrideDecision {
    pub approved: bool,
    pub bypass_token: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluationLogKind {
    Evaluated {
        allowed: bool,
        violation_count: usize,
    },
    FailedClosed,
    OverrideRequested {
        approved: bool,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvaluationLogEntry {
    pub timestamp_ms: u64,
    pub user_id: String,
    pub context_id: String,
    pub kind: EvaluationLogKind,
}

/// Per-request decision state.
///
/// `Denied` only ever moves to `Allowed` through `apply_override`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessDecision {
    Unevaluated,
    Evaluating,
    Allowed,
    Denied,
    AllowedWithWarning,
}

impl AccessDecision {
    pub fn begin(self) -> Result<Self> {
        match self {
            AccessDecision::Unevaluated => Ok(AccessDecision::Evaluating),
            other => Err(anyhow!("cannot start evaluation from state {:?}", other)),
        }
    }

    pub fn conclude(self, result: &EvaluationResult) -> Result<Self> {
        match self {
            AccessDecision::Evaluating if !result.allowed => Ok(AccessDecision::Denied),
            AccessDecision::Evaluating if !result.warnings.is_empty() => {
                Ok(AccessDecision::AllowedWithWarning)
            }
            AccessDecision::Evaluating => Ok(AccessDecision::Allowed),
            other => Err(anyhow!("cannot conclude evaluation from state {:?}", other)),
        }
    }

    /// An unapproved decision leaves a denial in place.
    pub fn apply_override(self, decision: &OverrideDecision) -> Result<Self> {
        match self {
            AccessDecision::Denied if decision.approved && decision.bypass_token.is_some() => {
                Ok(AccessDecision::Allowed)
            }
            AccessDecision::Denied => Ok(AccessDecision::Denied),
            other => Err(anyhow!("override only applies to a denied decision, not {:?}", other)),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(
            self,
            AccessDecision::Allowed | AccessDecision::AllowedWithWarning
        )
    }
}

struct CacheEntry {
    result: Arc<EvaluationResult>,
    expires_at_ms: u64,
}

/// Evaluates registered policies against caller contexts.
///
/// Owned by the host; nothing here is process-global.
pub struct PolicyEngine {
    config: PolicyEngineConfig,
    policies: Vec<SecurityPolicy>,
    violations: Vec<PolicyViolation>,
    cache: HashMap<String, CacheEntry>,
    log: VecDeque<EvaluationLogEntry>,
    store: Box<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl PolicyEngine {
    pub fn new(
        config: PolicyEngineConfig,
        policies: Vec<SecurityPolicy>,
        mut store: Box<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let violations = store.load_violations()?;
        let mut engine = Self {
            config,
            policies: Vec::with_capacity(policies.len()),
            violations,
            cache: HashMap::new(),
            log: VecDeque::new(),
            store,
            clock,
        };
        for policy in policies {
            engine.add_policy(policy)?;
        }
        log::info!(
            "policy engine ready: {} policies, {} stored violations",
            engine.policies.len(),
            engine.violations.len()
        );
        Ok(engine)
    }

    pub fn policies(&self) -> &[SecurityPolicy] {
        &self.policies
    }

    pub fn policy(&self, policy_id: &str) -> Option<&SecurityPolicy> {
        self.policies.iter().find(|p| p.id == policy_id)
    }

    pub fn violations(&self) -> &[PolicyViolation] {
        &self.violations
    }

    pub fn unresolved_violations(&self) -> impl Iterator<Item = &PolicyViolation> {
        self.violations.iter().filter(|v| !v.resolved)
    }

    pub fn evaluation_log(&self) -> impl Iterator<Item = &EvaluationLogEntry> {
        self.log.iter()
    }

    pub fn is_critical_day(&self) -> bool {
        self.config.calendar.is_critical_day(self.clock.now_ms())
    }

    pub fn add_policy(&mut self, policy: SecurityPolicy) -> Result<()> {
        policy.validate()?;
        if self.policy(&policy.id).is_some() {
            return Err(anyhow!("policy {} already registered", policy.id));
        }
        log::debug!("registered policy {} v{}", policy.id, policy.version);
        self.policies.push(policy);
        self.cache.clear();
        Ok(())
    }

    /// Replace a registered policy; the stored version is bumped by one.
    pub fn update_policy(&mut self, mut policy: SecurityPolicy) -> Result<u32> {
        policy.validate()?;
        let existing = self
            .policies
            .iter_mut()
            .find(|p| p.id == policy.id)
            .ok_or_else(|| anyhow!("unknown policy {}", policy.id))?;
        policy.version = existing.version.saturating_add(1);
        let version = policy.version;
        *existing = policy;
        self.cache.clear();
        log::info!("updated policy to v{}", version);
        Ok(version)
    }

    /// Returns false when no policy has that id.
    pub fn set_policy_active(&mut self, policy_id: &str, active: bool) -> bool {
        match self.policies.iter_mut().find(|p| p.id == policy_id) {
            Some(policy) => {
                policy.active = active;
                self.cache.clear();
                log::info!("policy {} active={}", policy_id, active);
                true
            }
            None => false,
        }
    }

    /// Mark a violation resolved. Returns false when it does not exist or is
    /// already resolved.
    pub fn resolve_violation(&mut self, violation_id: &str, method: &str) -> Result<bool> {
        let Some(violation) = self
            .violations
            .iter_mut()
            .find(|v| v.id == violation_id && !v.resolved)
        else {
            return Ok(false);
        };
        let mut updated = violation.clone();
        updated.resolved = true;
        updated.resolution_method = Some(method.to_string());
        self.store.put_violation(&updated)?;
        *violation = updated;
        Ok(true)
    }

    /// Evaluate every applicable policy against `ctx`.
    ///
    /// Identical contexts within the cache TTL share one result. Internal
    /// faults produce an uncached denial instead of an error.
    pub fn evaluate(&mut self, ctx: &EvaluationContext) -> Arc<EvaluationResult> {
        let now = self.clock.now_ms();
        let special_day = self.config.calendar.is_critical_day(now);
        let context_hash = match ctx.fingerprint() {
            Ok(hash) => hash,
            Err(err) => return self.fail_closed(ctx, "-", err, now),
        };
        let cache_key = format!("{}:{}", context_hash, u8::from(special_day));

        self.cache.retain(|_, entry| entry.expires_at_ms > now);
        if let Some(entry) = self.cache.get(&cache_key) {
            return Arc::clone(&entry.result);
        }

        match self.evaluate_uncached(ctx, &context_hash, special_day, now) {
            Ok(result) => {
                let result = Arc::new(result);
                self.cache.insert(
                    cache_key,
                    CacheEntry {
                        result: Arc::clone(&result),
                        expires_at_ms: now.saturating_add(self.config.cache_ttl_ms),
                    },
                );
                self.push_log(EvaluationLogEntry {
                    timestamp_ms: now,
                    user_id: ctx.user_id.clone(),
                    context_id: context_hash,
                    kind: EvaluationLogKind::Evaluated {
                        allowed: result.allowed,
                        violation_count: result.violations.len(),
                    },
                });
                result
            }
            Err(err) => self.fail_closed(ctx, &context_hash, err, now),
        }
    }

    /// Evaluate and walk the decision state machine to its outcome.
    pub fn decide(
        &mut self,
        ctx: &EvaluationContext,
    ) -> Result<(AccessDecision, Arc<EvaluationResult>)> {
        let state = AccessDecision::Unevaluated.begin()?;
        let result = self.evaluate(ctx);
        let state = state.conclude(&result)?;
        Ok((state, result))
    }

    /// Ask to bypass violations. Only approved on a critical day; storage
    /// failures while recording the request propagate.
    pub fn request_override(
        &mut self,
        user_id: &str,
        context_id: &str,
        reason: &str,
    ) -> Result<OverrideDecision> {
        let now = self.clock.now_ms();
        let decision = if self.config.calendar.is_critical_day(now) {
            let mut hasher = Sha256::new();
            hasher.update(user_id.as_bytes());
            hasher.update(b"|");
            hasher.update(context_id.as_bytes());
            hasher.update(b"|");
            hasher.update(now.to_le_bytes());
            OverrideDecision {
                approved: true,
                bypass_token: Some(hex::encode(hasher.finalize())),
                message: "Override approved for the current critical operations day.".to_string(),
            }
        } else {
            OverrideDecision {
                approved: false,
                bypass_token: None,
                message: "Overrides are only available on critical operations days.".to_string(),
            }
        };

        self.push_log(EvaluationLogEntry {
            timestamp_ms: now,
            user_id: user_id.to_string(),
            context_id: context_id.to_string(),
            kind: EvaluationLogKind::OverrideRequested {
                approved: decision.approved,
                reason: reason.to_string(),
            },
        });
        let severity = if decision.approved {
            Severity::High
        } else {
            Severity::Medium
        };
        self.record_event(
            SecurityEvent::new(
                now,
                severity,
                SecurityEventKind::OverrideRequested {
                    context_id: context_id.to_string(),
                    approved: decision.approved,
                    reason: reason.to_string(),
                },
            )
            .with_user(user_id),
        )?;
        Ok(decision)
    }

    fn evaluate_uncached(
        &mut self,
        ctx: &EvaluationContext,
        context_hash: &str,
        special_day: bool,
        now: u64,
    ) -> Result<EvaluationResult> {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let mut required_actions: Vec<PolicyAction> = Vec::new();
        let mut enforcement_level = EnforcementLevel::Advisory;
        let mut relaxed = false;
        let mut overridable = false;

        for policy in self
            .policies
            .iter()
            .filter(|p| p.active && p.applies_to(&ctx.role))
        {
            let mut failed = false;
            for condition in &policy.conditions {
                if condition.contextually_relaxed && special_day {
                    relaxed = true;
                    continue;
                }
                if condition.evaluate(ctx)? {
                    continue;
                }
                failed = true;
                let message = format!("{}: {}", policy.name, condition.describe());
                if policy.enforcement_level == EnforcementLevel::Warning {
                    warnings.push(message.clone());
                }
                violations.push(PolicyViolation {
                    id: new_violation_id(),
                    policy_id: policy.id.clone(),
                    policy_name: policy.name.clone(),
                    condition: condition.condition_type,
                    severity: violation_severity(
                        condition.condition_type,
                        policy.enforcement_level,
                    ),
                    enforcement_level: policy.enforcement_level,
                    message,
                    user_id: ctx.user_id.clone(),
                    context_hash: context_hash.to_string(),
                    timestamp_ms: now,
                    resolved: false,
                    resolution_method: None,
                });
            }
            if failed {
                enforcement_level = enforcement_level.max(policy.enforcement_level);
                overridable |= policy.allow_override;
                for action in &policy.actions {
                    if action.kind != ActionKind::Allow && !required_actions.contains(action) {
                        required_actions.push(action.clone());
                    }
                }
            }
        }
        required_actions.sort_by(|a, b| b.priority.cmp(&a.priority));

        let allowed = !violations.iter().any(|v| {
            v.severity == Severity::Critical && v.enforcement_level == EnforcementLevel::Blocking
        });
        let bypass_available = special_day
            && overridable
            && !violations.iter().any(|v| v.condition.is_critical());
        if bypass_available {
            warnings.push(OVERRIDE_NOTE.to_string());
        }

        for violation in &violations {
            self.store.put_violation(violation)?;
            self.violations.push(violation.clone());
            self.record_event(
                SecurityEvent::new(
                    now,
                    violation.severity,
                    SecurityEventKind::PolicyViolation {
                        policy_id: violation.policy_id.clone(),
                        condition: violation.condition,
                    },
                )
                .with_user(&ctx.user_id),
            )?;
        }

        if !allowed {
            log::warn!(
                "access denied for user {} ({} violations)",
                ctx.user_id,
                violations.len()
            );
        }

        Ok(EvaluationResult {
            allowed,
            violations,
            required_actions,
            warnings,
            enforcement_level,
            bypass_available,
            context_override_applied: relaxed,
            evaluated_at_ms: now,
        })
    }

    fn fail_closed(
        &mut self,
        ctx: &EvaluationContext,
        context_id: &str,
        err: anyhow::Error,
        now: u64,
    ) -> Arc<EvaluationResult> {
        log::error!(
            "policy evaluation failed closed for user {}: {:#}",
            ctx.user_id,
            err
        );
        let event = SecurityEvent::new(
            now,
            Severity::High,
            SecurityEventKind::EvaluationFailed {
                message: err.to_string(),
            },
        )
        .with_user(&ctx.user_id);
        if let Err(store_err) = self.record_event(event) {
            log::error!("failed to record evaluation failure: {:#}", store_err);
        }
        self.push_log(EvaluationLogEntry {
            timestamp_ms: now,
            user_id: ctx.user_id.clone(),
            context_id: context_id.to_string(),
            kind: EvaluationLogKind::FailedClosed,
        });
        Arc::new(EvaluationResult::fail_closed(now))
    }

    fn record_event(&mut self, event: SecurityEvent) -> Result<()> {
        event.emit_log();
        self.store.append_security_event(&event)
    }

    fn push_log(&mut self, entry: EvaluationLogEntry) {
        if self.config.max_log_entries == 0 {
            return;
        }
        while self.log.len() >= self.config.max_log_entries {
            self.log.pop_front();
        }
        self.log.push_back(entry);
    }
}

fn new_violation_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("vio_{}", hex::encode(bytes))
}
