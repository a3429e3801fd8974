//! Security event records.
//!
//! Every token lifecycle change and every policy violation is written as a
//! `SecurityEvent`. Persisted events are hash-chained: each entry commits to
//! the previous entry hash, so deleting or editing a row breaks the chain.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::policy::ConditionType;
use crate::token::{TokenId, TokenType};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(anyhow!("unknown severity: {}", other)),
        }
    }

    fn log_level(&self) -> log::Level {
        match self {
            Severity::Low => log::Level::Debug,
            Severity::Medium => log::Level::Info,
            Severity::High => log::Level::Warn,
            Severity::Critical => log::Level::Error,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened. One variant per event shape; no free-form metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEventKind {
    TokenCreated {
        token_type: TokenType,
        event_day: bool,
    },
    TokenRotated {
        rotation_count: u32,
    },
    RotationRefused {
        rotation_count: u32,
    },
    RotationDue,
    TokenRevoked {
        reason: String,
    },
    TokenExpired,
    PolicyViolation {
        policy_id: String,
        condition: ConditionType,
    },
    OverrideRequested {
        context_id: String,
        approved: bool,
        reason: String,
    },
    EvaluationFailed {
        message: String,
    },
}

impl SecurityEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            SecurityEventKind::TokenCreated { .. } => "token_created",
            SecurityEventKind::TokenRotated { .. } => "token_rotated",
            SecurityEventKind::RotationRefused { .. } => "rotation_refused",
            SecurityEventKind::RotationDue => "rotation_due",
            SecurityEventKind::TokenRevoked { .. } => "token_revoked",
            SecurityEventKind::TokenExpired => "token_expired",
            SecurityEventKind::PolicyViolation { .. } => "policy_violation",
            SecurityEventKind::OverrideRequested { .. } => "override_requested",
            SecurityEventKind::EvaluationFailed { .. } => "evaluation_failed",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityEvent {
    pub timestamp_ms: u64,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub token_id: Option<TokenId>,
    pub kind: SecurityEventKind,
}

impl SecurityEvent {
    pub fn new(timestamp_ms: u64, severity: Severity, kind: SecurityEventKind) -> Self {
        Self {
            timestamp_ms,
            severity,
            user_id: None,
            token_id: None,
            kind,
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_token(mut self, token_id: &TokenId) -> Self {
        self.token_id = Some(token_id.clone());
        self
    }

    /// Mirror the event to the `log` facade at a level matching its severity.
    pub fn emit_log(&self) {
        log::log!(
            self.severity.log_level(),
            "security event {} severity={} user={} token={}",
            self.kind.label(),
            self.severity,
            self.user_id.as_deref().unwrap_or("-"),
            self.token_id.as_ref().map(|t| t.as_str()).unwrap_or("-"),
        );
    }
}

/// A persisted event together with its chain link.
#[derive(Clone, Debug)]
pub struct SealedSecurityEvent {
    pub id: i64,
    pub payload_json: String,
    pub prev_hash: [u8; 32],
    pub entry_hash: [u8; 32],
}

impl SealedSecurityEvent {
    pub fn event(&self) -> Result<SecurityEvent> {
        Ok(serde_json::from_str(&self.payload_json)?)
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    pub user_id: Option<String>,
    pub min_severity: Option<Severity>,
    /// Most recent N entries; `None` returns everything.
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn matches(&self, ev: &SecurityEvent) -> bool {
        if let Some(user) = &self.user_id {
            if ev.user_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(floor) = self.min_severity {
            if ev.severity < floor {
                return false;
            }
        }
        true
    }
}

/// Hashes an event payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Walk a chain (oldest first) and return the number of verified entries.
pub fn verify_chain(entries: &[SealedSecurityEvent]) -> Result<usize> {
    let mut expected_prev = [0u8; 32];
    for entry in entries {
        if entry.prev_hash != expected_prev {
            return Err(anyhow!(
                "security event chain broken at entry {}: prev_hash mismatch",
                entry.id
            ));
        }
        let recomputed = hash_entry(&entry.prev_hash, entry.payload_json.as_bytes());
        if recomputed != entry.entry_hash {
            return Err(anyhow!(
                "security event chain broken at entry {}: entry_hash mismatch",
                entry.id
            ));
        }
        expected_prev = entry.entry_hash;
    }
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal(events: &[SecurityEvent]) -> Vec<SealedSecurityEvent> {
        let mut prev = [0u8; 32];
        let mut out = Vec::new();
        for (idx, ev) in events.iter().enumerate() {
            let payload_json = serde_json::to_string(ev).unwrap();
            let entry_hash = hash_entry(&prev, payload_json.as_bytes());
            out.push(SealedSecurityEvent {
                id: idx as i64 + 1,
                payload_json,
                prev_hash: prev,
                entry_hash,
            });
            prev = entry_hash;
        }
        out
    }

    #[test]
    fn chain_verifies_and_detects_edits() {
        let events = vec![
            SecurityEvent::new(1, Severity::Low, SecurityEventKind::TokenExpired),
            SecurityEvent::new(
                2,
                Severity::Medium,
                SecurityEventKind::TokenRevoked {
                    reason: "logout".to_string(),
                },
            )
            .with_user("user-1"),
        ];
        let mut sealed = seal(&events);
        assert_eq!(verify_chain(&sealed).unwrap(), 2);

        sealed[0].payload_json = sealed[0].payload_json.replace("\"low\"", "\"high\"");
        assert!(verify_chain(&sealed).is_err());
    }

    #[test]
    fn removed_entry_breaks_chain() {
        let events = vec![
            SecurityEvent::new(1, Severity::Low, SecurityEventKind::RotationDue),
            SecurityEvent::new(2, Severity::Low, SecurityEventKind::RotationDue),
            SecurityEvent::new(3, Severity::Low, SecurityEventKind::RotationDue),
        ];
        let mut sealed = seal(&events);
        sealed.remove(1);
        assert!(verify_chain(&sealed).is_err());
    }

    #[test]
    fn event_kind_serializes_with_type_tag() {
        let kind = SecurityEventKind::TokenRotated { rotation_count: 2 };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"type":"token_rotated","rotation_count":2}"#);
    }

    #[test]
    fn query_filters_by_user_and_severity() {
        let ev = SecurityEvent::new(1, Severity::Medium, SecurityEventKind::TokenExpired)
            .with_user("alice");
        let query = EventQuery {
            user_id: Some("alice".to_string()),
            min_severity: Some(Severity::High),
            limit: None,
        };
        assert!(!query.matches(&ev));
        let query = EventQuery {
            min_severity: Some(Severity::Medium),
            ..EventQuery::default()
        };
        assert!(query.matches(&ev));
    }

    #[test]
    fn severity_parse_and_order() {
        assert_eq!(Severity::parse(" Critical ").unwrap(), Severity::Critical);
        assert!(Severity::parse("severe").is_err());
        assert!(Severity::Low < Severity::Critical);
    }
}
