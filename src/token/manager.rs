use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::{
    validate_scope, InvalidReason, SecretValue, SecureToken, TokenId, TokenRecord, TokenType,
    ValidationResult, WeddingContext,
};
use crate::audit::{verify_chain, EventQuery, SecurityEvent, SecurityEventKind, Severity};
use crate::clock::{Clock, DAY_MS, HOUR_MS, MINUTE_MS};
use crate::crypto::{DeviceFingerprint, TokenCipher};
use crate::storage::CredentialStore;

/// Base lifetime per token type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenLifetimes {
    pub access_ms: u64,
    pub refresh_ms: u64,
    pub emergency_ms: u64,
    pub temporary_ms: u64,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access_ms: HOUR_MS,
            refresh_ms: 30 * DAY_MS,
            emergency_ms: 4 * HOUR_MS,
            temporary_ms: 15 * MINUTE_MS,
        }
    }
}

impl TokenLifetimes {
    pub fn base(&self, token_type: TokenType) -> u64 {
        match token_type {
            TokenType::Access => self.access_ms,
            TokenType::Refresh => self.refresh_ms,
            TokenType::Emergency => self.emergency_ms,
            TokenType::Temporary => self.temporary_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenSettings {
    pub lifetimes: TokenLifetimes,
    /// Added to access tokens issued with an event-day context.
    pub event_day_bonus_ms: u64,
    /// How long past expiry an event-day token stays usable.
    pub event_day_grace_ms: u64,
    /// Percentage of lifetime after which rotation is due.
    pub rotation_threshold_percent: u8,
    pub max_rotation_attempts: u32,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            lifetimes: TokenLifetimes::default(),
            event_day_bonus_ms: 8 * HOUR_MS,
            event_day_grace_ms: 2 * HOUR_MS,
            rotation_threshold_percent: 80,
            max_rotation_attempts: 5,
        }
    }
}

impl TokenSettings {
    pub fn lifetime_for(&self, token_type: TokenType, context: Option<&WeddingContext>) -> u64 {
        let base = self.lifetimes.base(token_type);
        let event_day = context.map(|ctx| ctx.is_event_day).unwrap_or(false);
        if event_day && token_type == TokenType::Access {
            base.saturating_add(self.event_day_bonus_ms)
        } else {
            base
        }
    }

    /// Expired once `now` passes `expires_at`, or the grace window for
    /// event-day tokens.
    pub fn is_expired(&self, record: &TokenRecord, now_ms: u64) -> bool {
        if now_ms <= record.expires_at_ms {
            return false;
        }
        if record.is_event_day() {
            return now_ms > record.expires_at_ms.saturating_add(self.event_day_grace_ms);
        }
        true
    }

    pub fn needs_rotation(&self, record: &TokenRecord, now_ms: u64) -> bool {
        if !record.token_type.is_rotatable() {
            return false;
        }
        let lifetime = record.expires_at_ms.saturating_sub(record.issued_at_ms) as u128;
        let elapsed = now_ms.saturating_sub(record.issued_at_ms) as u128;
        elapsed * 100 > lifetime * u128::from(self.rotation_threshold_percent)
    }
}

/// Input to `TokenManager::store_token`.
#[derive(Clone, Debug)]
pub struct StoreTokenRequest {
    pub value: SecretValue,
    pub token_type: TokenType,
    pub user_id: String,
    pub organization_id: String,
    pub device_id: String,
    pub scopes: Vec<String>,
    pub wedding_context: Option<WeddingContext>,
}

impl StoreTokenRequest {
    pub fn new(
        value: impl Into<String>,
        token_type: TokenType,
        user_id: &str,
        organization_id: &str,
        device_id: &str,
    ) -> Self {
        Self {
            value: SecretValue::new(value),
            token_type,
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            device_id: device_id.to_string(),
            scopes: Vec::new(),
            wedding_context: None,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_wedding_context(mut self, context: WeddingContext) -> Self {
        self.wedding_context = Some(context);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Newly flagged this pass; already-pending tokens are not repeated.
    pub flagged_for_rotation: Vec<TokenId>,
    pub expired_removed: Vec<TokenId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenStats {
    pub total: usize,
    pub by_type: BTreeMap<TokenType, usize>,
    pub event_day: usize,
    pub needing_rotation: usize,
}

/// Owns the locally held tokens: encrypted persistence, validation on read,
/// rotation, revocation and the expiry sweep.
///
/// Plaintext values exist only in the `SecureToken`s handed back to callers.
pub struct TokenManager {
    settings: TokenSettings,
    cipher: TokenCipher,
    store: Box<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    records: HashMap<TokenId, TokenRecord>,
    pending_rotation: BTreeSet<TokenId>,
}

impl TokenManager {
    /// Derive the device key (creating key metadata on first use) and load
    /// persisted token records.
    pub fn open(
        settings: TokenSettings,
        mut store: Box<dyn CredentialStore>,
        fingerprint: &DeviceFingerprint,
        kdf_iterations: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cipher =
            TokenCipher::load_or_init(&mut *store, fingerprint, kdf_iterations, clock.now_ms())?;
        let records: HashMap<TokenId, TokenRecord> = store
            .load_tokens()?
            .into_iter()
            .map(|record| (record.token_id.clone(), record))
            .collect();
        log::info!("token manager loaded {} stored tokens", records.len());
        Ok(Self {
            settings,
            cipher,
            store,
            clock,
            records,
            pending_rotation: BTreeSet::new(),
        })
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Metadata only.
    pub fn token_record(&self, token_id: &TokenId) -> Option<&TokenRecord> {
        self.records.get(token_id)
    }

    pub fn store_token(&mut self, request: StoreTokenRequest) -> Result<SecureToken> {
        if request.value.expose().is_empty() {
            return Err(anyhow!("token value cannot be empty"));
        }
        if request.user_id.trim().is_empty() {
            return Err(anyhow!("token user id cannot be empty"));
        }
        for scope in &request.scopes {
            validate_scope(scope)?;
        }

        let mut token_id = TokenId::generate();
        while self.records.contains_key(&token_id) {
            token_id = TokenId::generate();
        }
        let now = self.clock.now_ms();
        let lifetime = self
            .settings
            .lifetime_for(request.token_type, request.wedding_context.as_ref());
        let ciphertext = self
            .cipher
            .encrypt_str(request.value.expose(), token_id.as_str().as_bytes())?;

        let record = TokenRecord {
            token_id: token_id.clone(),
            token_type: request.token_type,
            user_id: request.user_id.clone(),
            organization_id: request.organization_id.clone(),
            device_id: request.device_id.clone(),
            issued_at_ms: now,
            expires_at_ms: now.saturating_add(lifetime),
            last_used_ms: now,
            scopes: request.scopes.clone(),
            wedding_context: request.wedding_context.clone(),
            rotation_count: 0,
            ciphertext,
            encrypted: true,
        };
        self.store.put_token(&record)?;
        let created = SecurityEvent::new(
            now,
            Severity::Low,
            SecurityEventKind::TokenCreated {
                token_type: record.token_type,
                event_day: record.is_event_day(),
            },
        )
        .with_user(&record.user_id)
        .with_token(&token_id);
        if let Err(err) = self.record_event(created) {
            // The caller never sees this id, so the row must not outlive the error.
            if let Err(undo) = self.store.delete_token(&token_id) {
                log::error!("failed to roll back token {}: {:#}", token_id, undo);
            }
            return Err(err);
        }
        self.records.insert(token_id, record.clone());
        Ok(SecureToken::from_record(&record, request.value))
    }

    /// Validate and decrypt. Missing or expired tokens are reported in the
    /// result; only storage and cipher faults are errors.
    pub fn get_token(&mut self, token_id: &TokenId) -> Result<ValidationResult> {
        let now = self.clock.now_ms();
        let Some(mut record) = self.records.get(token_id).cloned() else {
            return Ok(ValidationResult::invalid(InvalidReason::NotFound));
        };
        if self.settings.is_expired(&record, now) {
            return Ok(ValidationResult::invalid(InvalidReason::Expired));
        }
        if now > record.expires_at_ms {
            log::info!("token {} used inside event-day grace window", token_id);
        }

        let value = self
            .cipher
            .decrypt_str(&record.ciphertext, token_id.as_str().as_bytes())?;
        record.last_used_ms = now;
        self.store.put_token(&record)?;

        let needs_rotation = self.settings.needs_rotation(&record, now);
        let rotation_available = record.rotation_count < self.settings.max_rotation_attempts;
        let token = SecureToken::from_record(&record, SecretValue::new(value));
        self.records.insert(token_id.clone(), record);

        Ok(ValidationResult {
            valid: true,
            token: Some(token),
            reason: None,
            needs_rotation,
            rotation_available,
        })
    }

    /// Replace the value of a valid token. `None` when the token is missing,
    /// expired, or at its rotation cap; state is unchanged in those cases.
    pub fn rotate_token(
        &mut self,
        token_id: &TokenId,
        new_value: impl Into<String>,
    ) -> Result<Option<SecureToken>> {
        let new_value = SecretValue::new(new_value);
        if new_value.expose().is_empty() {
            return Err(anyhow!("token value cannot be empty"));
        }
        let now = self.clock.now_ms();
        let Some(mut record) = self.records.get(token_id).cloned() else {
            log::debug!("rotation requested for unknown token {}", token_id);
            return Ok(None);
        };
        if self.settings.is_expired(&record, now) {
            log::debug!("rotation requested for expired token {}", token_id);
            return Ok(None);
        }
        if record.rotation_count >= self.settings.max_rotation_attempts {
            self.record_event(
                SecurityEvent::new(
                    now,
                    Severity::Medium,
                    SecurityEventKind::RotationRefused {
                        rotation_count: record.rotation_count,
                    },
                )
                .with_user(&record.user_id)
                .with_token(token_id),
            )?;
            return Ok(None);
        }

        let previous = record.clone();
        let lifetime = self
            .settings
            .lifetime_for(record.token_type, record.wedding_context.as_ref());
        record.ciphertext = self
            .cipher
            .encrypt_str(new_value.expose(), token_id.as_str().as_bytes())?;
        record.issued_at_ms = now;
        record.expires_at_ms = now.saturating_add(lifetime);
        record.last_used_ms = now;
        record.rotation_count += 1;
        self.store.put_token(&record)?;
        let rotated = SecurityEvent::new(
            now,
            Severity::Low,
            SecurityEventKind::TokenRotated {
                rotation_count: record.rotation_count,
            },
        )
        .with_user(&record.user_id)
        .with_token(token_id);
        if let Err(err) = self.record_event(rotated) {
            if let Err(undo) = self.store.put_token(&previous) {
                log::error!("failed to restore token {}: {:#}", token_id, undo);
            }
            return Err(err);
        }
        self.records.insert(token_id.clone(), record.clone());
        self.pending_rotation.remove(token_id);
        Ok(Some(SecureToken::from_record(&record, new_value)))
    }

    /// Idempotent delete. Returns false when nothing was held. The token is
    /// gone once the store delete succeeds, even if the audit append fails.
    pub fn revoke_token(&mut self, token_id: &TokenId, reason: &str) -> Result<bool> {
        let persisted = self.store.delete_token(token_id)?;
        let held = self.records.remove(token_id);
        self.pending_rotation.remove(token_id);
        if held.is_none() && !persisted {
            return Ok(false);
        }

        let mut event = SecurityEvent::new(
            self.clock.now_ms(),
            Severity::Medium,
            SecurityEventKind::TokenRevoked {
                reason: reason.to_string(),
            },
        )
        .with_token(token_id);
        if let Some(record) = &held {
            event = event.with_user(&record.user_id);
        }
        self.record_event(event)?;
        Ok(true)
    }

    /// Revoke every token owned by `user_id`; returns how many were removed.
    pub fn revoke_user_tokens(&mut self, user_id: &str, reason: &str) -> Result<usize> {
        let ids: Vec<TokenId> = self
            .records
            .values()
            .filter(|record| record.user_id == user_id)
            .map(|record| record.token_id.clone())
            .collect();
        let mut revoked = 0;
        for id in ids {
            if self.revoke_token(&id, reason)? {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    /// One maintenance pass: delete expired tokens and flag the ones due for
    /// rotation. Re-issuing flagged tokens is up to the caller.
    pub fn run_maintenance(&mut self) -> Result<MaintenanceReport> {
        let now = self.clock.now_ms();
        let mut report = MaintenanceReport::default();
        let mut ids: Vec<TokenId> = self.records.keys().cloned().collect();
        ids.sort();

        for id in ids {
            let Some(record) = self.records.get(&id).cloned() else {
                continue;
            };
            if self.settings.is_expired(&record, now) {
                self.store.delete_token(&id)?;
                self.records.remove(&id);
                self.pending_rotation.remove(&id);
                self.record_event(
                    SecurityEvent::new(now, Severity::Low, SecurityEventKind::TokenExpired)
                        .with_user(&record.user_id)
                        .with_token(&id),
                )?;
                report.expired_removed.push(id);
            } else if self.settings.needs_rotation(&record, now)
                && !self.pending_rotation.contains(&id)
            {
                self.record_event(
                    SecurityEvent::new(now, Severity::Low, SecurityEventKind::RotationDue)
                        .with_user(&record.user_id)
                        .with_token(&id),
                )?;
                self.pending_rotation.insert(id.clone());
                report.flagged_for_rotation.push(id);
            }
        }

        if !report.expired_removed.is_empty() || !report.flagged_for_rotation.is_empty() {
            log::info!(
                "maintenance: {} expired removed, {} flagged for rotation",
                report.expired_removed.len(),
                report.flagged_for_rotation.len()
            );
        }
        Ok(report)
    }

    pub fn pending_rotations(&self) -> Vec<TokenId> {
        self.pending_rotation.iter().cloned().collect()
    }

    /// Metadata for a user's tokens, oldest first.
    pub fn tokens_for_user(&self, user_id: &str) -> Vec<TokenRecord> {
        let mut out: Vec<TokenRecord> = self
            .records
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.issued_at_ms
                .cmp(&b.issued_at_ms)
                .then_with(|| a.token_id.cmp(&b.token_id))
        });
        out
    }

    pub fn stats(&self) -> TokenStats {
        let now = self.clock.now_ms();
        let mut stats = TokenStats {
            total: self.records.len(),
            ..TokenStats::default()
        };
        for record in self.records.values() {
            *stats.by_type.entry(record.token_type).or_insert(0) += 1;
            if record.is_event_day() {
                stats.event_day += 1;
            }
            if self.settings.needs_rotation(record, now) {
                stats.needing_rotation += 1;
            }
        }
        stats
    }

    pub fn security_events(&mut self, query: &EventQuery) -> Result<Vec<SecurityEvent>> {
        self.store.security_events(query)
    }

    /// Verify the persisted event chain; returns the number of entries.
    pub fn verify_event_chain(&mut self) -> Result<usize> {
        let sealed = self.store.sealed_security_events()?;
        verify_chain(&sealed)
    }

    fn record_event(&mut self, event: SecurityEvent) -> Result<()> {
        event.emit_log();
        self.store.append_security_event(&event)
    }
}
