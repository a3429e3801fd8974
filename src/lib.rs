//! Token Guard
//!
//! Client-side credential lifecycle management and access policy evaluation
//! for the event-operations mobile apps.
//!
//! # Architecture
//!
//! - **Tokens** (`token`): typed credentials with per-type lifetimes. Values
//!   are encrypted with a device-bound key before they reach storage and are
//!   only ever decrypted into memory on read.
//! - **Key handling** (`crypto`): the token key is re-derived with
//!   PBKDF2-HMAC-SHA256 from a device fingerprint and a persisted salt. The
//!   key itself is never written anywhere.
//! - **Maintenance** (`token::MaintenanceScheduler`): a background sweep that
//!   deletes expired tokens and flags tokens due for rotation.
//! - **Policies** (`policy`): declarative conditions over a device, network
//!   and app snapshot. Evaluation is cached per context hash and fails closed.
//! - **Audit** (`audit`): every lifecycle change and violation is appended
//!   to a hash-chained security event log.
//!
//! Nothing is process-global: the host owns a `TokenGuard` (or the engines
//! directly) and passes it to every call.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod audit;
pub mod cli;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod policy;
pub mod storage;
pub mod token;

pub use audit::{EventQuery, SecurityEvent, SecurityEventKind, Severity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuardConfig;
pub use crypto::{DeviceFingerprint, DeviceSecret};
pub use policy::{
    AccessDecision, EvaluationContext, EvaluationResult, OverrideDecision, PolicyEngine,
    SecurityPolicy,
};
pub use storage::{CredentialStore, InMemoryCredentialStore, SqliteCredentialStore};
pub use token::{
    MaintenanceHandle, MaintenanceScheduler, SecureToken, StoreTokenRequest, TokenId,
    TokenManager, TokenType, ValidationResult,
};

/// Host-owned context holding the token manager and the policy engine.
pub struct TokenGuard {
    config: GuardConfig,
    tokens: Arc<Mutex<TokenManager>>,
    policies: PolicyEngine,
}

impl TokenGuard {
    /// Open against the configured SQLite database, creating the device
    /// secret file on first use.
    pub fn open(cfg: &GuardConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let secret_path = cfg.device_secret_path()?;
        let secret = DeviceSecret::load_or_create(&secret_path)?;
        let fingerprint = DeviceFingerprint::new(secret.as_bytes(), &cfg.device_id)?;
        let token_store = SqliteCredentialStore::open(&cfg.db_path)?;
        let policy_store = SqliteCredentialStore::open(&cfg.db_path)?;
        Self::with_stores(
            cfg,
            Box::new(token_store),
            Box::new(policy_store),
            &fingerprint,
            clock,
        )
    }

    pub fn with_stores(
        cfg: &GuardConfig,
        token_store: Box<dyn CredentialStore>,
        policy_store: Box<dyn CredentialStore>,
        fingerprint: &DeviceFingerprint,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let policies = seed_policies(cfg)?;
        let tokens = TokenManager::open(
            cfg.tokens.clone(),
            token_store,
            fingerprint,
            cfg.kdf_iterations,
            clock.clone(),
        )?;
        let engine = PolicyEngine::new(cfg.engine_config(), policies, policy_store, clock)?;
        Ok(Self {
            config: cfg.clone(),
            tokens: Arc::new(Mutex::new(tokens)),
            policies: engine,
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn tokens(&self) -> Result<MutexGuard<'_, TokenManager>> {
        self.tokens
            .lock()
            .map_err(|_| anyhow!("token manager lock poisoned"))
    }

    pub fn shared_tokens(&self) -> Arc<Mutex<TokenManager>> {
        self.tokens.clone()
    }

    pub fn policies(&self) -> &PolicyEngine {
        &self.policies
    }

    pub fn policies_mut(&mut self) -> &mut PolicyEngine {
        &mut self.policies
    }

    /// Start the background sweep at the configured rotation interval.
    pub fn spawn_maintenance(&self) -> Result<MaintenanceHandle> {
        MaintenanceScheduler::new(self.shared_tokens(), self.config.rotation_interval).spawn()
    }
}

/// Built-in policies, with entries from the configured policy file replacing
/// built-ins of the same id.
fn seed_policies(cfg: &GuardConfig) -> Result<Vec<SecurityPolicy>> {
    let mut policies = policy::default_policies();
    if let Some(path) = &cfg.policy.policy_file {
        for extra in policy::defaults::load_policy_file(path)? {
            match policies.iter_mut().find(|p| p.id == extra.id) {
                Some(existing) => {
                    log::info!("policy file overrides built-in policy {}", extra.id);
                    *existing = extra;
                }
                None => policies.push(extra),
            }
        }
    }
    Ok(policies)
}
