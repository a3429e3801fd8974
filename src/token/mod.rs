//! Credential token types.
//!
//! A `SecureToken` carries its plaintext `SecretValue` and only ever exists in
//! memory. What reaches storage is a `TokenRecord`: metadata plus ciphertext.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod manager;
mod scheduler;

pub use manager::{
    MaintenanceReport, StoreTokenRequest, TokenLifetimes, TokenManager, TokenSettings, TokenStats,
};
pub use scheduler::{MaintenanceHandle, MaintenanceScheduler};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(String);

impl TokenId {
    /// Fresh random identifier (128 bits from the OS RNG).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(format!("tok_{}", hex::encode(bytes)))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("token id cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
    Emergency,
    Temporary,
}

impl TokenType {
    pub const ALL: [TokenType; 4] = [
        TokenType::Access,
        TokenType::Refresh,
        TokenType::Emergency,
        TokenType::Temporary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::Emergency => "emergency",
            TokenType::Temporary => "temporary",
        }
    }

    /// Only long-lived session tokens are proactively rotated.
    pub fn is_rotatable(&self) -> bool {
        matches!(self, TokenType::Access | TokenType::Refresh)
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TokenType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "access" => Ok(TokenType::Access),
            "refresh" => Ok(TokenType::Refresh),
            "emergency" => Ok(TokenType::Emergency),
            "temporary" => Ok(TokenType::Temporary),
            other => Err(anyhow!("unknown token type: {}", other)),
        }
    }
}

/// Plaintext credential material. Wiped on drop and redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeddingContext {
    pub event_id: String,
    pub event_date: chrono::NaiveDate,
    pub is_event_day: bool,
    pub emergency_access: bool,
    pub team_role: String,
}

/// Decrypted, in-memory view of a stored credential.
#[derive(Clone, Debug)]
pub struct SecureToken {
    pub token_id: TokenId,
    pub token_type: TokenType,
    pub value: SecretValue,
    pub user_id: String,
    pub organization_id: String,
    pub device_id: String,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    pub last_used_ms: u64,
    pub scopes: Vec<String>,
    pub wedding_context: Option<WeddingContext>,
    pub rotation_count: u32,
    pub encrypted: bool,
}

impl SecureToken {
    pub fn lifetime_ms(&self) -> u64 {
        self.expires_at_ms.saturating_sub(self.issued_at_ms)
    }

    pub(crate) fn from_record(record: &TokenRecord, value: SecretValue) -> Self {
        Self {
            token_id: record.token_id.clone(),
            token_type: record.token_type,
            value,
            user_id: record.user_id.clone(),
            organization_id: record.organization_id.clone(),
            device_id: record.device_id.clone(),
            issued_at_ms: record.issued_at_ms,
            expires_at_ms: record.expires_at_ms,
            last_used_ms: record.last_used_ms,
            scopes: record.scopes.clone(),
            wedding_context: record.wedding_context.clone(),
            rotation_count: record.rotation_count,
            encrypted: record.encrypted,
        }
    }
}

/// Persisted form of a token: metadata and ciphertext, never plaintext.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRecord {
    pub token_id: TokenId,
    pub token_type: TokenType,
    pub user_id: String,
    pub organization_id: String,
    pub device_id: String,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    pub last_used_ms: u64,
    pub scopes: Vec<String>,
    pub wedding_context: Option<WeddingContext>,
    pub rotation_count: u32,
    pub ciphertext: Vec<u8>,
    pub encrypted: bool,
}

impl TokenRecord {
    pub fn is_event_day(&self) -> bool {
        self.wedding_context
            .as_ref()
            .map(|ctx| ctx.is_event_day)
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidReason {
    NotFound,
    Expired,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::NotFound => f.write_str("Token not found"),
            InvalidReason::Expired => f.write_str("Token expired"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub token: Option<SecureToken>,
    pub reason: Option<InvalidReason>,
    pub needs_rotation: bool,
    pub rotation_available: bool,
}

impl ValidationResult {
    pub(crate) fn invalid(reason: InvalidReason) -> Self {
        Self {
            valid: false,
            token: None,
            reason: Some(reason),
            needs_rotation: false,
            rotation_available: false,
        }
    }
}

/// Scopes are short capability strings such as `timeline:write`.
pub fn validate_scope(scope: &str) -> Result<()> {
    static SCOPE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = SCOPE_RE
        .get_or_init(|| regex::Regex::new(r"^[a-z][a-z0-9_.-]{0,31}(:[a-z0-9_.*-]{1,32})*$").unwrap());
    if !re.is_match(scope) {
        return Err(anyhow!("invalid scope '{}': expected e.g. 'timeline:write'", scope));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = TokenId::generate();
        let b = TokenId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tok_"));
        assert_eq!(a.as_str().len(), 4 + 32);
    }

    #[test]
    fn secret_value_debug_is_redacted() {
        let secret = SecretValue::new("hunter2");
        assert_eq!(format!("{:?}", secret), "SecretValue(<redacted>)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn token_type_parse() {
        assert_eq!("Refresh".parse::<TokenType>().unwrap(), TokenType::Refresh);
        assert!("bearer".parse::<TokenType>().is_err());
        assert!(TokenType::Access.is_rotatable());
        assert!(!TokenType::Emergency.is_rotatable());
    }

    #[test]
    fn scope_validation() {
        assert!(validate_scope("timeline:write").is_ok());
        assert!(validate_scope("vendors:*").is_ok());
        assert!(validate_scope("profile").is_ok());
        assert!(validate_scope("Timeline Write").is_err());
        assert!(validate_scope("").is_err());
    }

    #[test]
    fn invalid_reason_messages() {
        assert_eq!(InvalidReason::Expired.to_string(), "Token expired");
        assert_eq!(InvalidReason::NotFound.to_string(), "Token not found");
    }
}
