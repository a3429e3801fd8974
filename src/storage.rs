use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::time::Duration;

use crate::audit::{hash_entry, EventQuery, SealedSecurityEvent, SecurityEvent};
use crate::crypto::KeyMetadata;
use crate::policy::PolicyViolation;
use crate::token::{TokenId, TokenRecord, TokenType};

/// Local persistent store: tokens, security events, key metadata, violations.
pub trait CredentialStore: Send {
    /// Insert or replace a token record.
    fn put_token(&mut self, record: &TokenRecord) -> Result<()>;

    /// Returns false when no record existed.
    fn delete_token(&mut self, token_id: &TokenId) -> Result<bool>;

    fn load_tokens(&mut self) -> Result<Vec<TokenRecord>>;

    fn load_key_metadata(&mut self) -> Result<Option<KeyMetadata>>;

    fn save_key_metadata(&mut self, metadata: &KeyMetadata) -> Result<()>;

    fn append_security_event(&mut self, event: &SecurityEvent) -> Result<()>;

    /// Matching events, oldest first.
    fn security_events(&mut self, query: &EventQuery) -> Result<Vec<SecurityEvent>>;

    /// The full event chain, oldest first.
    fn sealed_security_events(&mut self) -> Result<Vec<SealedSecurityEvent>>;

    /// Insert or replace a violation by id.
    fn put_violation(&mut self, violation: &PolicyViolation) -> Result<()>;

    fn load_violations(&mut self) -> Result<Vec<PolicyViolation>>;
}

pub struct SqliteCredentialStore {
    conn: Connection,
}

impl SqliteCredentialStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS tokens (
              token_id TEXT PRIMARY KEY,
              token_type TEXT NOT NULL,
              user_id TEXT NOT NULL,
              organization_id TEXT NOT NULL,
              device_id TEXT NOT NULL,
              issued_at INTEGER NOT NULL,
              expires_at INTEGER NOT NULL,
              last_used INTEGER NOT NULL,
              scopes_json TEXT NOT NULL,
              wedding_context_json TEXT,
              rotation_count INTEGER NOT NULL,
              ciphertext BLOB NOT NULL,
              encrypted INTEGER NOT NULL CHECK (encrypted = 1),
              CHECK (expires_at > issued_at)
            );

            CREATE TABLE IF NOT EXISTS security_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp INTEGER NOT NULL,
              event_type TEXT NOT NULL,
              severity TEXT NOT NULL,
              user_id TEXT,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS encryption_keys (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              salt BLOB NOT NULL,
              kdf_algorithm TEXT NOT NULL,
              aead_algorithm TEXT NOT NULL,
              iterations INTEGER NOT NULL,
              created_at INTEGER NOT NULL,
              key_check BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS policy_violations (
              violation_id TEXT PRIMARY KEY,
              policy_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              resolved INTEGER NOT NULL DEFAULT 0,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);
            CREATE INDEX IF NOT EXISTS idx_tokens_type ON tokens(token_type);
            CREATE INDEX IF NOT EXISTS idx_tokens_expires ON tokens(expires_at);
            CREATE INDEX IF NOT EXISTS idx_tokens_device ON tokens(device_id);
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON security_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_type ON security_events(event_type);
            CREATE INDEX IF NOT EXISTS idx_events_severity ON security_events(severity);
            CREATE INDEX IF NOT EXISTS idx_events_user ON security_events(user_id);
            "#,
        )?;
        Ok(())
    }

}

fn last_event_hash(conn: &Connection) -> Result<[u8; 32]> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT entry_hash FROM security_events ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match bytes {
        Some(bytes) => blob32(bytes, "security_events.entry_hash"),
        None => Ok([0u8; 32]),
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn put_token(&mut self, record: &TokenRecord) -> Result<()> {
        if !record.encrypted {
            return Err(anyhow!("refusing to persist unencrypted token record"));
        }
        let scopes_json = serde_json::to_string(&record.scopes)?;
        let wedding_json = record
            .wedding_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO tokens(
                token_id, token_type, user_id, organization_id, device_id,
                issued_at, expires_at, last_used, scopes_json, wedding_context_json,
                rotation_count, ciphertext, encrypted
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1)
            "#,
            params![
                record.token_id.as_str(),
                record.token_type.as_str(),
                record.user_id,
                record.organization_id,
                record.device_id,
                to_i64(record.issued_at_ms)?,
                to_i64(record.expires_at_ms)?,
                to_i64(record.last_used_ms)?,
                scopes_json,
                wedding_json,
                record.rotation_count,
                record.ciphertext,
            ],
        )?;
        Ok(())
    }

    fn delete_token(&mut self, token_id: &TokenId) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM tokens WHERE token_id = ?1",
            params![token_id.as_str()],
        )?;
        Ok(removed > 0)
    }

    fn load_tokens(&mut self) -> Result<Vec<TokenRecord>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT token_id, token_type, user_id, organization_id, device_id,
                       issued_at, expires_at, last_used, scopes_json, wedding_context_json,
                       rotation_count, ciphertext
                FROM tokens ORDER BY issued_at ASC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let token_id: String = row.get(0)?;
                let token_type: String = row.get(1)?;
                let scopes_json: String = row.get(8)?;
                let wedding_json: Option<String> = row.get(9)?;
                out.push((
                    token_id,
                    token_type,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    [row.get::<_, i64>(5)?, row.get::<_, i64>(6)?, row.get::<_, i64>(7)?],
                    scopes_json,
                    wedding_json,
                    row.get::<_, u32>(10)?,
                    row.get::<_, Vec<u8>>(11)?,
                ));
            }
            out
        };

        let mut records = Vec::with_capacity(rows.len());
        for (
            token_id,
            token_type,
            user_id,
            organization_id,
            device_id,
            [issued_at, expires_at, last_used],
            scopes_json,
            wedding_json,
            rotation_count,
            ciphertext,
        ) in rows
        {
            records.push(TokenRecord {
                token_id: TokenId::parse(&token_id)?,
                token_type: token_type.parse::<TokenType>()?,
                user_id,
                organization_id,
                device_id,
                issued_at_ms: to_u64(issued_at, "tokens.issued_at")?,
                expires_at_ms: to_u64(expires_at, "tokens.expires_at")?,
                last_used_ms: to_u64(last_used, "tokens.last_used")?,
                scopes: serde_json::from_str(&scopes_json)?,
                wedding_context: wedding_json
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
                rotation_count,
                ciphertext,
                encrypted: true,
            });
        }
        Ok(records)
    }

    fn load_key_metadata(&mut self) -> Result<Option<KeyMetadata>> {
        let row = self
            .conn
            .query_row(
                "SELECT salt, kdf_algorithm, aead_algorithm, iterations, created_at, key_check FROM encryption_keys WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((salt, kdf_algorithm, aead_algorithm, iterations, created_at, key_check)) = row else {
            return Ok(None);
        };
        Ok(Some(KeyMetadata {
            salt: blob32(salt, "encryption_keys.salt")?,
            kdf_algorithm,
            aead_algorithm,
            iterations,
            created_at_ms: to_u64(created_at, "encryption_keys.created_at")?,
            key_check: blob32(key_check, "encryption_keys.key_check")?,
        }))
    }

    fn save_key_metadata(&mut self, metadata: &KeyMetadata) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO encryption_keys(id, salt, kdf_algorithm, aead_algorithm, iterations, created_at, key_check)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                metadata.salt.to_vec(),
                metadata.kdf_algorithm,
                metadata.aead_algorithm,
                metadata.iterations,
                to_i64(metadata.created_at_ms)?,
                metadata.key_check.to_vec(),
            ],
        )?;
        Ok(())
    }

    fn append_security_event(&mut self, event: &SecurityEvent) -> Result<()> {
        let payload_json = serde_json::to_string(event)?;
        // Other connections append to the same chain; hold the write lock
        // from reading the head until the new entry is committed.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let prev_hash = last_event_hash(&tx)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());
        tx.execute(
            r#"
            INSERT INTO security_events(timestamp, event_type, severity, user_id, payload_json, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                to_i64(event.timestamp_ms)?,
                event.kind.label(),
                event.severity.as_str(),
                event.user_id,
                payload_json,
                prev_hash.to_vec(),
                entry_hash.to_vec(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn security_events(&mut self, query: &EventQuery) -> Result<Vec<SecurityEvent>> {
        let mut out = Vec::new();
        for sealed in self.sealed_security_events()? {
            let ev = sealed.event()?;
            if query.matches(&ev) {
                out.push(ev);
            }
        }
        Ok(apply_limit(out, query.limit))
    }

    fn sealed_security_events(&mut self) -> Result<Vec<SealedSecurityEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload_json, prev_hash, entry_hash FROM security_events ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let prev: Vec<u8> = row.get(2)?;
            let entry: Vec<u8> = row.get(3)?;
            out.push(SealedSecurityEvent {
                id: row.get(0)?,
                payload_json: row.get(1)?,
                prev_hash: blob32(prev, "security_events.prev_hash")?,
                entry_hash: blob32(entry, "security_events.entry_hash")?,
            });
        }
        Ok(out)
    }

    fn put_violation(&mut self, violation: &PolicyViolation) -> Result<()> {
        let payload_json = serde_json::to_string(violation)?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO policy_violations(violation_id, policy_id, created_at, resolved, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                violation.id,
                violation.policy_id,
                to_i64(violation.timestamp_ms)?,
                violation.resolved,
                payload_json,
            ],
        )?;
        Ok(())
    }

    fn load_violations(&mut self) -> Result<Vec<PolicyViolation>> {
        let payloads = {
            let mut stmt = self.conn.prepare(
                "SELECT payload_json FROM policy_violations ORDER BY created_at ASC, violation_id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut payloads = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row.get(0)?;
                payloads.push(payload);
            }
            payloads
        };
        let mut out = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let violation: PolicyViolation = serde_json::from_str(&payload)?;
            out.push(violation);
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryCredentialStore {
    tokens: Vec<TokenRecord>,
    key_metadata: Option<KeyMetadata>,
    events: Vec<SealedSecurityEvent>,
    violations: Vec<PolicyViolation>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn put_token(&mut self, record: &TokenRecord) -> Result<()> {
        if !record.encrypted {
            return Err(anyhow!("refusing to persist unencrypted token record"));
        }
        if record.expires_at_ms <= record.issued_at_ms {
            return Err(anyhow!("token record expires before it is issued"));
        }
        match self
            .tokens
            .iter_mut()
            .find(|existing| existing.token_id == record.token_id)
        {
            Some(existing) => *existing = record.clone(),
            None => self.tokens.push(record.clone()),
        }
        Ok(())
    }

    fn delete_token(&mut self, token_id: &TokenId) -> Result<bool> {
        let before = self.tokens.len();
        self.tokens.retain(|record| &record.token_id != token_id);
        Ok(self.tokens.len() != before)
    }

    fn load_tokens(&mut self) -> Result<Vec<TokenRecord>> {
        let mut tokens = self.tokens.clone();
        tokens.sort_by_key(|record| record.issued_at_ms);
        Ok(tokens)
    }

    fn load_key_metadata(&mut self) -> Result<Option<KeyMetadata>> {
        Ok(self.key_metadata.clone())
    }

    fn save_key_metadata(&mut self, metadata: &KeyMetadata) -> Result<()> {
        self.key_metadata = Some(metadata.clone());
        Ok(())
    }

    fn append_security_event(&mut self, event: &SecurityEvent) -> Result<()> {
        let prev_hash = self
            .events
            .last()
            .map(|entry| entry.entry_hash)
            .unwrap_or([0u8; 32]);
        let payload_json = serde_json::to_string(event)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());
        self.events.push(SealedSecurityEvent {
            id: self.events.len() as i64 + 1,
            payload_json,
            prev_hash,
            entry_hash,
        });
        Ok(())
    }

    fn security_events(&mut self, query: &EventQuery) -> Result<Vec<SecurityEvent>> {
        let mut out = Vec::new();
        for sealed in &self.events {
            let ev = sealed.event()?;
            if query.matches(&ev) {
                out.push(ev);
            }
        }
        Ok(apply_limit(out, query.limit))
    }

    fn sealed_security_events(&mut self) -> Result<Vec<SealedSecurityEvent>> {
        Ok(self.events.clone())
    }

    fn put_violation(&mut self, violation: &PolicyViolation) -> Result<()> {
        match self
            .violations
            .iter_mut()
            .find(|existing| existing.id == violation.id)
        {
            Some(existing) => *existing = violation.clone(),
            None => self.violations.push(violation.clone()),
        }
        Ok(())
    }

    fn load_violations(&mut self) -> Result<Vec<PolicyViolation>> {
        Ok(self.violations.clone())
    }
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

fn apply_limit(mut events: Vec<SecurityEvent>, limit: Option<usize>) -> Vec<SecurityEvent> {
    if let Some(limit) = limit {
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
    }
    events
}

fn blob32(bytes: Vec<u8>, context: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!(
            "corrupt {}: expected 32 bytes, got {}",
            context,
            bytes.len()
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("timestamp {} exceeds i64 range", value))
}

fn to_u64(value: i64, context: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("corrupt {}: negative timestamp", context))
}
