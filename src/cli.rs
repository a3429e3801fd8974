//! tokenctl - operator CLI for the local token store and policy engine

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audit::{EventQuery, Severity};
use crate::policy::EvaluationContext;
use crate::token::{StoreTokenRequest, TokenId, TokenType, WeddingContext};
use crate::{GuardConfig, SystemClock, TokenGuard};

#[derive(Parser, Debug)]
#[command(name = "tokenctl", about = "Encrypted token store and access policy tooling")]
struct Args {
    /// JSON or TOML config file
    #[arg(long, env = "TOKEN_GUARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt and store a new token (prints the token id)
    Store {
        #[arg(long)]
        user: String,
        #[arg(long)]
        org: String,
        /// Defaults to the configured device id
        #[arg(long)]
        device: Option<String>,
        #[arg(long = "type", default_value = "access")]
        token_type: TokenType,
        #[arg(long, env = "TOKEN_GUARD_TOKEN_VALUE", hide_env_values = true)]
        value: String,
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Attach an event context with this event id
        #[arg(long)]
        event_id: Option<String>,
        /// Event date (YYYY-MM-DD); defaults to today
        #[arg(long, requires = "event_id")]
        event_date: Option<String>,
        #[arg(long, requires = "event_id")]
        event_day: bool,
        #[arg(long, requires = "event_id")]
        emergency_access: bool,
        #[arg(long, default_value = "coordinator")]
        team_role: String,
    },

    /// Validate a token and print its metadata
    Get {
        token_id: String,
        /// Also print the decrypted value
        #[arg(long)]
        show_value: bool,
    },

    /// Replace a token value
    Rotate {
        token_id: String,
        #[arg(long, env = "TOKEN_GUARD_TOKEN_VALUE", hide_env_values = true)]
        value: String,
    },

    /// Revoke a single token
    Revoke {
        token_id: String,
        #[arg(long, default_value = "operator revocation")]
        reason: String,
    },

    /// Revoke every token held for a user
    RevokeUser {
        user: String,
        #[arg(long, default_value = "operator revocation")]
        reason: String,
    },

    /// Run one maintenance pass (expiry sweep + rotation flags)
    Maintain,

    /// Run maintenance on the configured interval until Ctrl-C
    Daemon,

    /// Evaluate policies against a context JSON file ("-" for stdin)
    Evaluate {
        #[arg(long)]
        context: String,
    },

    /// Request a critical-day override
    Override {
        #[arg(long)]
        user: String,
        #[arg(long)]
        context_id: String,
        #[arg(long)]
        reason: String,
    },

    /// List registered policies
    Policies,

    /// List security events
    Events {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        min_severity: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Verify the security event hash chain
    VerifyEvents,
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = GuardConfig::load_from(args.config.as_deref())?;
    let mut guard = TokenGuard::open(&cfg, Arc::new(SystemClock))?;

    match args.command {
        Command::Store {
            user,
            org,
            device,
            token_type,
            value,
            scopes,
            event_id,
            event_date,
            event_day,
            emergency_access,
            team_role,
        } => {
            let device = device.unwrap_or_else(|| cfg.device_id.clone());
            let mut request = StoreTokenRequest::new(value, token_type, &user, &org, &device)
                .with_scopes(scopes);
            if let Some(event_id) = event_id {
                request = request.with_wedding_context(WeddingContext {
                    event_id,
                    event_date: parse_event_date(event_date.as_deref())?,
                    is_event_day: event_day,
                    emergency_access,
                    team_role,
                });
            }
            cmd_store(&guard, request)
        }
        Command::Get {
            token_id,
            show_value,
        } => cmd_get(&guard, &token_id, show_value),
        Command::Rotate { token_id, value } => cmd_rotate(&guard, &token_id, value),
        Command::Revoke { token_id, reason } => {
            let removed = guard.tokens()?.revoke_token(&TokenId::parse(&token_id)?, &reason)?;
            if removed {
                println!("revoked {}", token_id);
            } else {
                println!("{} was not held", token_id);
            }
            Ok(())
        }
        Command::RevokeUser { user, reason } => {
            let count = guard.tokens()?.revoke_user_tokens(&user, &reason)?;
            println!("revoked {} tokens for {}", count, user);
            Ok(())
        }
        Command::Maintain => cmd_maintain(&guard),
        Command::Daemon => cmd_daemon(&guard),
        Command::Evaluate { context } => cmd_evaluate(&mut guard, &context),
        Command::Override {
            user,
            context_id,
            reason,
        } => {
            let decision = guard
                .policies_mut()
                .request_override(&user, &context_id, &reason)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        Command::Policies => cmd_policies(&guard),
        Command::Events {
            user,
            min_severity,
            limit,
        } => {
            let query = EventQuery {
                user_id: user,
                min_severity: min_severity.as_deref().map(Severity::parse).transpose()?,
                limit: Some(limit),
            };
            cmd_events(&guard, &query)
        }
        Command::VerifyEvents => {
            let count = guard.tokens()?.verify_event_chain()?;
            println!("security event chain OK ({} entries)", count);
            Ok(())
        }
    }
}

fn cmd_store(guard: &TokenGuard, request: StoreTokenRequest) -> Result<()> {
    let token = guard.tokens()?.store_token(request)?;
    println!("=== Token Stored ===");
    println!("Token id:  {}", token.token_id);
    println!("Type:      {}", token.token_type);
    println!("User:      {}", token.user_id);
    println!("Expires:   {}", format_ms(token.expires_at_ms));
    Ok(())
}

fn cmd_get(guard: &TokenGuard, token_id: &str, show_value: bool) -> Result<()> {
    let result = guard.tokens()?.get_token(&TokenId::parse(token_id)?)?;
    let Some(token) = result.token.as_ref().filter(|_| result.valid) else {
        let reason = result
            .reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "invalid".to_string());
        return Err(anyhow!("{}: {}", token_id, reason));
    };
    println!("Token id:       {}", token.token_id);
    println!("Type:           {}", token.token_type);
    println!("User / org:     {} / {}", token.user_id, token.organization_id);
    println!("Device:         {}", token.device_id);
    println!("Issued:         {}", format_ms(token.issued_at_ms));
    println!("Expires:        {}", format_ms(token.expires_at_ms));
    println!("Rotations:      {}", token.rotation_count);
    println!("Scopes:         {}", token.scopes.join(", "));
    println!("Needs rotation: {}", result.needs_rotation);
    if show_value {
        println!("Value:          {}", token.value.expose());
    }
    Ok(())
}

fn cmd_rotate(guard: &TokenGuard, token_id: &str, value: String) -> Result<()> {
    match guard.tokens()?.rotate_token(&TokenId::parse(token_id)?, value)? {
        Some(token) => {
            println!(
                "rotated {} (rotation {}, expires {})",
                token.token_id,
                token.rotation_count,
                format_ms(token.expires_at_ms)
            );
            Ok(())
        }
        None => Err(anyhow!(
            "rotation refused for {}: token missing, expired, or at its rotation cap",
            token_id
        )),
    }
}

fn cmd_maintain(guard: &TokenGuard) -> Result<()> {
    let mut tokens = guard.tokens()?;
    let report = tokens.run_maintenance()?;
    for id in &report.expired_removed {
        println!("expired  {}", id);
    }
    for id in &report.flagged_for_rotation {
        println!("rotate   {}", id);
    }
    let stats = tokens.stats();
    println!(
        "{} tokens held, {} need rotation, {} pending",
        stats.total,
        stats.needing_rotation,
        tokens.pending_rotations().len()
    );
    Ok(())
}

fn cmd_daemon(guard: &TokenGuard) -> Result<()> {
    let handle = guard.spawn_maintenance()?;
    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("tokenctl daemon waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping maintenance...");
    handle.stop()
}

fn cmd_evaluate(guard: &mut TokenGuard, source: &str) -> Result<()> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(Path::new(source))
            .map_err(|e| anyhow!("failed to read context {}: {}", source, e))?
    };
    let ctx: EvaluationContext =
        serde_json::from_str(&raw).map_err(|e| anyhow!("invalid context json: {}", e))?;
    let (decision, result) = guard.policies_mut().decide(&ctx)?;
    println!("decision: {:?}", decision);
    println!("context:  {}", ctx.fingerprint()?);
    println!("{}", serde_json::to_string_pretty(&*result)?);
    Ok(())
}

fn cmd_policies(guard: &TokenGuard) -> Result<()> {
    for policy in guard.policies().policies() {
        println!(
            "{:<24} v{:<3} {:<9} {:<8} roles={} conditions={}",
            policy.id,
            policy.version,
            policy.enforcement_level,
            if policy.active { "active" } else { "inactive" },
            policy.applicable_roles.join(","),
            policy.conditions.len()
        );
    }
    Ok(())
}

fn cmd_events(guard: &TokenGuard, query: &EventQuery) -> Result<()> {
    let events = guard.tokens()?.security_events(query)?;
    if events.is_empty() {
        println!("No security events.");
        return Ok(());
    }
    for ev in events {
        println!(
            "{}  {:<8} {:<18} user={} token={}",
            format_ms(ev.timestamp_ms),
            ev.severity,
            ev.kind.label(),
            ev.user_id.as_deref().unwrap_or("-"),
            ev.token_id.as_ref().map(|t| t.as_str()).unwrap_or("-"),
        );
    }
    Ok(())
}

fn parse_event_date(raw: Option<&str>) -> Result<chrono::NaiveDate> {
    match raw {
        Some(value) => chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map_err(|_| anyhow!("invalid event date '{}': expected YYYY-MM-DD", value)),
        None => Ok(chrono::Utc::now().date_naive()),
    }
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}
