//! Subcommands. Each one plays the part of a dashboard page: it owns the
//! session guard for the lifetime of the process and treats a failed gate
//! as "redirect to login" (exit code 1).

use std::process::ExitCode;
use std::sync::Arc;

use admin_session_core::{
    expiry_instant, ApiClient, ApiError, Session, SessionGuard, SessionState, UserProfile,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::Config;

const LOGIN_AGAIN: &str = "Please log in again.";

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store the token and user profile returned by the login endpoint
    Login {
        /// Bearer token
        #[arg(long)]
        token: String,
        /// User profile as a JSON object
        #[arg(long, default_value = "{}")]
        user: String,
    },
    /// Clear the stored session
    Logout,
    /// Show the stored session and when it expires
    Status,
    /// Wait until the session expires, then log out
    Watch,
    /// Authenticated GET against the admin API, printing the JSON response
    Get {
        /// Request path, e.g. /orders
        path: String,
        /// Require the admin role before sending the request
        #[arg(long)]
        admin: bool,
    },
}

impl Commands {
    pub async fn execute(self, guard: Arc<SessionGuard>, config: &Config) -> Result<ExitCode> {
        match self {
            Commands::Login { token, user } => login(&guard, &token, &user),
            Commands::Logout => {
                guard.logout();
                println!("Logged out.");
                Ok(ExitCode::SUCCESS)
            }
            Commands::Status => Ok(status(&guard)),
            Commands::Watch => watch(&guard).await,
            Commands::Get { path, admin } => get(guard, config, &path, admin).await,
        }
    }
}

fn login(guard: &SessionGuard, token: &str, user: &str) -> Result<ExitCode> {
    let profile = UserProfile::from_json(user)
        .ok_or_else(|| anyhow::anyhow!("--user must be a JSON object"))?;

    match expiry_instant(token) {
        None => warn!("Token has no usable expiry claim and will be rejected"),
        Some(expiry) if expiry <= guard.now_millis() => {
            warn!("Token is already expired and will be rejected")
        }
        Some(_) => {}
    }

    guard
        .store_credentials(token, &profile)
        .context("Failed to store credentials")?;
    info!(role = ?profile.role(), "Credentials stored");
    println!("Logged in as {}.", display_name(&profile));
    Ok(ExitCode::SUCCESS)
}

fn status(guard: &SessionGuard) -> ExitCode {
    match guard.state() {
        SessionState::Absent => {
            println!("No session. Please log in.");
            ExitCode::FAILURE
        }
        SessionState::Expired => {
            println!("Session expired. {}", LOGIN_AGAIN);
            ExitCode::FAILURE
        }
        SessionState::ProfileMissing { .. } => {
            println!("Session token is valid but the user profile is missing. {}", LOGIN_AGAIN);
            ExitCode::FAILURE
        }
        SessionState::Valid(session) => {
            print_session(&session);
            ExitCode::SUCCESS
        }
    }
}

async fn watch(guard: &SessionGuard) -> Result<ExitCode> {
    let Some(session) = guard.session() else {
        println!("No valid session. {}", LOGIN_AGAIN);
        return Ok(ExitCode::FAILURE);
    };

    let (expired_tx, expired_rx) = oneshot::channel();
    guard.start_watcher(move || {
        let _ = expired_tx.send(());
    });
    println!(
        "Watching session for {} (expires {}, in {}m). Press Ctrl-C to stop.",
        display_name(&session.profile),
        format_instant(session.expires_at),
        session.minutes_until_expiry()
    );

    tokio::select! {
        _ = expired_rx => {
            println!("Session expired. {}", LOGIN_AGAIN);
            Ok(ExitCode::FAILURE)
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            guard.stop_watcher();
            println!("Stopped watching.");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn get(guard: Arc<SessionGuard>, config: &Config, path: &str, admin: bool) -> Result<ExitCode> {
    if admin {
        if let Err(e) = guard.require_admin() {
            println!("{}. {}", e, LOGIN_AGAIN);
            return Ok(ExitCode::FAILURE);
        }
    }

    let client = ApiClient::new(config.api_base_url.clone(), guard)?;
    match client.get_json::<serde_json::Value>(path).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(ApiError::Unauthorized) => {
            println!("Session expired. {}", LOGIN_AGAIN);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).with_context(|| format!("GET {} failed", path)),
    }
}

fn print_session(session: &Session) {
    let profile = &session.profile;
    println!("Logged in as {}", display_name(profile));
    if let Some(email) = profile.email() {
        println!("  Email:   {}", email);
    }
    println!("  Role:    {}", profile.role().unwrap_or("unknown"));
    println!(
        "  Expires: {} ({}m remaining)",
        format_instant(session.expires_at),
        session.minutes_until_expiry()
    );
}

fn display_name(profile: &UserProfile) -> &str {
    profile.name().or(profile.email()).unwrap_or("unknown user")
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
