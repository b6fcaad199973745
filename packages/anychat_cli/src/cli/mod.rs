pub mod auth;
pub mod chat;
pub mod settings;

use anyhow::{Context, Result};

use anychat_relay::{ApiClient, SessionHandle, SessionStore};

use crate::config::{AppDirs, FileConfig};

/// Open the persisted session for this data directory.
pub fn open_session(dirs: &AppDirs) -> Result<SessionHandle> {
    let path = dirs.session_path();
    SessionHandle::open(SessionStore::new(&path))
        .with_context(|| format!("Failed to load session from {}", path.display()))
}

pub fn api_client(config: &FileConfig) -> ApiClient {
    ApiClient::new(config.api.to_runtime())
}

/// Read one line from stdin, returning `default` when the line is blank.
async fn prompt_line(label: &str, default: Option<String>) -> Result<String> {
    let label = label.to_string();
    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::io::{self, BufRead, Write};

        match &default {
            Some(d) => eprint!("  {label} [{d}]: "),
            None => eprint!("  {label}: "),
        }
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let trimmed = line.trim().to_string();
        Ok(if trimmed.is_empty() {
            default.unwrap_or_default()
        } else {
            trimmed
        })
    })
    .await?
}

async fn prompt_password(label: &'static str) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        rpassword::prompt_password(label)
            .map_err(|e| anyhow::anyhow!("Failed to read password: {}", e))
    })
    .await?
}
