use anyhow::Result;
use tracing::debug;

use anychat_relay::RelayError;
use anychat_relay::auth::{self, Registration};

use super::{api_client, open_session, prompt_line, prompt_password};
use crate::config::{AppDirs, FileConfig};

/// `anychat login`: platform login, then local login.
pub async fn login_command(
    dirs: &AppDirs,
    config: &FileConfig,
    email: Option<String>,
    remember: bool,
) -> Result<()> {
    let session = open_session(dirs)?;
    let api = api_client(config);

    let email = match email {
        Some(e) => e,
        None => {
            let saved = session.snapshot().await.saved_email;
            prompt_line("Email", saved).await?
        }
    };
    let password = prompt_password("  Password: ").await?;

    match auth::login(&api, &session, &email, &password, remember).await {
        Ok(outcome) => {
            eprintln!("Logged in as {email}");
            if outcome.degraded {
                eprintln!("  (local backend unavailable: chat works, account features do not)");
            }
            if let Some(name) = outcome.user.and_then(|u| u.name) {
                debug!(name = %name, "local user");
            }
            Ok(())
        }
        Err(RelayError::Validation(msg)) => anyhow::bail!(msg),
        Err(e) => anyhow::bail!(e.login_message()),
    }
}

/// Name and email for `anychat register`; passwords are prompted for.
pub struct RegisterNames {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub agree: bool,
}

/// `anychat register`: create a local account.
pub async fn register_command(
    dirs: &AppDirs,
    config: &FileConfig,
    names: RegisterNames,
) -> Result<()> {
    let session = open_session(dirs)?;
    let api = api_client(config);

    let password = prompt_password("  Password (min 6 chars): ").await?;
    let confirm_password = prompt_password("  Confirm password: ").await?;
    let form = Registration {
        first_name: names.first_name,
        last_name: names.last_name,
        email: names.email,
        password,
        confirm_password,
        agree_to_terms: names.agree,
    };

    auth::register(&api, &session, &form).await?;
    eprintln!("Account created for {}", form.email);
    eprintln!("Run `anychat login` to connect to the chat platform.");
    Ok(())
}

/// `anychat logout`: drop tokens, keep the device id.
pub async fn logout_command(dirs: &AppDirs) -> Result<()> {
    let session = open_session(dirs)?;
    auth::logout(&session).await?;
    eprintln!("Logged out.");
    Ok(())
}

/// `anychat status`: what the session holds and whether the platform still
/// accepts it.
pub async fn status_command(dirs: &AppDirs, config: &FileConfig) -> Result<()> {
    let session = open_session(dirs)?;
    let s = session.snapshot().await;

    if !s.is_authenticated() {
        eprintln!("Not logged in.");
        if let Some(email) = s.saved_email.as_deref() {
            eprintln!("  remembered email: {email}");
        }
        return Ok(());
    }

    eprintln!(
        "Logged in as {}",
        s.user_email.as_deref().unwrap_or("(unknown)")
    );
    if s.is_degraded() {
        eprintln!("  local backend: unavailable at login (platform token only)");
    }
    if let Some(device) = s.device_id.as_deref() {
        eprintln!("  device: {device}");
    }
    if let Some(thread) = s.current_thread_id.as_deref() {
        eprintln!("  open thread: {thread}");
    }

    match s.external_session_id.as_deref() {
        Some(sid) => {
            let alive = api_client(config).check_external_session(sid).await;
            eprintln!(
                "  platform session: {}",
                if alive { "active" } else { "expired" }
            );
        }
        None => eprintln!("  platform session: none"),
    }
    eprintln!("  session file: {}", dirs.session_path().display());
    Ok(())
}
