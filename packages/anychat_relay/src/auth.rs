//! Login, registration and logout.
//!
//! Login is two calls in a row with no atomicity: the platform login through
//! the backend proxy, then the local backend login. Losing the second one
//! leaves a degraded but usable session.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::api::{ApiClient, LocalUser};
use crate::error::{RelayError, Result};
use crate::session::{SessionHandle, redact};

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.as_ref().is_some_and(|re| re.is_match(email))
}

/// What a successful login produced.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: Option<LocalUser>,
    /// The local backend login failed or returned no token; local features
    /// are unavailable but the chat relay still works.
    pub degraded: bool,
}

/// Form input for [`register`].
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub agree_to_terms: bool,
}

impl Registration {
    pub fn validate(&self) -> Result<()> {
        let fields = [
            &self.first_name,
            &self.last_name,
            &self.email,
            &self.password,
            &self.confirm_password,
        ];
        if fields.iter().any(|f| f.trim().is_empty()) {
            return Err(RelayError::Validation("Please fill in all fields".into()));
        }
        if self.password != self.confirm_password {
            return Err(RelayError::Validation("Passwords do not match".into()));
        }
        if self.password.chars().count() < 6 {
            return Err(RelayError::Validation(
                "Password must be at least 6 characters long".into(),
            ));
        }
        if !is_valid_email(&self.email) {
            return Err(RelayError::Validation(
                "Please enter a valid email address".into(),
            ));
        }
        if !self.agree_to_terms {
            return Err(RelayError::Validation(
                "Please agree to the Terms & Conditions".into(),
            ));
        }
        Ok(())
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
    }
}

fn validate_login(email: &str, password: &str) -> Result<()> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(RelayError::Validation("Please fill in all fields".into()));
    }
    if !is_valid_email(email) {
        return Err(RelayError::Validation(
            "Please enter a valid email address".into(),
        ));
    }
    Ok(())
}

/// Run both logins and store the resulting tokens in `session`.
pub async fn login(
    api: &ApiClient,
    session: &SessionHandle,
    email: &str,
    password: &str,
    remember_me: bool,
) -> Result<LoginOutcome> {
    validate_login(email, password)?;

    info!("logging into the chat platform");
    let external = match api.login_external(email, password).await {
        Ok(external) => external,
        Err(e) => {
            warn!("platform login failed: {}", e);
            session.update(|s| s.clear_tokens()).await?;
            return Err(e);
        }
    };

    let access_token = external.access_token.clone().unwrap_or_default();
    info!(token = %redact(&access_token), "platform login succeeded");

    session
        .update(|s| {
            s.external_access_token = Some(access_token.clone());
            s.external_login_token = external.login_token.clone();
            s.external_session_id = external.session_id.clone();
            s.user_guid = external.guid.clone().or(s.user_guid.take());
            s.widget_id = external.widget_id.clone().or(s.widget_id.take());
            s.workspace_id = external.workspace_id.clone().or(s.workspace_id.take());
            s.user_email = Some(email.to_string());
            s.ensure_device_id();
        })
        .await?;

    info!("logging into the local backend");
    let (local_token, user) = match api.login_local(email, password, &external).await {
        Ok(local) => (local.token, local.user),
        Err(e) => {
            warn!("local login failed, continuing with platform session only: {}", e);
            (None, None)
        }
    };
    if local_token.is_none() {
        warn!("no token from local backend, using platform token");
    }
    let degraded = local_token.is_none();

    session
        .update(|s| {
            s.auth_token = Some(local_token.unwrap_or(access_token));
            s.remember_me = remember_me;
            s.saved_email = remember_me.then(|| email.to_string());
        })
        .await?;

    Ok(LoginOutcome { user, degraded })
}

/// Create a local account and store its token.
pub async fn register(
    api: &ApiClient,
    session: &SessionHandle,
    form: &Registration,
) -> Result<Option<LocalUser>> {
    form.validate()?;
    let local = api
        .register(&form.full_name(), &form.email, &form.password)
        .await?;
    let token = local
        .token
        .ok_or_else(|| RelayError::Other(anyhow::anyhow!("Registration returned no token")))?;
    session
        .update(|s| {
            s.auth_token = Some(token);
            s.user_email = Some(form.email.clone());
            s.ensure_device_id();
        })
        .await?;
    info!(email = %form.email, "registered");
    Ok(local.user)
}

pub async fn logout(session: &SessionHandle) -> Result<()> {
    session.logout().await?;
    info!("logged out");
    Ok(())
}
