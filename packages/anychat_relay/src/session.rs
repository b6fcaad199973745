//! Persisted login state.
//!
//! A [`Session`] holds every token and id the rest of the crate needs. It is
//! stored as one JSON object under named keys in `<data_dir>/session.json` and
//! passed around as a [`SessionHandle`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Local backend token (falls back to the external access token).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_login_token: Option<String>,
    #[serde(
        default,
        rename = "chatbotSessionId",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(
        default,
        rename = "anychat_current_room",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_thread_id: Option<String>,
    #[serde(
        default,
        rename = "externalUserEmail",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_email: Option<String>,
    #[serde(default)]
    pub remember_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_email: Option<String>,
}

impl Session {
    /// Token for the chat server and the platform API. Blank counts as absent.
    pub fn external_token(&self) -> Option<&str> {
        self.external_access_token
            .as_deref()
            .or(self.external_login_token.as_deref())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// True when the external login succeeded but the local one did not hand
    /// back its own token.
    pub fn is_degraded(&self) -> bool {
        self.external_token().is_some() && self.auth_token.as_deref() == self.external_token()
    }

    /// Return the device id, generating one the first time.
    pub fn ensure_device_id(&mut self) -> &str {
        self.device_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .as_str()
    }

    /// Drop every credential. Used when a login attempt fails half-way.
    pub fn clear_tokens(&mut self) {
        self.auth_token = None;
        self.external_access_token = None;
        self.external_login_token = None;
        self.external_session_id = None;
    }

    /// Reset to a logged-out session, keeping the device id and the
    /// remembered email.
    pub fn logged_out(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            remember_me: self.remember_me,
            saved_email: if self.remember_me {
                self.saved_email.clone()
            } else {
                None
            },
            ..Default::default()
        }
    }
}

/// Shortened token for log lines.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}…")
}

/// JSON file backing a [`Session`].
#[derive(Clone, Debug)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored session. A missing file is an empty session.
    pub fn load(&self) -> Result<Session> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Session::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(session)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "session saved");
        Ok(())
    }
}

/// Shared session context handed to the relay and the fetchers.
///
/// Clones share the same session. Mutations through [`SessionHandle::update`]
/// are written back to the store when there is one.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    inner: Arc<RwLock<Session>>,
    store: Option<SessionStore>,
}

impl SessionHandle {
    /// A session that lives only in memory.
    pub fn in_memory(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
            store: None,
        }
    }

    /// Load from `store` and persist every later change there.
    pub fn open(store: SessionStore) -> Result<Self> {
        let session = store.load()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(session)),
            store: Some(store),
        })
    }

    pub async fn snapshot(&self) -> Session {
        self.inner.read().await.clone()
    }

    /// Apply `f` and persist the result.
    pub async fn update<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let mut guard = self.inner.write().await;
        let out = f(&mut guard);
        if let Some(store) = &self.store {
            store.save(&guard)?;
        }
        Ok(out)
    }

    pub async fn set_current_thread(&self, thread_id: Option<String>) -> Result<()> {
        self.update(|s| s.current_thread_id = thread_id).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.update(|s| *s = s.logged_out()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn logged_in() -> Session {
        Session {
            auth_token: Some("local".into()),
            external_access_token: Some("external".into()),
            external_session_id: Some("sid".into()),
            device_id: Some("dev-1".into()),
            current_thread_id: Some("t-1".into()),
            user_email: Some("ada@example.com".into()),
            ..Default::default()
        }
    }

    // ── Session ─────────────────────────────────────────────────────────

    #[test]
    fn external_token_prefers_access_token() {
        let mut s = Session {
            external_login_token: Some("login".into()),
            ..Default::default()
        };
        assert_eq!(s.external_token(), Some("login"));
        s.external_access_token = Some("access".into());
        assert_eq!(s.external_token(), Some("access"));
    }

    #[test]
    fn blank_token_counts_as_missing() {
        let s = Session {
            external_access_token: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(s.external_token(), None);
    }

    #[test]
    fn degraded_when_auth_token_is_the_external_one() {
        let mut s = logged_in();
        assert!(!s.is_degraded());
        s.auth_token = s.external_access_token.clone();
        assert!(s.is_degraded());
    }

    #[test]
    fn device_id_is_generated_once() {
        let mut s = Session::default();
        let first = s.ensure_device_id().to_string();
        assert_eq!(s.ensure_device_id(), first);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn logout_keeps_device_and_remembered_email() {
        let mut s = logged_in();
        s.remember_me = true;
        s.saved_email = Some("ada@example.com".into());
        let out = s.logged_out();
        assert_eq!(out.device_id.as_deref(), Some("dev-1"));
        assert_eq!(out.saved_email.as_deref(), Some("ada@example.com"));
        assert!(out.auth_token.is_none());
        assert!(out.external_token().is_none());
        assert!(out.current_thread_id.is_none());
    }

    #[test]
    fn logout_forgets_email_without_remember_me() {
        let mut s = logged_in();
        s.saved_email = Some("ada@example.com".into());
        assert!(s.logged_out().saved_email.is_none());
    }

    #[test]
    fn stored_under_named_keys() {
        let v = serde_json::to_value(logged_in()).unwrap();
        assert_eq!(v["authToken"], "local");
        assert_eq!(v["externalAccessToken"], "external");
        assert_eq!(v["chatbotSessionId"], "sid");
        assert_eq!(v["deviceId"], "dev-1");
        assert_eq!(v["anychat_current_room"], "t-1");
        assert_eq!(v["externalUserEmail"], "ada@example.com");
        assert!(v.get("widgetId").is_none());
    }

    #[test]
    fn redact_keeps_prefix_only() {
        assert_eq!(redact("abcdefghijklmnop"), "abcdefgh…");
        assert_eq!(redact("abc"), "abc…");
    }

    // ── SessionStore ────────────────────────────────────────────────────

    #[test]
    fn store_missing_file_is_empty_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("session.json"));
        assert_eq!(store.load().unwrap(), Session::default());
    }

    #[test]
    fn store_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("nested/session.json"));
        store.save(&logged_in()).unwrap();
        assert_eq!(store.load().unwrap(), logged_in());
        assert!(!tmp.path().join("nested/session.json.tmp").exists());
    }

    #[test]
    fn store_rejects_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(SessionStore::new(path).load().is_err());
    }

    // ── SessionHandle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn handle_persists_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("session.json"));
        let handle = SessionHandle::open(store.clone()).unwrap();

        handle
            .set_current_thread(Some("t-42".into()))
            .await
            .unwrap();

        assert_eq!(
            store.load().unwrap().current_thread_id.as_deref(),
            Some("t-42")
        );
        assert_eq!(
            handle.snapshot().await.current_thread_id.as_deref(),
            Some("t-42")
        );
    }

    #[tokio::test]
    async fn handle_logout_clears_credentials() {
        let handle = SessionHandle::in_memory(logged_in());
        handle.logout().await.unwrap();
        let s = handle.snapshot().await;
        assert!(!s.is_authenticated());
        assert_eq!(s.device_id.as_deref(), Some("dev-1"));
    }
}
