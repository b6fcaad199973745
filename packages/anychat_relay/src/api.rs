//! REST client for the chat platform and the local proxy backend.

use std::future::Future;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::now_ms;
use crate::protocol::{IncomingMessage, Message, Thread};
use crate::session::Session;

/// Base URLs for the two backends.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Chat platform API, e.g. `https://api.chatbot24.ai/v1`.
    pub external_base: String,
    /// Local backend that also proxies the platform login.
    pub backend_base: String,
}

impl ApiConfig {
    fn external(&self, path: &str) -> String {
        format!("{}{}", self.external_base.trim_end_matches('/'), path)
    }

    fn backend(&self, path: &str) -> String {
        format!("{}{}", self.backend_base.trim_end_matches('/'), path)
    }

    /// `{external}/threads/{thread_id}/messages` with the id percent-encoded
    /// as one path segment.
    fn messages_url(&self, thread_id: &str) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.external_base)
            .map_err(|e| RelayError::Other(anyhow::anyhow!("invalid api url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| RelayError::Other(anyhow::anyhow!("api url cannot have a path")))?
            .pop_if_empty()
            .extend(["threads", thread_id, "messages"]);
        Ok(url.to_string())
    }
}

/// Thread and history fetchers consumed by the relay.
pub trait ChatApi: Clone + Send + Sync + 'static {
    fn fetch_threads(&self, session: &Session) -> impl Future<Output = Result<Vec<Thread>>> + Send;

    fn fetch_messages(
        &self,
        session: &Session,
        thread_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;
}

// =============================================================================
// Request / response bodies
// =============================================================================

#[derive(Debug, Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

/// Result of the platform login performed through the backend proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLogin {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub login_token: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub widget_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalLoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    chatbot_data: &'a ExternalLogin,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalUser {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Result of the local backend login or registration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalLogin {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<LocalUser>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionCheck {
    #[serde(default)]
    authenticated: bool,
}

// =============================================================================
// Client
// =============================================================================

#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Platform login through the backend proxy.
    pub async fn login_external(&self, email: &str, password: &str) -> Result<ExternalLogin> {
        let url = self.config.backend("/api/proxy/chatbot/login-full");
        let resp = self
            .http
            .post(&url)
            .json(&Credentials { email, password })
            .send()
            .await
            .map_err(RelayError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let status = resp.status().as_u16();
        let login: ExternalLogin = resp.json().await.map_err(RelayError::from_reqwest)?;
        if !login.success || login.access_token.is_none() {
            return Err(RelayError::Http {
                status,
                message: login
                    .error
                    .unwrap_or_else(|| "Chatbot login failed".to_string()),
            });
        }
        Ok(login)
    }

    /// Local backend login, carrying the platform login result along.
    pub async fn login_local(
        &self,
        email: &str,
        password: &str,
        external: &ExternalLogin,
    ) -> Result<LocalLogin> {
        let url = self.config.backend("/api/auth/login");
        let resp = self
            .http
            .post(&url)
            .json(&LocalLoginRequest {
                email,
                password,
                chatbot_data: external,
            })
            .send()
            .await
            .map_err(RelayError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let body = resp.text().await.map_err(RelayError::from_reqwest)?;
        serde_json::from_str(&body).map_err(|e| {
            warn!("failed to parse local login response: {}", e);
            RelayError::Other(anyhow::anyhow!("Invalid response from local server"))
        })
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<LocalLogin> {
        let url = self.config.backend("/api/auth/register");
        let resp = self
            .http
            .post(&url)
            .json(&RegisterRequest {
                name,
                email,
                password,
            })
            .send()
            .await
            .map_err(RelayError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        resp.json().await.map_err(RelayError::from_reqwest)
    }

    /// Ask the proxy whether the platform session is still alive. Any failure
    /// counts as "no".
    pub async fn check_external_session(&self, session_id: &str) -> bool {
        let url = self.config.backend("/api/proxy/chatbot/session");
        let result = async {
            let resp = self
                .http
                .get(&url)
                .header("X-Chatbot-Session-Id", session_id)
                .send()
                .await?;
            resp.json::<SessionCheck>().await
        }
        .await;
        match result {
            Ok(check) => check.authenticated,
            Err(e) => {
                warn!("session check failed: {}", e);
                false
            }
        }
    }

    /// GET with bearer auth. A 401 is retried once; the second one means the
    /// user has to log in again.
    async fn get_authorized(&self, url: &str, query: &[(&str, &str)], token: &str) -> Result<Value> {
        let mut retried = false;
        loop {
            let resp = self
                .http
                .get(url)
                .query(query)
                .bearer_auth(token)
                .send()
                .await
                .map_err(RelayError::from_reqwest)?;
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED {
                if retried {
                    return Err(RelayError::Unauthorized);
                }
                warn!(url, "unauthorized, retrying once");
                retried = true;
                continue;
            }
            if !status.is_success() {
                return Err(error_from_response(resp).await);
            }
            return resp.json().await.map_err(RelayError::from_reqwest);
        }
    }
}

impl ChatApi for ApiClient {
    async fn fetch_threads(&self, session: &Session) -> Result<Vec<Thread>> {
        let token = session.external_token().ok_or(RelayError::MissingToken)?;
        let mut query = Vec::new();
        if let Some(widget) = session.widget_id.as_deref() {
            query.push(("widget", widget));
        }
        if let Some(workspace) = session.workspace_id.as_deref() {
            query.push(("workspace", workspace));
        }
        let body = self
            .get_authorized(&self.config.external("/threads"), &query, token)
            .await?;
        let threads: Vec<Thread> = serde_json::from_value(unwrap_list(body, "threads"))?;
        debug!("fetched {} threads", threads.len());
        Ok(threads)
    }

    async fn fetch_messages(&self, session: &Session, thread_id: &str) -> Result<Vec<Message>> {
        let token = session.external_token().ok_or(RelayError::MissingToken)?;
        let url = self.config.messages_url(thread_id)?;
        let body = self.get_authorized(&url, &[], token).await?;
        let incoming: Vec<IncomingMessage> = serde_json::from_value(unwrap_list(body, "messages"))?;
        let now = now_ms();
        let messages = incoming
            .into_iter()
            .map(|m| {
                let mut msg = m.into_message(now);
                msg.thread_id.get_or_insert_with(|| thread_id.to_string());
                msg
            })
            .collect::<Vec<_>>();
        debug!(thread_id, "fetched {} messages", messages.len());
        Ok(messages)
    }
}

/// Lists arrive either bare or wrapped in `{ <key>: [...] }` / `{ data: [...] }`.
fn unwrap_list(body: Value, key: &str) -> Value {
    match body {
        Value::Array(_) => body,
        Value::Object(mut map) => map
            .remove(key)
            .or_else(|| map.remove("data"))
            .unwrap_or(Value::Array(Vec::new())),
        _ => Value::Array(Vec::new()),
    }
}

/// Turn a non-2xx response into an error carrying the best message we can
/// find: the body's `error` or `message` field, the raw body, or the status.
async fn error_from_response(resp: reqwest::Response) -> RelayError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| (!body.trim().is_empty()).then(|| body.clone()))
        .unwrap_or_else(|| format!("Request failed with status {status}"));
    RelayError::Http { status, message }
}
