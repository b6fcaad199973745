//! REST client and login flow against an in-process backend.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use anychat_relay::auth::{self, Registration};
use anychat_relay::{ApiClient, ApiConfig, ChatApi, RelayError, Session, SessionHandle};

// =============================================================================
// Mock backend
// =============================================================================

#[derive(Default)]
struct Backend {
    thread_hits: AtomicUsize,
    unauthorized_remaining: AtomicUsize,
    local_login_fails: AtomicBool,
    last_query: Mutex<HashMap<String, String>>,
    last_chatbot_data: Mutex<Option<Value>>,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn threads(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    backend.thread_hits.fetch_add(1, Ordering::SeqCst);
    *backend.last_query.lock().unwrap() = query;
    let pending = backend.unauthorized_remaining.load(Ordering::SeqCst);
    if pending > 0 {
        backend
            .unauthorized_remaining
            .store(pending - 1, Ordering::SeqCst);
        return (StatusCode::UNAUTHORIZED, "expired").into_response();
    }
    if bearer(&headers) != Some("ext-tok") {
        return StatusCode::FORBIDDEN.into_response();
    }
    Json(json!([
        {"guid": "t-1", "client": {"guid": "c-1", "name": "Ada"}, "unreadCount": 2, "is_archive": 0},
        {"guid": "t-2", "botDriven": true, "status": 2}
    ]))
    .into_response()
}

async fn messages(Path(thread_id): Path<String>) -> Response {
    if thread_id == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Thread not found"})),
        )
            .into_response();
    }
    Json(json!({"messages": [
        {"id": 1, "content": "first", "timestamp": 5, "sender": "agent"},
        {"id": "2", "message": "second", "timestamp": 6}
    ]}))
    .into_response()
}

async fn login_full(Json(body): Json<Value>) -> Response {
    if body["password"] == "locked" {
        return Json(json!({"success": false, "error": "Account locked"})).into_response();
    }
    if body["password"] != "right" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": "Invalid credentials"})),
        )
            .into_response();
    }
    Json(json!({
        "success": true,
        "sessionId": "sid",
        "accessToken": "ext-tok",
        "guid": "u-1",
        "widgetId": "w-1",
        "workspaceId": "ws-1",
        "email": body["email"],
    }))
    .into_response()
}

async fn local_login(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    *backend.last_chatbot_data.lock().unwrap() = Some(body["chatbotData"].clone());
    if backend.local_login_fails.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "db down").into_response();
    }
    Json(json!({
        "token": "local-tok",
        "user": {"id": "1", "email": body["email"], "name": "Ada Lovelace", "role": "agent"}
    }))
    .into_response()
}

async fn register(Json(body): Json<Value>) -> Response {
    if body["email"] == "taken@example.com" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "User already exists"})),
        )
            .into_response();
    }
    Json(json!({
        "token": "reg-tok",
        "user": {"id": "2", "email": body["email"], "name": body["name"]}
    }))
    .into_response()
}

async fn session_check(headers: HeaderMap) -> Json<Value> {
    let alive = headers
        .get("x-chatbot-session-id")
        .and_then(|v| v.to_str().ok())
        == Some("sid");
    Json(json!({"authenticated": alive}))
}

async fn spawn_backend() -> (u16, Arc<Backend>, tokio::sync::oneshot::Sender<()>) {
    let backend = Arc::new(Backend::default());
    let app = Router::new()
        .route("/v1/threads", get(threads))
        .route("/v1/threads/{id}/messages", get(messages))
        .route("/api/proxy/chatbot/login-full", post(login_full))
        .route("/api/proxy/chatbot/session", get(session_check))
        .route("/api/auth/login", post(local_login))
        .route("/api/auth/register", post(register))
        .with_state(Arc::clone(&backend));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (port, backend, tx)
}

fn client(port: u16) -> ApiClient {
    ApiClient::new(ApiConfig {
        external_base: format!("http://127.0.0.1:{port}/v1"),
        backend_base: format!("http://127.0.0.1:{port}"),
    })
}

fn session_with_token() -> Session {
    Session {
        external_access_token: Some("ext-tok".into()),
        widget_id: Some("w-1".into()),
        workspace_id: Some("ws-1".into()),
        ..Default::default()
    }
}

// =============================================================================
// Fetchers
// =============================================================================

#[tokio::test]
async fn fetch_threads_sends_token_and_scope() {
    let (port, backend, _shutdown) = spawn_backend().await;
    let threads = client(port)
        .fetch_threads(&session_with_token())
        .await
        .unwrap();

    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].display_name(), "Ada");
    assert_eq!(threads[0].unread_count, 2);
    assert!(threads[1].bot_driven);

    let query = backend.last_query.lock().unwrap().clone();
    assert_eq!(query.get("widget").map(String::as_str), Some("w-1"));
    assert_eq!(query.get("workspace").map(String::as_str), Some("ws-1"));
}

#[tokio::test]
async fn fetch_threads_retries_one_401() {
    let (port, backend, _shutdown) = spawn_backend().await;
    backend.unauthorized_remaining.store(1, Ordering::SeqCst);

    let threads = client(port)
        .fetch_threads(&session_with_token())
        .await
        .unwrap();
    assert_eq!(threads.len(), 2);
    assert_eq!(backend.thread_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_threads_second_401_requires_login() {
    let (port, backend, _shutdown) = spawn_backend().await;
    backend.unauthorized_remaining.store(5, Ordering::SeqCst);

    let err = client(port)
        .fetch_threads(&session_with_token())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized));
    assert!(err.requires_login());
    assert_eq!(backend.thread_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_messages_unwraps_and_tags_thread() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let messages = client(port)
        .fetch_messages(&session_with_token(), "t-1")
        .await
        .unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "1");
    assert_eq!(messages[1].content, "second");
    assert!(
        messages
            .iter()
            .all(|m| m.thread_id.as_deref() == Some("t-1"))
    );
}

#[tokio::test]
async fn fetch_messages_encodes_thread_id() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let messages = client(port)
        .fetch_messages(&session_with_token(), "room 7/b")
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].thread_id.as_deref(), Some("room 7/b"));
}

#[tokio::test]
async fn fetch_error_carries_server_message() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let err = client(port)
        .fetch_messages(&session_with_token(), "missing")
        .await
        .unwrap_err();
    match err {
        RelayError::Http { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, "Thread not found");
        }
        other => panic!("expected http error, got {other:?}"),
    }
}

// =============================================================================
// Login flow
// =============================================================================

#[tokio::test]
async fn login_stores_both_tokens() {
    let (port, backend, _shutdown) = spawn_backend().await;
    let session = SessionHandle::in_memory(Session::default());

    let outcome = auth::login(&client(port), &session, "ada@example.com", "right", true)
        .await
        .unwrap();
    assert!(!outcome.degraded);
    assert_eq!(
        outcome.user.unwrap().name.as_deref(),
        Some("Ada Lovelace")
    );

    let s = session.snapshot().await;
    assert_eq!(s.auth_token.as_deref(), Some("local-tok"));
    assert_eq!(s.external_token(), Some("ext-tok"));
    assert_eq!(s.external_session_id.as_deref(), Some("sid"));
    assert_eq!(s.user_guid.as_deref(), Some("u-1"));
    assert_eq!(s.widget_id.as_deref(), Some("w-1"));
    assert_eq!(s.saved_email.as_deref(), Some("ada@example.com"));
    assert!(s.device_id.is_some());
    assert!(!s.is_degraded());

    let chatbot_data = backend.last_chatbot_data.lock().unwrap().clone().unwrap();
    assert_eq!(chatbot_data["accessToken"], "ext-tok");
}

#[tokio::test]
async fn login_survives_local_failure() {
    let (port, backend, _shutdown) = spawn_backend().await;
    backend.local_login_fails.store(true, Ordering::SeqCst);
    let session = SessionHandle::in_memory(Session::default());

    let outcome = auth::login(&client(port), &session, "ada@example.com", "right", false)
        .await
        .unwrap();
    assert!(outcome.degraded);

    let s = session.snapshot().await;
    assert_eq!(s.auth_token.as_deref(), Some("ext-tok"));
    assert!(s.is_degraded());
    assert_eq!(s.saved_email, None);
}

#[tokio::test]
async fn login_with_wrong_password_clears_tokens() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let session = SessionHandle::in_memory(Session {
        auth_token: Some("stale".into()),
        external_access_token: Some("stale".into()),
        ..Default::default()
    });

    let err = auth::login(&client(port), &session, "ada@example.com", "wrong", false)
        .await
        .unwrap_err();
    assert_eq!(
        err.login_message(),
        "Invalid email or password for chatbot service"
    );
    let s = session.snapshot().await;
    assert!(!s.is_authenticated());
    assert_eq!(s.external_token(), None);
}

#[tokio::test]
async fn rejected_login_keeps_server_wording() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let session = SessionHandle::in_memory(Session::default());

    let err = auth::login(&client(port), &session, "ada@example.com", "locked", false)
        .await
        .unwrap_err();
    assert_eq!(err.login_message(), "Account locked");
    assert_eq!(session.snapshot().await.external_token(), None);
}

#[tokio::test]
async fn login_with_backend_down() {
    let session = SessionHandle::in_memory(Session::default());
    let err = auth::login(&client(1), &session, "ada@example.com", "right", false)
        .await
        .unwrap_err();
    assert_eq!(
        err.login_message(),
        "Cannot connect to chatbot service. Please check your internet connection."
    );
}

#[tokio::test]
async fn login_validates_before_calling_out() {
    let session = SessionHandle::in_memory(Session::default());
    let err = auth::login(&client(1), &session, "not-an-email", "x", false)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

#[tokio::test]
async fn register_stores_token() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let session = SessionHandle::in_memory(Session::default());
    let form = Registration {
        first_name: "Grace".into(),
        last_name: "Hopper".into(),
        email: "grace@example.com".into(),
        password: "cobol59".into(),
        confirm_password: "cobol59".into(),
        agree_to_terms: true,
    };

    let user = auth::register(&client(port), &session, &form)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.name.as_deref(), Some("Grace Hopper"));
    assert_eq!(
        session.snapshot().await.auth_token.as_deref(),
        Some("reg-tok")
    );
}

#[tokio::test]
async fn register_duplicate_email() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let session = SessionHandle::in_memory(Session::default());
    let form = Registration {
        first_name: "Grace".into(),
        last_name: "Hopper".into(),
        email: "taken@example.com".into(),
        password: "cobol59".into(),
        confirm_password: "cobol59".into(),
        agree_to_terms: true,
    };

    let err = auth::register(&client(port), &session, &form)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "User already exists");
    assert!(!session.snapshot().await.is_authenticated());
}

#[tokio::test]
async fn external_session_check() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let api = client(port);
    assert!(api.check_external_session("sid").await);
    assert!(!api.check_external_session("other").await);
    assert!(!client(1).check_external_session("sid").await);
}

#[tokio::test]
async fn logout_keeps_device_id() {
    let (port, _backend, _shutdown) = spawn_backend().await;
    let session = SessionHandle::in_memory(Session::default());
    auth::login(&client(port), &session, "ada@example.com", "right", true)
        .await
        .unwrap();
    let device = session.snapshot().await.device_id;

    auth::logout(&session).await.unwrap();
    let s = session.snapshot().await;
    assert!(!s.is_authenticated());
    assert_eq!(s.device_id, device);
    assert_eq!(s.saved_email.as_deref(), Some("ada@example.com"));
}
