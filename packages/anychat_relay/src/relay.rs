//! The relay driver.
//!
//! [`Relay`] is a cheap cloneable handle. Behind it sit the shared
//! [`RelayState`], at most one socket task, and a broadcast channel for
//! [`RelayEvent`]s. Every operation is a short critical section on the state
//! followed by carrying out the effects it recorded.
//!
//! Each `connect`/`disconnect` bumps a generation counter. Socket callbacks
//! and fetch results carry the generation they were started under and are
//! dropped once it is stale, so a superseded socket can never touch state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::error::{RelayError, Result};
use crate::now_ms;
use crate::protocol::{ClientFrame, Message, MessageType, decode_server_frame};
use crate::session::{SessionHandle, redact};
use crate::state::{ConnectionState, Effect, RelayEvent, RelaySnapshot, RelayState};

pub const DEFAULT_WS_URL: &str = "wss://api.anychat.one/chat/";

/// How long `disconnect` waits for the close handshake before aborting.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub ws_url: String,
    pub project_id: Option<String>,
    pub agency_id: Option<String>,
    /// Reopen the socket this long after an unclean close. `None` leaves
    /// reconnecting to the caller.
    pub reconnect_delay: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            project_id: None,
            agency_id: None,
            reconnect_delay: None,
        }
    }
}

impl RelayConfig {
    /// Socket URL with the token and scoping ids in the query string.
    pub fn socket_url(&self, token: &str) -> Result<String> {
        let mut params = vec![("token", token)];
        if let Some(project) = self.project_id.as_deref() {
            params.push(("projectId", project));
        }
        if let Some(agency) = self.agency_id.as_deref() {
            params.push(("agencyId", agency));
        }
        let url = reqwest::Url::parse_with_params(&self.ws_url, &params)
            .map_err(|e| RelayError::Other(anyhow::anyhow!("invalid socket url: {e}")))?;
        Ok(url.to_string())
    }
}

/// Commands for the socket task.
#[derive(Debug)]
enum Outbound {
    Frame(ClientFrame),
    Close,
}

/// How one socket connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closure {
    Clean,
    Unclean,
    Failed,
}

struct SocketTask {
    handle: JoinHandle<()>,
}

struct Inner<A> {
    api: A,
    session: SessionHandle,
    config: RelayConfig,
    state: RwLock<RelayState>,
    events: broadcast::Sender<RelayEvent>,
    socket: Mutex<Option<SocketTask>>,
    outbound: std::sync::Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    generation: AtomicU64,
}

/// Handle to the chat relay. Clones share one connection.
pub struct Relay<A: ChatApi> {
    inner: Arc<Inner<A>>,
}

impl<A: ChatApi> Clone for Relay<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ChatApi> Relay<A> {
    pub fn new(api: A, session: SessionHandle, config: RelayConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                session,
                config,
                state: RwLock::new(RelayState::new()),
                events,
                socket: Mutex::new(None),
                outbound: std::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.inner.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    pub async fn snapshot(&self) -> RelaySnapshot {
        self.inner.state.read().await.snapshot()
    }

    pub async fn connection(&self) -> ConnectionState {
        self.inner.state.read().await.connection()
    }

    /// Open the socket. A no-op while a socket is connecting or connected.
    ///
    /// Fails without touching the network when the session has no token; the
    /// relay is then in `error` with the reason recorded.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.inner.socket.lock().await;
        let alive = slot.as_ref().is_some_and(|t| !t.handle.is_finished());
        if alive
            && matches!(
                self.inner.state.read().await.connection(),
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            debug!("connect ignored, socket already active");
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.handle.abort();
        }
        self.inner.outbound_slot().take();

        let session = self.inner.session.snapshot().await;
        let (generation, result, effects) = {
            let mut state = self.inner.state.write().await;
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let result = state.begin_connect(session.external_token());
            (generation, result, state.take_effects())
        };
        self.inner.dispatch(generation, effects);
        result?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound_slot() = Some(tx);
        let handle = tokio::spawn(Arc::clone(&self.inner).run_socket(generation, rx));
        *slot = Some(SocketTask { handle });
        Ok(())
    }

    /// Close the socket with a normal closure. Session data and the message
    /// log are kept.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.socket.lock().await;
        let (generation, effects) = {
            let mut state = self.inner.state.write().await;
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            state.disconnect();
            (generation, state.take_effects())
        };
        self.inner.dispatch(generation, effects);

        let sender = self.inner.outbound_slot().take();
        if let Some(tx) = sender {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(task) = slot.take() {
            let mut handle = task.handle;
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                debug!("socket task still running after close, aborting");
                handle.abort();
            }
        }
        info!("relay disconnected");
    }

    /// Send `content` to the open thread and append the optimistic copy.
    ///
    /// Refused, with nothing appended or queued, unless connected with a
    /// thread open and non-blank content.
    pub async fn send_message(&self, content: &str, kind: MessageType) -> Result<Message> {
        let result = self
            .inner
            .apply(|s| s.prepare_send(content, kind, now_ms()))
            .await;
        if let Err(e) = &result {
            warn!("message not sent: {}", e);
        }
        result
    }

    /// Open `thread_id` and load its history.
    pub async fn join_room(&self, thread_id: &str) -> Result<()> {
        self.inner.apply(|s| s.join(thread_id)).await;
        self.inner
            .session
            .set_current_thread(Some(thread_id.to_string()))
            .await
    }

    pub async fn leave_room(&self, thread_id: &str) -> Result<()> {
        if self.inner.apply(|s| s.leave(thread_id)).await {
            self.inner.session.set_current_thread(None).await?;
        }
        Ok(())
    }

    /// Re-open the thread stored in the session, if any.
    pub async fn restore_room(&self) -> Result<Option<String>> {
        let stored = self.inner.session.snapshot().await.current_thread_id;
        if let Some(thread_id) = stored.as_deref() {
            debug!(thread_id, "restoring open thread");
            self.join_room(thread_id).await?;
        }
        Ok(stored)
    }

    pub async fn refresh_threads(&self) {
        self.inner.apply(|s| s.request_threads()).await;
    }

    pub async fn clear_error(&self) {
        self.inner.apply(|s| s.clear_error()).await;
    }
}

impl<A: ChatApi> Inner<A> {
    fn outbound_slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Run `f` on the state under the current generation.
    async fn apply<T>(self: &Arc<Self>, f: impl FnOnce(&mut RelayState) -> T) -> T {
        let mut state = self.state.write().await;
        let generation = self.generation.load(Ordering::SeqCst);
        let out = f(&mut state);
        let effects = state.take_effects();
        drop(state);
        self.dispatch(generation, effects);
        out
    }

    /// Run `f` only if `generation` is still current.
    async fn apply_at<T>(
        self: &Arc<Self>,
        generation: u64,
        f: impl FnOnce(&mut RelayState) -> T,
    ) -> Option<T> {
        let mut state = self.state.write().await;
        if !self.is_current(generation) {
            debug!(generation, "dropping update from a superseded socket");
            return None;
        }
        let out = f(&mut state);
        let effects = state.take_effects();
        drop(state);
        self.dispatch(generation, effects);
        Some(out)
    }

    fn dispatch(self: &Arc<Self>, generation: u64, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Event(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
                Effect::FetchThreads => {
                    tokio::spawn(Arc::clone(self).fetch_threads(generation));
                }
                Effect::FetchMessages(thread_id) => {
                    tokio::spawn(Arc::clone(self).fetch_messages(generation, thread_id));
                }
                Effect::Send(frame) => {
                    let outbound = self.outbound_slot();
                    match outbound.as_ref() {
                        Some(tx) if tx.send(Outbound::Frame(frame)).is_ok() => {}
                        _ => warn!("no socket, dropping outbound frame"),
                    }
                }
            }
        }
    }

    async fn fetch_threads(self: Arc<Self>, generation: u64) {
        let session = self.session.snapshot().await;
        match self.api.fetch_threads(&session).await {
            Ok(threads) => {
                self.apply_at(generation, |s| s.set_threads(threads)).await;
            }
            Err(e) => {
                warn!("failed to fetch threads: {}", e);
                self.apply_at(generation, |s| s.on_fetch_failed(&e)).await;
            }
        }
    }

    async fn fetch_messages(self: Arc<Self>, generation: u64, thread_id: String) {
        let session = self.session.snapshot().await;
        match self.api.fetch_messages(&session, &thread_id).await {
            Ok(history) => {
                self.apply_at(generation, |s| s.set_history(&thread_id, history))
                    .await;
            }
            Err(e) => {
                warn!(thread_id = %thread_id, "failed to fetch messages: {}", e);
                self.apply_at(generation, |s| s.on_fetch_failed(&e)).await;
            }
        }
    }

    // =========================================================================
    // Socket task
    // =========================================================================

    async fn run_socket(
        self: Arc<Self>,
        generation: u64,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut first = true;
        loop {
            if !first {
                let session = self.session.snapshot().await;
                let reopened = self
                    .apply_at(generation, |s| s.begin_connect(session.external_token()).is_ok())
                    .await;
                if reopened != Some(true) {
                    break;
                }
            }
            first = false;

            let closure = self.run_connection(generation, &mut outbound).await;
            let Some(delay) = self.config.reconnect_delay else {
                break;
            };
            if closure != Closure::Unclean || !self.is_current(generation) {
                break;
            }
            info!(delay_secs = delay.as_secs(), "reconnecting after unclean close");
            tokio::time::sleep(delay).await;
            if !self.is_current(generation) {
                break;
            }
        }
        debug!(generation, "socket task finished");
    }

    async fn run_connection(
        self: &Arc<Self>,
        generation: u64,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Closure {
        let device_id = match self
            .session
            .update(|s| s.ensure_device_id().to_string())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to persist device id: {}", e);
                self.session
                    .snapshot()
                    .await
                    .device_id
                    .unwrap_or_default()
            }
        };
        let session = self.session.snapshot().await;
        let Some(token) = session.external_token() else {
            self.apply_at(generation, |s| {
                let _ = s.begin_connect(None);
            })
            .await;
            return Closure::Failed;
        };

        let url = match self.config.socket_url(token) {
            Ok(url) => url,
            Err(e) => {
                warn!("{}", e);
                self.apply_at(generation, |s| s.on_transport_error()).await;
                return Closure::Failed;
            }
        };

        info!(url = %self.config.ws_url, token = %redact(token), "opening chat socket");
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                warn!("chat socket failed to open: {}", RelayError::from_tungstenite(e));
                self.apply_at(generation, |s| s.on_transport_error()).await;
                return Closure::Failed;
            }
        };
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let auth = ClientFrame::Auth {
            guid: session.user_guid.clone().unwrap_or_default(),
            widget: session.widget_id.clone().unwrap_or_default(),
            workspace: session.workspace_id.clone().unwrap_or_default(),
            token: token.to_string(),
            device_id,
        };
        if let Err(e) = write_frame(&mut ws_write, &auth).await {
            warn!("failed to send auth: {}", e);
            self.apply_at(generation, |s| s.on_transport_error()).await;
            return Closure::Failed;
        }
        debug!("auth sent, waiting for ack");

        loop {
            tokio::select! {
                cmd = outbound.recv() => match cmd {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = write_frame(&mut ws_write, &frame).await {
                            warn!("failed to send frame: {}", e);
                            self.apply_at(generation, |s| s.on_transport_error()).await;
                            return Closure::Unclean;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "User disconnected".into(),
                        };
                        let _ = ws_write.send(tungstenite::Message::Close(Some(close))).await;
                        return Closure::Clean;
                    }
                },
                msg = ws_read.next() => match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        self.handle_text(generation, text.as_str()).await;
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_string()),
                            None => (None, String::new()),
                        };
                        info!(?code, reason = %reason, "chat socket closed by server");
                        let clean = self
                            .apply_at(generation, |s| s.on_closed(code, &reason))
                            .await
                            .unwrap_or(true);
                        return if clean { Closure::Clean } else { Closure::Unclean };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("chat socket error: {}", RelayError::from_tungstenite(e));
                        self.apply_at(generation, |s| s.on_transport_error()).await;
                        return Closure::Unclean;
                    }
                    None => {
                        self.apply_at(generation, |s| s.on_closed(None, "")).await;
                        return Closure::Unclean;
                    }
                },
            }
        }
    }

    async fn handle_text(self: &Arc<Self>, generation: u64, text: &str) {
        match decode_server_frame(text) {
            Ok(inbound) => {
                let now = now_ms();
                self.apply_at(generation, |s| s.on_frame(inbound, now)).await;
            }
            Err(e) => warn!("dropping malformed frame: {}", e),
        }
    }
}

async fn write_frame<S>(ws_write: &mut S, frame: &ClientFrame) -> Result<()>
where
    S: futures::Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let json = frame.encode()?;
    ws_write
        .send(tungstenite::Message::Text(json.into()))
        .await
        .map_err(RelayError::from_tungstenite)
}
