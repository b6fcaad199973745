//! Relay state machine.
//!
//! [`RelayState`] owns everything the relay republishes: connection state,
//! the open thread's message log, the thread list and the online count. It
//! does no I/O. Each transition records [`Effect`]s in an outbox that the
//! driver in [`crate::relay`] drains and carries out.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::{
    ClientFrame, Inbound, LastMessage, Message, MessageType, Sender, ServerFrame, Thread,
};

/// Lifecycle of the single relay socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Error => "Connection Error",
        };
        f.write_str(text)
    }
}

/// Notifications broadcast to relay subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    StateChanged(ConnectionState),
    MessageAppended(Message),
    ThreadsUpdated,
    HistoryLoaded { thread_id: String },
    OnlineUsers(u32),
    Error(String),
    /// The server or the API rejected our token. Nothing refreshes it; the
    /// consumer should send the user back to login.
    SessionExpired,
}

/// Work the driver has to do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    FetchThreads,
    FetchMessages(String),
    Send(ClientFrame),
    Event(RelayEvent),
}

/// Read-only copy of the relay state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelaySnapshot {
    pub connection: ConnectionState,
    pub error: Option<String>,
    pub messages: Vec<Message>,
    pub threads: Vec<Thread>,
    pub current_thread: Option<String>,
    pub online_users: u32,
}

impl RelaySnapshot {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn thread(&self, guid: &str) -> Option<&Thread> {
        self.threads.iter().find(|t| t.guid == guid)
    }
}

#[derive(Debug, Default)]
pub struct RelayState {
    connection: ConnectionState,
    error: Option<String>,
    messages: Vec<Message>,
    threads: Vec<Thread>,
    current_thread: Option<String>,
    online_users: u32,
    outbox: Vec<Effect>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn current_thread(&self) -> Option<&str> {
        self.current_thread.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            connection: self.connection,
            error: self.error.clone(),
            messages: self.messages.clone(),
            threads: self.threads.clone(),
            current_thread: self.current_thread.clone(),
            online_users: self.online_users,
        }
    }

    /// Drain the effects recorded since the last call.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    fn emit(&mut self, event: RelayEvent) {
        self.outbox.push(Effect::Event(event));
    }

    fn set_connection(&mut self, next: ConnectionState) {
        if self.connection != next {
            info!(from = ?self.connection, to = ?next, "relay state");
            self.connection = next;
            self.emit(RelayEvent::StateChanged(next));
        }
    }

    fn set_error(&mut self, message: String) {
        self.error = Some(message.clone());
        self.emit(RelayEvent::Error(message));
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    fn is_open_thread(&self, thread_id: &str) -> bool {
        self.current_thread.as_deref() == Some(thread_id)
    }

    // ── connection lifecycle ────────────────────────────────────────────

    /// Enter `connecting`. Without a token the relay lands in `error` instead
    /// and the caller must not open a socket.
    pub fn begin_connect(&mut self, token: Option<&str>) -> Result<()> {
        if token.is_none_or(|t| t.trim().is_empty()) {
            warn!("connect refused: no token in session");
            self.set_connection(ConnectionState::Error);
            self.set_error(RelayError::MissingToken.to_string());
            return Err(RelayError::MissingToken);
        }
        self.error = None;
        self.set_connection(ConnectionState::Connecting);
        Ok(())
    }

    /// The socket could not be opened or failed mid-stream.
    pub fn on_transport_error(&mut self) {
        self.set_connection(ConnectionState::Error);
        self.set_error("WebSocket connection failed".to_string());
    }

    /// The socket closed. Returns true for a clean (1000) close.
    pub fn on_closed(&mut self, code: Option<u16>, reason: &str) -> bool {
        if code == Some(1000) {
            self.set_connection(ConnectionState::Disconnected);
            return true;
        }
        let reason = if reason.is_empty() {
            "Unknown reason"
        } else {
            reason
        };
        self.set_connection(ConnectionState::Error);
        self.set_error(format!("Connection closed: {reason}"));
        false
    }

    /// Explicit disconnect. Session data and the message log are untouched.
    pub fn disconnect(&mut self) {
        self.error = None;
        self.set_connection(ConnectionState::Disconnected);
    }

    // ── inbound frames ──────────────────────────────────────────────────

    pub fn on_frame(&mut self, inbound: Inbound, now_ms: i64) {
        if let Some(count) = inbound.online_users {
            if count != self.online_users {
                self.online_users = count;
                self.emit(RelayEvent::OnlineUsers(count));
            }
        }

        match inbound.frame {
            ServerFrame::Auth {} => {
                if self.connection == ConnectionState::Connecting {
                    self.error = None;
                    self.set_connection(ConnectionState::Connected);
                    self.outbox.push(Effect::FetchThreads);
                    // A thread opened before the ack was never announced.
                    if let Some(room_id) = self.current_thread.clone() {
                        self.outbox
                            .push(Effect::Send(ClientFrame::JoinRoom { room_id }));
                    }
                } else {
                    debug!(state = ?self.connection, "ignoring auth ack");
                }
            }
            ServerFrame::WsError { code, message } => {
                warn!(?code, ?message, "server reported an error");
                self.set_error(message.unwrap_or_else(|| "WebSocket error".to_string()));
                if code == Some(403) {
                    self.emit(RelayEvent::SessionExpired);
                }
            }
            ServerFrame::NewMessage(incoming) => {
                self.on_new_message(incoming.into_message(now_ms));
            }
            ServerFrame::ThreadUpdate { thread_id } => {
                debug!(?thread_id, "thread update, re-fetching list");
                self.outbox.push(Effect::FetchThreads);
            }
        }
    }

    fn on_new_message(&mut self, msg: Message) {
        let belongs_to_open = match msg.thread_id.as_deref() {
            Some(tid) => self.is_open_thread(tid),
            None => true,
        };

        if let Some(tid) = msg.thread_id.clone() {
            let is_open = self.is_open_thread(&tid);
            match self.threads.iter_mut().find(|t| t.guid == tid) {
                Some(thread) => {
                    thread.last_message = Some(LastMessage::from(&msg));
                    if !is_open {
                        thread.unread_count = thread.unread_count.saturating_add(1);
                    }
                    self.emit(RelayEvent::ThreadsUpdated);
                }
                None => {
                    debug!(thread_id = %tid, "message for unknown thread");
                    self.outbox.push(Effect::FetchThreads);
                }
            }
        }

        if belongs_to_open {
            self.messages.push(msg.clone());
            self.emit(RelayEvent::MessageAppended(msg));
        }
    }

    // ── fetch results ───────────────────────────────────────────────────

    /// Replace the thread list. Duplicate guids collapse into one entry
    /// holding the last copy; the open thread stays read.
    pub fn set_threads(&mut self, threads: Vec<Thread>) {
        let mut merged: Vec<Thread> = Vec::with_capacity(threads.len());
        for thread in threads {
            match merged.iter_mut().find(|t| t.guid == thread.guid) {
                Some(existing) => *existing = thread,
                None => merged.push(thread),
            }
        }
        if let Some(open) = self.current_thread.as_deref() {
            if let Some(thread) = merged.iter_mut().find(|t| t.guid == open) {
                thread.unread_count = 0;
            }
        }
        self.threads = merged;
        self.emit(RelayEvent::ThreadsUpdated);
    }

    /// Install fetched history for `thread_id`, ahead of any live messages
    /// that arrived while the fetch was in flight. Stale results are ignored.
    pub fn set_history(&mut self, thread_id: &str, history: Vec<Message>) {
        if !self.is_open_thread(thread_id) {
            debug!(thread_id, "discarding history for a thread that is no longer open");
            return;
        }
        let live: Vec<Message> = std::mem::take(&mut self.messages)
            .into_iter()
            .filter(|m| !history.iter().any(|h| h.id == m.id))
            .collect();
        let mut merged = history;
        merged.extend(live);
        self.messages = merged;
        self.emit(RelayEvent::HistoryLoaded {
            thread_id: thread_id.to_string(),
        });
    }

    /// A fetch failed. The error is surfaced; an auth failure also asks the
    /// consumer to log in again.
    pub fn on_fetch_failed(&mut self, err: &RelayError) {
        if err.requires_login() {
            self.emit(RelayEvent::SessionExpired);
        }
        self.set_error(err.to_string());
    }

    pub fn request_threads(&mut self) {
        self.outbox.push(Effect::FetchThreads);
    }

    // ── rooms ───────────────────────────────────────────────────────────

    /// Open `thread_id`: clear the log, mark it read, tell the server, load
    /// its history.
    pub fn join(&mut self, thread_id: &str) {
        let previous = self.current_thread.replace(thread_id.to_string());
        self.messages.clear();

        if let Some(thread) = self.threads.iter_mut().find(|t| t.guid == thread_id) {
            thread.unread_count = 0;
            self.emit(RelayEvent::ThreadsUpdated);
        }

        if self.connection == ConnectionState::Connected {
            if let Some(prev) = previous.filter(|p| p != thread_id) {
                self.outbox
                    .push(Effect::Send(ClientFrame::LeaveRoom { room_id: prev }));
            }
            self.outbox.push(Effect::Send(ClientFrame::JoinRoom {
                room_id: thread_id.to_string(),
            }));
        }

        self.outbox
            .push(Effect::FetchMessages(thread_id.to_string()));
    }

    /// Leave `thread_id`. Returns true when it was the open thread.
    pub fn leave(&mut self, thread_id: &str) -> bool {
        if self.connection == ConnectionState::Connected {
            self.outbox.push(Effect::Send(ClientFrame::LeaveRoom {
                room_id: thread_id.to_string(),
            }));
        }
        if self.is_open_thread(thread_id) {
            self.current_thread = None;
            true
        } else {
            false
        }
    }

    // ── outbound ────────────────────────────────────────────────────────

    /// Validate a send and append the optimistic copy. Nothing is mutated when
    /// a precondition fails.
    pub fn prepare_send(&mut self, content: &str, kind: MessageType, now_ms: i64) -> Result<Message> {
        if self.connection != ConnectionState::Connected {
            return Err(RelayError::NotConnected);
        }
        let Some(thread_id) = self.current_thread.clone() else {
            return Err(RelayError::NoCurrentThread);
        };
        let content = content.trim();
        if content.is_empty() {
            return Err(RelayError::EmptyMessage);
        }

        let msg = Message {
            id: format!("temp-{now_ms}"),
            kind,
            content: content.to_string(),
            timestamp: now_ms,
            sender: Sender::User,
            thread_id: Some(thread_id.clone()),
            user_id: None,
        };

        self.outbox.push(Effect::Send(ClientFrame::SendMessage {
            thread_id: thread_id.clone(),
            content: msg.content.clone(),
            kind,
            timestamp: now_ms,
        }));

        if let Some(thread) = self.threads.iter_mut().find(|t| t.guid == thread_id) {
            thread.last_message = Some(LastMessage::from(&msg));
            self.emit(RelayEvent::ThreadsUpdated);
        }
        self.messages.push(msg.clone());
        self.emit(RelayEvent::MessageAppended(msg.clone()));
        Ok(msg)
    }
}
