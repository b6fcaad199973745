//! Wire types for the chat server.
//!
//! Every WebSocket frame is a JSON object with an `action` discriminator.
//! Outbound frames are [`ClientFrame`], inbound frames decode into
//! [`ServerFrame`] through [`decode_server_frame`]. Threads and messages share
//! their shape with the REST endpoints.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Content kind of a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    #[default]
    User,
    Agent,
    System,
}

impl std::str::FromStr for Sender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(format!("unknown sender: {other}")),
        }
    }
}

/// A message in the local log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A message as the server sends it. Every field is optional; the server is
/// not consistent about which ones it fills in, or how.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "RawIncoming")]
pub struct IncomingMessage {
    pub id: Option<String>,
    pub kind: Option<MessageType>,
    pub content: Option<String>,
    pub timestamp: Option<i64>,
    pub sender: Option<Sender>,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
}

/// Wire shape of [`IncomingMessage`]. Both spellings of the body and the
/// thread id may be present at once; values that do not parse count as
/// missing instead of failing the frame.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIncoming {
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient_parse")]
    kind: Option<MessageType>,
    #[serde(default, deserialize_with = "lenient_string")]
    content: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    message: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<i64>,
    #[serde(default, deserialize_with = "lenient_parse")]
    sender: Option<Sender>,
    #[serde(default, deserialize_with = "lenient_string")]
    thread_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    room_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    user_id: Option<String>,
}

impl From<RawIncoming> for IncomingMessage {
    fn from(raw: RawIncoming) -> Self {
        let present = |v: &String| !v.is_empty();
        Self {
            id: raw.id.filter(present),
            kind: raw.kind,
            content: raw.content.filter(present).or(raw.message),
            timestamp: raw.timestamp.filter(|&t| t > 0),
            sender: raw.sender,
            thread_id: raw.thread_id.filter(present).or(raw.room_id),
            user_id: raw.user_id,
        }
    }
}

impl IncomingMessage {
    /// Fill in the gaps: generated id, `text`, arrival time, `user`.
    pub fn into_message(self, now_ms: i64) -> Message {
        let timestamp = self.timestamp.unwrap_or(now_ms);
        Message {
            id: self.id.unwrap_or_else(|| timestamp.to_string()),
            kind: self.kind.unwrap_or_default(),
            content: self.content.unwrap_or_default(),
            timestamp,
            sender: self.sender.unwrap_or_default(),
            thread_id: self.thread_id,
            user_id: self.user_id,
        }
    }
}

// =============================================================================
// Threads
// =============================================================================

/// Conversation status. The platform uses small integers on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ThreadStatus {
    #[default]
    Open,
    Resolved,
    Other(u8),
}

impl From<u8> for ThreadStatus {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Open,
            2 => Self::Resolved,
            other => Self::Other(other),
        }
    }
}

impl From<ThreadStatus> for u8 {
    fn from(status: ThreadStatus) -> Self {
        match status {
            ThreadStatus::Open => 1,
            ThreadStatus::Resolved => 2,
            ThreadStatus::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientData {
    #[serde(
        default,
        rename = "phoneNumber",
        skip_serializing_if = "Option::is_none"
    )]
    pub phone_number: Option<String>,
}

/// The customer on the other end of a thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Client {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub data: ClientData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub from_guid: Option<String>,
}

impl From<&Message> for LastMessage {
    fn from(msg: &Message) -> Self {
        Self {
            id: Some(msg.id.clone()),
            content: msg.content.clone(),
            timestamp: msg.timestamp,
            from_guid: msg.user_id.clone(),
        }
    }
}

/// The agent a thread is assigned to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
}

impl Agent {
    /// Two-letter initials, "AG" when the names are missing.
    pub fn initials(&self) -> String {
        let first = self
            .firstname
            .as_deref()
            .and_then(|s| s.chars().next())
            .unwrap_or('A');
        let last = self
            .lastname
            .as_deref()
            .and_then(|s| s.chars().next())
            .unwrap_or('G');
        format!("{first}{last}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A single customer conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub guid: String,
    #[serde(default)]
    pub client: Client,
    #[serde(default, rename = "lastMessage")]
    pub last_message: Option<LastMessage>,
    #[serde(default, rename = "unreadCount")]
    pub unread_count: u32,
    #[serde(default)]
    pub status: ThreadStatus,
    #[serde(default, rename = "assignedTo")]
    pub assigned_to: Option<Agent>,
    #[serde(default, rename = "botDriven")]
    pub bot_driven: bool,
    #[serde(default, rename = "is_archive", with = "int_bool")]
    pub archived: bool,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub widget_uid: Option<String>,
    #[serde(default)]
    pub integration_id: Option<String>,
}

impl Thread {
    pub fn display_name(&self) -> &str {
        self.client.name.as_deref().unwrap_or("Unknown User")
    }

    pub fn last_activity(&self) -> i64 {
        self.last_message.as_ref().map_or(0, |m| m.timestamp)
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Frames sent FROM the relay TO the chat server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Handshake sent as soon as the socket opens.
    #[serde(rename_all = "camelCase")]
    Auth {
        guid: String,
        widget: String,
        workspace: String,
        token: String,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        thread_id: String,
        content: String,
        #[serde(rename = "type")]
        kind: MessageType,
        timestamp: i64,
    },

    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },

    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames sent FROM the chat server TO the relay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action")]
pub enum ServerFrame {
    /// Handshake acknowledgment.
    #[serde(rename = "auth")]
    Auth {},

    #[serde(rename = "wsError")]
    WsError {
        #[serde(default, deserialize_with = "lenient_u16")]
        code: Option<u16>,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "new_message")]
    NewMessage(IncomingMessage),

    /// Something about the thread list changed; the relay re-fetches it whole.
    #[serde(rename = "thread_update")]
    ThreadUpdate {
        #[serde(default, rename = "threadId")]
        thread_id: Option<String>,
    },
}

/// A decoded inbound frame plus the online-user count any frame may carry.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub frame: ServerFrame,
    pub online_users: Option<u32>,
}

/// Decode one text frame. Unknown actions and malformed JSON are errors; the
/// relay logs and drops them.
pub fn decode_server_frame(text: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let online_users = value
        .get("onlineUsers")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok());
    let frame = ServerFrame::deserialize(value)?;
    Ok(Inbound {
        frame,
        online_users,
    })
}

// =============================================================================
// Serde helpers
// =============================================================================

/// Accept ids that arrive as strings or numbers.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Parse a string field through `FromStr`; anything unrecognised is `None`.
fn lenient_parse<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s.trim().to_ascii_lowercase().parse().ok(),
        _ => None,
    })
}

/// Milliseconds since the epoch from a number, a numeric string or an
/// RFC 3339 date.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            })
        }
        _ => None,
    })
}

/// Accept status codes that arrive as numbers or numeric strings.
fn lenient_u16<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// `is_archive` is 0/1 on the wire; booleans are accepted too.
mod int_bool {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            _ => false,
        })
    }
}
