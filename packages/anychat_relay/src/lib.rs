//! Client library for the AnyChat live-chat platform.
//!
//! The centre of the crate is [`Relay`]: one WebSocket connection to the chat
//! server that authenticates with the session token, keeps the thread list and
//! the open thread's message log current, and republishes both through
//! [`Relay::snapshot`] and a broadcast channel of [`RelayEvent`]s.
//!
//! Around it:
//!
//! - [`session`] holds the tokens and ids shared by everything else, persisted
//!   to a JSON file.
//! - [`auth`] runs the two-step login, registration and logout.
//! - [`api`] is the REST client for threads, history and the login endpoints.
//! - [`threads`] has the list helpers consumers need to present threads.
//!
//! # Example
//!
//! ```no_run
//! use anychat_relay::{ApiClient, ApiConfig, Relay, RelayConfig, SessionHandle, SessionStore};
//!
//! # async fn run() -> anychat_relay::Result<()> {
//! let session = SessionHandle::open(SessionStore::new("/tmp/anychat/session.json"))?;
//! let api = ApiClient::new(ApiConfig {
//!     external_base: "https://api.chatbot24.ai/v1".into(),
//!     backend_base: "http://localhost:5000".into(),
//! });
//! let relay = Relay::new(api, session, RelayConfig::default());
//! let mut events = relay.subscribe();
//! relay.connect().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod state;
pub mod threads;

pub use api::{ApiClient, ApiConfig, ChatApi};
pub use error::{RelayError, Result};
pub use protocol::{Message, MessageType, Sender, Thread, ThreadStatus};
pub use relay::{Relay, RelayConfig};
pub use session::{Session, SessionHandle, SessionStore};
pub use state::{ConnectionState, RelayEvent, RelaySnapshot};
pub use threads::ThreadTab;

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
