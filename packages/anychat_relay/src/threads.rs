//! Helpers for presenting the thread list.

use chrono::{TimeZone, Utc};

use crate::protocol::Thread;

/// Inbox tabs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThreadTab {
    /// Human-handled, not archived.
    #[default]
    Active,
    BotDriven,
    Archive,
}

impl ThreadTab {
    pub fn matches(self, thread: &Thread) -> bool {
        match self {
            Self::Active => !thread.bot_driven && !thread.archived,
            Self::BotDriven => thread.bot_driven && !thread.archived,
            Self::Archive => thread.archived,
        }
    }
}

impl std::str::FromStr for ThreadTab {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "bot" | "bot-driven" => Ok(Self::BotDriven),
            "archive" => Ok(Self::Archive),
            other => Err(format!("unknown tab: {other}")),
        }
    }
}

/// Threads on `tab`, most recent activity first.
pub fn filter_threads(threads: &[Thread], tab: ThreadTab) -> Vec<&Thread> {
    let mut out: Vec<&Thread> = threads.iter().filter(|t| tab.matches(t)).collect();
    out.sort_by_key(|t| std::cmp::Reverse(t.last_activity()));
    out
}

/// Short age label: "Just now", "5m ago", "3h ago", then "Mar 4".
pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    if timestamp_ms <= 0 {
        return "Just now".to_string();
    }
    let diff = now_ms - timestamp_ms;
    if diff < 60_000 {
        return "Just now".to_string();
    }
    if diff < 3_600_000 {
        return format!("{}m ago", diff / 60_000);
    }
    if diff < 86_400_000 {
        return format!("{}h ago", diff / 3_600_000);
    }
    match Utc.timestamp_millis_opt(timestamp_ms).single() {
        Some(dt) => dt.format("%b %-d").to_string(),
        None => "Just now".to_string(),
    }
}

/// Unread counter text; empty when there is nothing unread.
pub fn unread_badge(count: u32) -> String {
    match count {
        0 => String::new(),
        1..=99 => count.to_string(),
        _ => "99+".to_string(),
    }
}

/// Display label for the channel a thread came in through.
pub fn channel_label(integration_id: Option<&str>) -> &'static str {
    match integration_id {
        Some("whatsapp") => "WhatsApp",
        Some("messenger") => "Messenger",
        Some("instagram") => "Instagram",
        Some("telegram") => "Telegram",
        Some("web-chat") => "Web chat",
        _ => "Chat",
    }
}
