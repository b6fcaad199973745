use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use anychat_relay::threads::{channel_label, filter_threads, format_relative_time, unread_badge};
use anychat_relay::{
    ApiClient, ChatApi, Message, MessageType, Relay, RelayEvent, Sender, Thread, ThreadTab,
    now_ms,
};

use super::{api_client, open_session};
use crate::config::{AppDirs, FileConfig};

const SESSION_EXPIRED: &str = "Session expired. Run `anychat login` again.";

/// `anychat threads`: one-shot listing without opening a socket.
pub async fn threads_command(
    dirs: &AppDirs,
    config: &FileConfig,
    tab: ThreadTab,
    json: bool,
) -> Result<()> {
    let session = open_session(dirs)?;
    let api = api_client(config);

    let threads = match api.fetch_threads(&session.snapshot().await).await {
        Ok(threads) => threads,
        Err(e) if e.requires_login() => anyhow::bail!(SESSION_EXPIRED),
        Err(e) => return Err(e).context("Failed to fetch threads"),
    };
    let visible = filter_threads(&threads, tab);

    if json {
        println!("{}", serde_json::to_string_pretty(&visible)?);
        return Ok(());
    }
    print_threads(&visible);
    Ok(())
}

/// `anychat chat`: interactive session over the relay.
///
/// Plain lines are sent to the open thread; lines starting with `/` are
/// commands (see `/help`).
pub async fn chat_command(
    dirs: &AppDirs,
    config: &FileConfig,
    thread: Option<String>,
) -> Result<()> {
    let session = open_session(dirs)?;
    let relay = Relay::new(api_client(config), session, config.relay.to_runtime());

    let printer = tokio::spawn(print_events(relay.clone()));

    if let Err(e) = relay.connect().await {
        printer.abort();
        if e.requires_login() {
            anyhow::bail!(SESSION_EXPIRED);
        }
        return Err(e).context("Failed to connect");
    }

    match thread {
        Some(id) => relay.join_room(&id).await?,
        None => {
            if let Some(id) = relay.restore_room().await? {
                eprintln!("[reopened {id}]");
            }
        }
    }
    eprintln!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Send(text) => {
                if let Err(e) = relay.send_message(text, MessageType::Text).await {
                    eprintln!("[not sent: {e}]");
                }
            }
            Input::Join(id) => relay.join_room(id).await?,
            Input::Leave => match relay.snapshot().await.current_thread {
                Some(id) => {
                    relay.leave_room(&id).await?;
                    eprintln!("[left {id}]");
                }
                None => eprintln!("[no thread open]"),
            },
            Input::Threads(tab) => {
                let snap = relay.snapshot().await;
                print_threads(&filter_threads(&snap.threads, tab));
            }
            Input::Refresh => relay.refresh_threads().await,
            Input::Reconnect => {
                relay.disconnect().await;
                if let Err(e) = relay.connect().await {
                    eprintln!("[reconnect failed: {e}]");
                }
            }
            Input::Status => {
                let snap = relay.snapshot().await;
                eprintln!(
                    "[{} | {} online | thread: {}]",
                    snap.connection,
                    snap.online_users,
                    snap.current_thread.as_deref().unwrap_or("none")
                );
                if let Some(err) = snap.error.as_deref() {
                    eprintln!("[last error: {err}]");
                }
            }
            Input::ClearError => relay.clear_error().await,
            Input::Help => print_help(),
            Input::Quit => break,
            Input::Unknown(cmd) => eprintln!("[unknown command {cmd}, try /help]"),
        }
    }

    relay.disconnect().await;
    printer.abort();
    Ok(())
}

async fn print_events(relay: Relay<ApiClient>) {
    let mut events = relay.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("event printer fell behind, skipped {} events", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            RelayEvent::StateChanged(state) => eprintln!("[{state}]"),
            RelayEvent::MessageAppended(msg) => println!("{}", format_message(&msg)),
            RelayEvent::HistoryLoaded { thread_id } => {
                let snap = relay.snapshot().await;
                let title = snap
                    .thread(&thread_id)
                    .map_or(thread_id.as_str(), Thread::display_name);
                eprintln!("── {title} ──");
                for msg in &snap.messages {
                    println!("{}", format_message(msg));
                }
            }
            RelayEvent::OnlineUsers(n) => eprintln!("[{n} online]"),
            RelayEvent::Error(e) => eprintln!("[error: {e}]"),
            RelayEvent::SessionExpired => eprintln!("[{SESSION_EXPIRED}]"),
            RelayEvent::ThreadsUpdated => debug!("thread list updated"),
        }
    }
}

fn print_threads(threads: &[&Thread]) {
    if threads.is_empty() {
        eprintln!("No conversations.");
        return;
    }
    let now = now_ms();
    for thread in threads {
        println!("{}", format_thread_line(thread, now));
    }
}

fn format_thread_line(thread: &Thread, now: i64) -> String {
    let preview: String = thread
        .last_message
        .as_ref()
        .map(|m| m.content.chars().take(40).collect())
        .unwrap_or_default();
    format!(
        "{:>3}  {:<20}  {:<24}  {:<9}  {:>9}  {}",
        unread_badge(thread.unread_count),
        thread.guid,
        thread.display_name(),
        channel_label(thread.integration_id.as_deref()),
        format_relative_time(thread.last_activity(), now),
        preview
    )
}

fn format_message(msg: &Message) -> String {
    let time = Local
        .timestamp_millis_opt(msg.timestamp)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    let who = match msg.sender {
        Sender::User => "you",
        Sender::Agent => "agent",
        Sender::System => "system",
    };
    format!("{time} {who:>6}: {}", msg.content)
}

fn print_help() {
    eprintln!("  /join <thread>     open a thread");
    eprintln!("  /leave             close the open thread");
    eprintln!("  /threads [tab]     list threads (active, bot-driven, archive)");
    eprintln!("  /refresh           re-fetch the thread list");
    eprintln!("  /reconnect         drop and reopen the socket");
    eprintln!("  /status            connection state");
    eprintln!("  /clear             clear the last error");
    eprintln!("  /quit              disconnect and exit");
}

// =============================================================================
// Input parsing
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Send(&'a str),
    Join(&'a str),
    Leave,
    Threads(ThreadTab),
    Refresh,
    Reconnect,
    Status,
    ClearError,
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line);
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match name {
        "join" if !arg.is_empty() => Input::Join(arg),
        "leave" => Input::Leave,
        "threads" if arg.is_empty() => Input::Threads(ThreadTab::Active),
        "threads" => match arg.parse() {
            Ok(tab) => Input::Threads(tab),
            Err(_) => Input::Unknown(line),
        },
        "refresh" => Input::Refresh,
        "reconnect" => Input::Reconnect,
        "status" => Input::Status,
        "clear" => Input::ClearError,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(line),
    }
}
