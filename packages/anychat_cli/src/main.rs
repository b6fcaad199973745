use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

use anychat_relay::ThreadTab;

mod cli;
mod config;

use crate::config::{AppDirs, FileConfig, load_config};

#[derive(Parser)]
#[command(name = "anychat")]
#[command(about = "Live-chat desk for Anychat conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.anychat)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log into the chat platform and the local backend
    Login(LoginArgs),

    /// Create a local account
    Register(RegisterArgs),

    /// Forget stored credentials
    Logout,

    /// Show session and platform session state
    Status,

    /// List conversations
    Threads(ThreadsArgs),

    /// Open the live chat
    Chat(ChatArgs),

    /// Read or change config.toml
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Parser)]
struct LoginArgs {
    /// Account email (prompted for when omitted)
    #[arg(short, long)]
    email: Option<String>,

    /// Remember the email for the next login
    #[arg(long)]
    remember: bool,
}

#[derive(Parser)]
struct RegisterArgs {
    #[arg(long)]
    first_name: String,

    #[arg(long)]
    last_name: String,

    #[arg(short, long)]
    email: String,

    /// Accept the Terms & Conditions
    #[arg(long)]
    agree: bool,
}

#[derive(Parser)]
struct ThreadsArgs {
    /// active, bot-driven or archive
    #[arg(short, long, default_value = "active")]
    tab: ThreadTab,

    /// Print raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ChatArgs {
    /// Thread to open right away (defaults to the last one opened)
    #[arg(short, long)]
    thread: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Set a key, e.g. `relay.reconnect_delay_secs 3`
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&dirs.data_dir)
        .extract()
        .context("Failed to load configuration")?;

    init_tracing(cli.debug, file_config.log.level.as_deref());

    match cli.command {
        Commands::Login(args) => {
            cli::auth::login_command(&dirs, &file_config, args.email, args.remember).await
        }
        Commands::Register(args) => {
            let names = cli::auth::RegisterNames {
                first_name: args.first_name,
                last_name: args.last_name,
                email: args.email,
                agree: args.agree,
            };
            cli::auth::register_command(&dirs, &file_config, names).await
        }
        Commands::Logout => cli::auth::logout_command(&dirs).await,
        Commands::Status => cli::auth::status_command(&dirs, &file_config).await,
        Commands::Threads(args) => {
            cli::chat::threads_command(&dirs, &file_config, args.tab, args.json).await
        }
        Commands::Chat(args) => cli::chat::chat_command(&dirs, &file_config, args.thread).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => cli::settings::show_command(&dirs, &file_config),
            ConfigAction::Set { key, value } => cli::settings::set_command(&dirs, &key, &value),
        },
    }
}

/// Logs go to stderr so they never interleave with command output.
fn init_tracing(debug: bool, configured: Option<&str>) {
    let default_directive = if debug {
        "anychat_cli=debug,anychat_relay=debug,info"
    } else {
        configured.unwrap_or("anychat_cli=info,anychat_relay=info,warn")
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
