//! Durachat CLI - interactive chat client over the local state engine.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use durachat::cache::fetcher::HttpFetcher;
use durachat::cache::ResourceCache;
use durachat::client::HttpChatApi;
use durachat::config::Config;
use durachat::notify::{self, Notification, RenderFeed};
use durachat::orchestrator::Orchestrator;
use durachat::store::FileHistoryStore;

// ============================================================================
// CLI Types
// ============================================================================

/// Durachat - offline-first assistant chat client
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// User identity owning the local history
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Resume an existing session instead of creating one
        #[arg(short, long)]
        session: Option<String>,

        /// Path to configuration file
        #[arg(short, long, default_value = "durachat.yaml")]
        config: String,
    },

    /// List or search stored sessions
    Sessions {
        /// User identity owning the local history
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Substring to search titles and previews for
        #[arg(short, long)]
        query: Option<String>,

        /// Path to configuration file
        #[arg(short, long, default_value = "durachat.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            user,
            session,
            config,
        } => chat(&user, session, &config).await,
        Commands::Sessions {
            user,
            query,
            config,
        } => sessions(&user, query.as_deref(), &config).await,
    }
}

// ============================================================================
// Wiring
// ============================================================================

async fn build_orchestrator(
    config: &Config,
    user: &str,
) -> Result<(Arc<Orchestrator>, RenderFeed)> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.request_timeout_seconds))
        .build()
        .context("failed to build http client")?;

    let cache = Arc::new(ResourceCache::new(
        (&config.cache).into(),
        Arc::new(HttpFetcher::new(http.clone())),
        origin_of(&config.api.base_url),
    ));
    // Offline starts are fine: install failures only cost the static tier.
    if let Err(e) = cache.install().await {
        warn!(error = %e, "static cache install failed, continuing without it");
    }
    cache.activate().await;

    let api = Arc::new(HttpChatApi::new(http, cache, config.api.base_url.clone()));
    let store = Arc::new(
        FileHistoryStore::open(&config.storage.data_dir)
            .await
            .context("failed to open history store")?,
    );

    let (sink, feed) = notify::channel();
    Ok((Arc::new(Orchestrator::new(store, api, sink, user)), feed))
}

/// Scheme + authority of the API base URL (static assets live at the origin).
fn origin_of(base_url: &str) -> String {
    let Some(scheme_end) = base_url.find("://") else {
        return base_url.to_string();
    };
    match base_url[scheme_end + 3..].find('/') {
        Some(path_start) => base_url[..scheme_end + 3 + path_start].to_string(),
        None => base_url.to_string(),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn sessions(user: &str, query: Option<&str>, config_path: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    let (orchestrator, _feed) = build_orchestrator(&config, user).await?;

    let sessions = match query {
        Some(query) => orchestrator.search(query).await?,
        None => orchestrator.sessions(50).await?,
    };

    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {}  [{} messages]  {}",
            session.updated_at.format("%Y-%m-%d %H:%M"),
            session.id,
            session.message_count,
            session.title
        );
    }
    Ok(())
}

async fn chat(user: &str, session: Option<String>, config_path: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    let (orchestrator, mut feed) = build_orchestrator(&config, user).await?;

    let mut session_id = match session {
        Some(id) => {
            if let Err(e) = orchestrator.sync_history(&id).await {
                warn!(error = %e, "history sync failed, using local copy");
            }
            for message in orchestrator.messages(&id).await? {
                println!("[{}] {}", message.role, message.content);
            }
            id
        }
        None => orchestrator.create_session().await?.id,
    };
    println!("session: {session_id} (/exit to quit)");

    // Render sink: deltas inline, everything else on its own line.
    tokio::spawn(async move {
        while let Some(notification) = feed.recv().await {
            match notification {
                Notification::DeltaApplied { content, .. } => {
                    print!("{content}");
                    let _ = std::io::stdout().flush();
                }
                Notification::ToolEvent { invocation, .. } => {
                    println!("\n🔧 {}", invocation.tool_name);
                }
                Notification::Error { message, .. } => {
                    eprintln!("\nerror: {message}");
                }
                Notification::MessageAppended { .. } | Notification::SessionListChanged { .. } => {}
            }
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(input) = lines.next_line().await? else {
            println!();
            break;
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/exit" | "/quit" => break,
            "/new" => {
                session_id = orchestrator.create_session().await?.id;
                println!("session: {session_id}");
            }
            "/list" => {
                for session in orchestrator.sessions(20).await? {
                    println!("{}  {}", session.id, session.title);
                }
            }
            "/stats" => {
                let stats = orchestrator.session_stats(&session_id).await?;
                println!(
                    "{} messages ({} user / {} assistant), avg length {}",
                    stats.total_messages,
                    stats.user_messages,
                    stats.assistant_messages,
                    stats.avg_message_length
                );
            }
            _ if input.starts_with("/search ") => {
                for session in orchestrator.search(input.trim_start_matches("/search ")).await? {
                    println!("{}  {}", session.id, session.title);
                }
            }
            _ if input.starts_with("/delete ") => {
                let id = input.trim_start_matches("/delete ").trim();
                orchestrator.delete_session(id).await?;
                println!("deleted {id}");
            }
            _ => {
                if let Err(e) = orchestrator.send(&session_id, input).await {
                    eprintln!("send failed: {e}");
                }
                println!();
            }
        }
    }

    Ok(())
}
