use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use chat_harness::api::{ChatApi, WorkspaceClient};
use chat_harness::capture;
use chat_harness::config::{load_config, Config};
use chat_harness::db;
use chat_harness::importer::HistoryImporter;
use chat_harness::limiter::RateLimiter;
use chat_harness::migrate::run_migrations;
use chat_harness::models::Message;
use chat_harness::notify::Notifier;
use chat_harness::query::QueryEngine;
use chat_harness::server::{self, AppState};
use chat_harness::stop::StopFlag;
use chat_harness::store::{SearchFilters, Store};

#[derive(Parser)]
#[command(name = "chx", version, about = "Local-first team chat archive and search")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, default_value = "chx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema
    Init,
    /// Run one full history import
    Import,
    /// Capture live traffic until interrupted
    Watch,
    /// Full-text search over the archive
    Search {
        query: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        author: Option<String>,
        /// Lower timestamp bound (source format)
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Search and expand each hit into its surrounding conversation
    Ask {
        query: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        since: Option<String>,
    },
    /// Latest messages, newest first
    Recent {
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// One thread in full
    Thread { channel: String, ts: String },
    /// Channel traffic around one message
    Context {
        channel: String,
        ts: String,
        #[arg(long)]
        radius: Option<i64>,
    },
    /// Serve the HTTP query API (with live capture alongside)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => init(&config).await,
        Commands::Import => import(&config).await,
        Commands::Watch => watch(&config).await,
        Commands::Search {
            query,
            channel,
            author,
            since,
            limit,
        } => {
            let engine = open_query(&config).await?;
            let filters = SearchFilters {
                channel_id: channel,
                author_id: author,
                since_ts: since,
            };
            let hits = engine.search(&query, &filters, limit).await?;
            if hits.is_empty() {
                println!("No matches.");
                return Ok(());
            }
            for hit in hits {
                println!(
                    "[{}] #{} {} ({:.2})",
                    format_ts(&hit.ts),
                    hit.channel_name,
                    hit.author_name,
                    hit.score
                );
                println!("  {}", hit.snippet);
            }
            Ok(())
        }
        Commands::Ask {
            query,
            channel,
            author,
            since,
        } => {
            let engine = open_query(&config).await?;
            let filters = SearchFilters {
                channel_id: channel,
                author_id: author,
                since_ts: since,
            };
            let blocks = engine.ask(&query, &filters).await?;
            if blocks.is_empty() {
                println!("No matches.");
                return Ok(());
            }
            for block in blocks {
                let kind = if block.is_thread { "thread" } else { "window" };
                println!(
                    "--- {} in {} around {} ---",
                    kind,
                    block.channel_id,
                    format_ts(&block.anchor_ts)
                );
                for message in &block.messages {
                    print_message(message);
                }
            }
            Ok(())
        }
        Commands::Recent { channel, limit } => {
            let engine = open_query(&config).await?;
            for message in engine.recent(channel.as_deref(), limit).await? {
                print_message(&message);
            }
            Ok(())
        }
        Commands::Thread { channel, ts } => {
            let engine = open_query(&config).await?;
            for message in engine.thread(&channel, &ts).await? {
                print_message(&message);
            }
            Ok(())
        }
        Commands::Context {
            channel,
            ts,
            radius,
        } => {
            let engine = open_query(&config).await?;
            for message in engine.context(&channel, &ts, radius).await? {
                print_message(&message);
            }
            Ok(())
        }
        Commands::Serve => serve(&config).await,
    }
}

async fn init(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    run_migrations(&pool).await?;
    println!("Database ready at {}", config.db.path.display());
    Ok(())
}

async fn import(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let api = make_client(config)?;
    let limiter = Arc::new(RateLimiter::new(config.limits.request_interval()));
    let stop = stop_on_ctrl_c();

    let importer = HistoryImporter::new(api, store.clone(), limiter, config.limits.clone(), stop);
    let report = importer.run().await?;

    println!(
        "Imported {} messages across {} channels ({} backfilled, {} incremental, {} abandoned)",
        report.messages_stored,
        report.channels_seen,
        report.channels_backfilled,
        report.channels_incremental,
        report.channels_abandoned
    );
    println!("{} users, {} messages total in store", report.users_seen, store.message_count().await?);
    store.close().await;
    Ok(())
}

async fn watch(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let api = make_client(config)?;
    let limiter = Arc::new(RateLimiter::new(config.limits.request_interval()));
    let notifier = Notifier::new();
    let stop = stop_on_ctrl_c();

    println!("Capturing live traffic (ctrl-c to stop)...");
    capture::run(api, store.clone(), limiter, notifier, config, stop).await?;
    store.close().await;
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let api = make_client(config)?;
    let limiter = Arc::new(RateLimiter::new(config.limits.request_interval()));
    let notifier = Notifier::new();
    let stop = stop_on_ctrl_c();

    let engine = QueryEngine::new(
        store.clone(),
        config.retrieval.final_limit,
        config.retrieval.context_window,
    );
    let state = Arc::new(AppState {
        query: engine,
        notifier: notifier.clone(),
    });

    let capture = capture::run(api, store.clone(), limiter, notifier, config, stop);
    let http = server::serve(state, &config.server.bind);

    tokio::select! {
        result = capture => result?,
        result = http => result?,
    }
    store.close().await;
    Ok(())
}

async fn open_store(config: &Config) -> Result<Store> {
    let pool = db::connect(&config.db.path).await?;
    run_migrations(&pool).await?;
    Ok(Store::new(pool))
}

async fn open_query(config: &Config) -> Result<QueryEngine> {
    let store = open_store(config).await?;
    Ok(QueryEngine::new(
        store,
        config.retrieval.final_limit,
        config.retrieval.context_window,
    ))
}

fn make_client(config: &Config) -> Result<Arc<dyn ChatApi>> {
    Ok(Arc::new(WorkspaceClient::new(
        &config.source.api_base,
        &config.source.token,
        config.source.app_token.as_deref(),
    )?))
}

fn stop_on_ctrl_c() -> StopFlag {
    let stop = StopFlag::new();
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping after in-flight work completes...");
            flag.stop();
        }
    });
    stop
}

fn print_message(message: &Message) {
    let author = message.user_id.as_deref().unwrap_or("unknown");
    let marker = if message.thread_ts.is_some() && !message.is_thread_parent() {
        "  ↳ "
    } else {
        ""
    };
    println!(
        "[{}] {}{}: {}",
        format_ts(&message.ts),
        marker,
        author,
        message.text
    );
}

/// Render a source timestamp as local date-time for terminal output.
fn format_ts(ts: &str) -> String {
    let secs = ts
        .split('.')
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);
    match chrono::DateTime::from_timestamp(secs, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => ts.to_string(),
    }
}
