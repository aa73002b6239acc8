// wpush — watch an Autopush server from the command line
//
// Subscribes with a VAPID public key and prints every decrypted
// notification until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use wpush_core::{
    Event, EventKind, MemoryStorage, PushManager, PushManagerOptions, SledStorage, Storage,
    StorageBackend, SubscriptionOptions, DEFAULT_AUTOPUSH_URL,
};

#[derive(Parser)]
#[command(name = "wpush")]
#[command(about = "wpush — Autopush WebSocket client", long_about = None)]
#[command(version)]
struct Cli {
    /// Storage directory for session state; omit for an in-memory session
    #[arg(short, long, global = true)]
    storage: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe, and print notifications until Ctrl-C
    Watch {
        /// The sender's VAPID public key (base64url, uncompressed point)
        #[arg(short, long)]
        vapid_key: String,
        /// Autopush server URL
        #[arg(short, long, default_value = DEFAULT_AUTOPUSH_URL)]
        url: String,
        /// Ack batching interval in milliseconds
        #[arg(long, default_value = "30000")]
        ack_interval_ms: u64,
    },
    /// Print the persisted session state (UAID and channels)
    Status,
}

fn open_backend(path: Option<&str>) -> Result<Arc<dyn StorageBackend>> {
    Ok(match path {
        Some(path) => Arc::new(
            SledStorage::open(path)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("failed to open storage at {path}"))?,
        ),
        None => Arc::new(MemoryStorage::new()),
    })
}

async fn watch(
    backend: Arc<dyn StorageBackend>,
    url: String,
    vapid_key: String,
    ack_interval_ms: u64,
) -> Result<()> {
    let options = PushManagerOptions {
        autopush_url: url.clone(),
        ack_interval: Duration::from_millis(ack_interval_ms),
        ..PushManagerOptions::default()
    };

    println!("{} {}", "connecting to".dimmed(), url.cyan());
    let manager = PushManager::create(backend, options)?;
    manager.ready().await;
    println!(
        "{} {}",
        "session ready, uaid".dimmed(),
        manager.uaid().unwrap_or_default().green()
    );

    let subscription = manager
        .subscribe(SubscriptionOptions {
            user_visible_only: true,
            application_server_key: vapid_key,
        })
        .await
        .context("subscribe failed")?;

    println!("{}", "subscription:".bold());
    println!("{}", serde_json::to_string_pretty(&subscription.to_json())?);

    subscription.add_listener(EventKind::Notification, |event| {
        if let Event::Notification(payload) = event {
            match payload {
                Some(text) => println!("{} {}", "notification:".bold().green(), text),
                None => println!("{}", "notification: (no payload)".dimmed()),
            }
        }
    });
    subscription.add_listener(EventKind::PushSubscriptionChange, |event| {
        if let Event::PushSubscriptionChange(value) = event {
            println!("{} {}", "subscription changed:".bold().yellow(), value);
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("{}", "shutting down".dimmed());
    manager.destroy().await;
    Ok(())
}

fn status(backend: Arc<dyn StorageBackend>) -> Result<()> {
    let storage = Storage::new(backend);
    let uaid: Option<String> = storage.read("uaid")?;
    let channels: Vec<String> = storage.read("channelIDs")?.unwrap_or_default();

    match uaid {
        Some(uaid) => println!("{} {}", "uaid:".bold(), uaid),
        None => println!("{}", "no session persisted".dimmed()),
    }
    println!("{} {}", "channels:".bold(), channels.len());
    for channel_id in channels {
        let endpoint: Option<String> = storage.extend(&channel_id).read("endpoint")?;
        println!(
            "  {} {}",
            channel_id,
            endpoint.unwrap_or_else(|| "(endpoint missing)".to_string()).dimmed()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let backend = open_backend(cli.storage.as_deref())?;

    match cli.command {
        Commands::Watch {
            vapid_key,
            url,
            ack_interval_ms,
        } => watch(backend, url, vapid_key, ack_interval_ms).await,
        Commands::Status => status(backend),
    }
}
