//! CLI for linkbus
//!
//! Subcommands:
//! - `run`: start the pipeline against the in-process broker and log every message
//! - `dead-letters`: print quarantined messages
//! - `retries`: print messages waiting for a retry

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use linkbus::broker::InMemoryBroker;
use linkbus::config::{Settings, load_config_from};
use linkbus::persistence::Store;
use linkbus::pipeline::{Message, Pipeline};
use linkbus::utils::error::Result;
use linkbus::utils::logging;

#[derive(Parser)]
#[command(name = "linkbus", version)]
struct Cli {
    /// Extra configuration file layered over `config/default`
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the pipeline and log every delivered message
    Run,
    /// List quarantined messages as JSON lines
    DeadLetters,
    /// List pending retries as JSON lines
    Retries,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config_from(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };
    logging::init(&settings.logging.level);

    let outcome = match cli.command {
        Command::Run => run(settings).await,
        Command::DeadLetters => list_dead_letters(&settings),
        Command::Retries => list_retries(&settings),
    };
    if let Err(e) = outcome {
        error!("linkbus failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<()> {
    let store = Store::open(&settings.storage.path)?;
    let broker = Arc::new(InMemoryBroker::default());
    let shutdown = CancellationToken::new();

    let Pipeline {
        mut messages,
        publisher: _publisher,
        handle,
    } = Pipeline::start(&settings, broker, store, shutdown.clone()).await?;

    let consumer = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            if let Err(e) = consume(message).await {
                warn!("Could not finish message: {}", e);
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            handle.shutdown();
        }
        _ = shutdown.cancelled() => {}
    }

    let result = handle.wait().await;
    if let Err(e) = consumer.await {
        error!("Consumer task failed: {}", e);
    }
    result
}

async fn consume(message: Message) -> Result<()> {
    match message.bind::<serde_json::Value>() {
        Ok(payload) => {
            info!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                redelivery = message.redelivery_count(),
                %payload,
                "message received"
            );
            message.ack().await
        }
        Err(e) => {
            warn!(topic = message.topic(), offset = message.offset(), error = %e, "undecodable payload");
            message.quarantine().await
        }
    }
}

fn list_dead_letters(settings: &Settings) -> Result<()> {
    let store = Store::open(&settings.storage.path)?;
    let rows = store.dead_letter_table(&settings.dead_letter.table)?.list()?;
    print_rows(&rows)
}

fn list_retries(settings: &Settings) -> Result<()> {
    let store = Store::open(&settings.storage.path)?;
    let rows = store.retry_table(&settings.retrier.table)?.list()?;
    print_rows(&rows)
}

fn print_rows<T: Serialize>(rows: &[T]) -> Result<()> {
    for row in rows {
        let line = serde_json::to_string(row).map_err(linkbus::utils::error::StoreError::from)?;
        println!("{line}");
    }
    Ok(())
}
