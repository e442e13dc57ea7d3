//! Postwatch: forum subscription pushes
//!
//! Main binary with subcommands:
//! - `daemon`: push loop, config reloads, credential refresh
//! - `run-once`: a single push cycle
//! - subscription and ledger maintenance commands

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use postwatch_scheduler::{CycleOutcome, Destination, PushMode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod credentials;
mod daemon;
mod onebot;
mod render_service;

use app::App;

#[derive(Parser)]
#[command(name = "postwatch")]
#[command(about = "Push new forum posts by subscribed authors to chats", long_about = None)]
struct Cli {
    /// Directory holding config.toml, push.toml and the ledger
    #[arg(long, global = true, env = "POSTWATCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the push daemon until interrupted
    Daemon,

    /// Run one push cycle now and exit
    RunOnce {
        /// Override the configured mode (immediate or batch)
        #[arg(long)]
        mode: Option<PushMode>,
    },

    /// Subscribe a chat to a forum user
    Subscribe {
        /// Chat, as group:<id> or direct:<id>
        destination: Destination,
        /// Forum username
        source: String,
    },

    /// Remove a subscription
    Unsubscribe {
        destination: Destination,
        source: String,
    },

    /// List a chat's subscriptions
    List { destination: Destination },

    /// Render and send a post without touching the ledger
    TestPush {
        destination: Destination,
        /// Topic id to push; defaults to the newest post of the chat's first subscription
        topic_id: Option<u64>,
    },

    /// Forget delivered posts so they are pushed again
    Reset {
        destination: Destination,
        /// Only forget this user's posts
        source: Option<String>,
    },

    /// Mark a post as delivered without sending it
    MarkDelivered {
        destination: Destination,
        /// Topic id, or a username to mark their newest post
        target: String,
    },

    /// Forget every delivery and retry record
    ClearAll,

    /// Run the credential command now
    RefreshCredentials,
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("postwatch"))
        .ok_or_else(|| miette::miette!("could not determine a data directory, pass --data-dir"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "postwatch=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let app = App::open(&data_dir).await?;

    match cli.command {
        Commands::Daemon => daemon::run(app).await,

        Commands::RunOnce { mode } => {
            let outcome = app.run_cycle(mode).await?;
            daemon::log_outcome(&outcome);
            println!("{}", outcome);
            match outcome {
                CycleOutcome::Aborted(_) => Err(miette::miette!("push cycle aborted")),
                _ => Ok(()),
            }
        }

        Commands::Subscribe { destination, source } => {
            let report = app
                .admin()
                .subscribe(&destination, &source)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("Subscribed {} to {}", destination, source);
            if let Some(newest) = report.newest {
                println!("Latest post marked as delivered: {} ({})", newest.title, newest.link);
            }
            Ok(())
        }

        Commands::Unsubscribe { destination, source } => {
            app.admin()
                .unsubscribe(&destination, &source)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("Unsubscribed {} from {}", destination, source);
            Ok(())
        }

        Commands::List { destination } => {
            let sources = app.admin().list(&destination).await;
            if sources.is_empty() {
                println!("{} has no subscriptions", destination);
            } else {
                println!("Subscriptions for {}:", destination);
                for (i, source) in sources.iter().enumerate() {
                    println!("  {}. {}", i + 1, source);
                }
            }
            Ok(())
        }

        Commands::TestPush { destination, topic_id } => {
            app.admin()
                .test_push(&destination, topic_id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("Test push sent to {}", destination);
            Ok(())
        }

        Commands::Reset { destination, source } => {
            let admin = app.admin();
            match source {
                Some(source) => {
                    let cleared = admin
                        .reset_source(&destination, &source)
                        .await
                        .map_err(|e| miette::miette!("{}", e))?;
                    println!("Reset {} delivered post(s) by {} for {}", cleared, source, destination);
                }
                None => {
                    let counts = admin
                        .reset_destination(&destination)
                        .await
                        .map_err(|e| miette::miette!("{}", e))?;
                    println!(
                        "Reset {} delivered and {} retry record(s) for {}",
                        counts.delivered, counts.retries, destination
                    );
                }
            }
            Ok(())
        }

        Commands::MarkDelivered { destination, target } => {
            let item = app
                .admin()
                .mark_delivered(&destination, &target)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("Marked {} as delivered for {}", item, destination);
            Ok(())
        }

        Commands::ClearAll => {
            let counts = app
                .admin()
                .clear_all()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!(
                "Cleared {} delivered and {} retry record(s)",
                counts.delivered, counts.retries
            );
            Ok(())
        }

        Commands::RefreshCredentials => {
            if app.admin().refresh_credentials().await {
                println!("Credentials refreshed");
                Ok(())
            } else {
                Err(miette::miette!("credential refresh failed"))
            }
        }
    }
}
