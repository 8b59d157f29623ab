// Copyright (c) 2024 The Botho Foundation

//! TON Donation Watcher CLI
//!
//! Runs the donation watch loops and provides admin commands for seeding and
//! inspecting the donation store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ton_donate_core::{DonateConfig, DonationIntent, Streamer, Widget};
use ton_donate_service::{engine::load_states, Database, DonationLedger, DonationService};

#[derive(Parser)]
#[command(name = "ton-donate")]
#[command(about = "Watches TON addresses for donations and notifies overlay widgets")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "TON_DONATE_CONFIG", default_value = "ton-donate.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured addresses
    Run {
        /// Run one cycle per address and exit
        #[arg(long)]
        once: bool,
    },

    /// Show watch progress per address
    Status,

    /// Validate configuration
    ValidateConfig,

    /// Manage streamers
    #[command(subcommand)]
    Streamer(StreamerCommand),

    /// Manage donation intents
    #[command(subcommand)]
    Intent(IntentCommand),

    /// List a streamer's donations
    Donations {
        #[arg(long)]
        streamer: String,
    },

    /// Manage widgets
    #[command(subcommand)]
    Widget(WidgetCommand),
}

#[derive(Subcommand)]
enum StreamerCommand {
    /// Register a streamer wallet
    Add {
        #[arg(long)]
        wallet: String,

        /// Streamer id (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        cognito_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum IntentCommand {
    /// Record a donation intent before payment
    Submit {
        #[arg(long)]
        signature: String,

        #[arg(long)]
        streamer: String,

        #[arg(long)]
        wallet: String,

        /// Declared amount in nanotons
        #[arg(long)]
        amount: u64,

        #[arg(long, default_value = "")]
        nickname: String,

        #[arg(long, default_value = "")]
        message: String,
    },
}

#[derive(Subcommand)]
enum WidgetCommand {
    /// Create a widget
    Add {
        #[arg(long)]
        streamer: String,

        #[arg(long = "type", default_value = "goal")]
        widget_type: String,

        /// Goal in nanotons
        #[arg(long)]
        goal: u64,
    },

    /// List a streamer's widgets with the current total
    List {
        #[arg(long)]
        streamer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = DonateConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    match cli.command {
        Commands::Run { once } => run_watcher(config, once).await,
        Commands::Status => show_status(&config),
        Commands::ValidateConfig => validate_config(&config),
        Commands::Streamer(cmd) => streamer_command(&open_db(&config)?, cmd),
        Commands::Intent(cmd) => intent_command(&open_db(&config)?, cmd),
        Commands::Donations { streamer } => list_donations(&open_db(&config)?, &streamer),
        Commands::Widget(cmd) => widget_command(&open_db(&config)?, cmd),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn open_db(config: &DonateConfig) -> Result<Database> {
    tracing::debug!("Opening database at {}", config.storage.db_path);
    let db = Database::open(&config.storage.db_path)?;
    db.migrate()?;
    Ok(db)
}

async fn run_watcher(config: DonateConfig, once: bool) -> Result<()> {
    config.validate()?;

    let db = open_db(&config)?;
    tracing::info!("Donation watcher configuration:");
    tracing::info!("  Ledger API: {}", config.ledger.api_url);
    tracing::info!("  Addresses: {:?}", config.ledger.addresses);

    let service = DonationService::from_config(config, Arc::new(db))?;

    if once {
        for (address, result) in service.run_once().await? {
            match result {
                Ok(report) => tracing::info!(
                    "{}: {} transactions, {} notified, {} pending",
                    address,
                    report.fetched,
                    report.notified,
                    report.notification_failures + report.storage_errors
                ),
                Err(e) => tracing::error!("{}: {}", address, e),
            }
        }
        tracing::info!("Single cycle complete, exiting");
        return Ok(());
    }

    service.run().await
}

fn show_status(config: &DonateConfig) -> Result<()> {
    if config.ledger.addresses.is_empty() {
        println!("No watched addresses configured.");
        return Ok(());
    }
    for state in load_states(config)? {
        println!("{}", state.summary());
    }
    Ok(())
}

fn validate_config(config: &DonateConfig) -> Result<()> {
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    println!("Configuration is valid.");
    println!("  Ledger API: {}", config.ledger.api_url);
    println!("  Addresses: {:?}", config.ledger.addresses);
    println!("  Webhook: {}", config.webhook.url);
    println!(
        "  Poll interval: {}s, lookback {}, high-water mark {:?}",
        config.watch.poll_interval_secs, config.watch.lookback, config.watch.high_water_mark
    );
    println!("  Database: {}", config.storage.db_path);
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn streamer_command(db: &Database, cmd: StreamerCommand) -> Result<()> {
    match cmd {
        StreamerCommand::Add {
            wallet,
            id,
            cognito_id,
        } => {
            let mut streamer = Streamer::new(wallet);
            if let Some(id) = id {
                streamer.streamer_id = id;
            }
            streamer.cognito_id = cognito_id;

            db.register_streamer(&streamer)?;
            println!("{}", serde_json::to_string_pretty(&streamer)?);
        }
    }
    Ok(())
}

fn intent_command(db: &Database, cmd: IntentCommand) -> Result<()> {
    match cmd {
        IntentCommand::Submit {
            signature,
            streamer,
            wallet,
            amount,
            nickname,
            message,
        } => {
            let intent = DonationIntent::new(signature, streamer, wallet, amount)
                .with_nickname(nickname)
                .with_message(message);

            db.create_intent(&intent)?;
            println!("{}", serde_json::to_string_pretty(&intent)?);
        }
    }
    Ok(())
}

fn list_donations(db: &Database, streamer_id: &str) -> Result<()> {
    let donations = db.list_donations(streamer_id)?;
    println!("{}", serde_json::to_string_pretty(&donations)?);
    Ok(())
}

fn widget_command(db: &Database, cmd: WidgetCommand) -> Result<()> {
    match cmd {
        WidgetCommand::Add {
            streamer,
            widget_type,
            goal,
        } => {
            let widget = Widget::new(streamer, widget_type, goal);
            db.create_widget(&widget)?;
            println!("{}", serde_json::to_string_pretty(&widget)?);
        }
        WidgetCommand::List { streamer } => {
            let total = db.widget_total(&streamer)?;
            for widget in db.list_widgets(&streamer)? {
                println!(
                    "{} {} active={} {}/{} ({:.2}%)",
                    widget.widget_id,
                    widget.widget_type,
                    widget.is_active,
                    total,
                    widget.amount_goal,
                    widget.progress_bps(total) as f64 / 100.0
                );
            }
        }
    }
    Ok(())
}
