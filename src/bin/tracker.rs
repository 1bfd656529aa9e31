use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use poe_level_tracker::CHARACTERS_URL;
use poe_level_tracker::api::{CharacterSource, PoeClient};
use poe_level_tracker::commands::{Command, Tracker};
use poe_level_tracker::config::{AppConfig, CONFIG_PATH};
use poe_level_tracker::detector::DetectOptions;
use poe_level_tracker::notifier::{Notifier, StdoutNotifier, WebhookNotifier};
use poe_level_tracker::rate_limit::RateLimiter;
use poe_level_tracker::scheduler::{Scheduler, SchedulerTiming};
use poe_level_tracker::state::{StateStore, StoreError, TrackedState};
use poe_level_tracker::types::AccountName;

#[derive(Parser)]
#[command(name = "poe-tracker", about = "Path of Exile character level-up tracker")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Run a single check cycle and exit
    #[arg(long, conflicts_with = "check")]
    once: bool,

    /// Fetch one account's characters, print them and exit
    #[arg(long, value_name = "ACCOUNT")]
    check: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = AppConfig::resolve(&args.config)?;
    info!("Loaded config from {}", args.config.display());

    // --- Tracked state ---
    let store = StateStore::new(&config.tracker.data_file);
    let mut state = match store.load() {
        Ok(state) => state,
        Err(StoreError::Unsalvageable(reason)) if !config.tracker.tracked_accounts.is_empty() => {
            warn!("State file is unusable ({reason}), starting from configured accounts");
            store.quarantine()?;
            TrackedState::new()
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to load tracked state from {}", store.path().display())
            });
        }
    };
    let added = config
        .tracker
        .tracked_accounts
        .iter()
        .filter(|account| state.add_account((*account).clone()))
        .count();
    if added > 0 {
        info!("Added {added} account(s) from config");
        store.save(&state)?;
    }
    let state = state.into_shared();

    // --- Clients ---
    let limiter = RateLimiter::from_config(&config.rate_limit);
    let client = PoeClient::new(
        CHARACTERS_URL,
        config.tracker.realm.clone(),
        limiter,
        config.request_timeout(),
    )
    .context("failed to build HTTP client")?;
    let source: Arc<dyn CharacterSource> = Arc::new(client);

    let stored_target = store.load_settings().notification_target;
    let target = stored_target.or_else(|| config.notifier.webhook_url.clone());
    let notifier: Arc<dyn Notifier> = match target {
        Some(url) => {
            info!("Posting level-ups to the configured webhook");
            Arc::new(WebhookNotifier::new(Some(url), config.notifier.username.clone())?)
        }
        None => {
            info!("No webhook configured, printing level-ups to stdout");
            Arc::new(StdoutNotifier)
        }
    };

    let options = DetectOptions::from_config(&config.tracker);
    let tracker = Tracker::new(
        state.clone(),
        store.clone(),
        source.clone(),
        notifier.clone(),
        options.clone(),
        config.check_interval(),
    );

    if let Some(raw) = args.check {
        let account = AccountName::parse(&raw)?;
        let characters = source
            .fetch_characters(&account)
            .await
            .with_context(|| format!("failed to fetch characters for {account}"))?;
        println!("{}", serde_json::to_string_pretty(&characters)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut scheduler = Scheduler::new(
        source,
        notifier,
        store,
        state,
        options,
        SchedulerTiming::from_config(&config),
        cancel.clone(),
    );

    if args.once {
        let report = scheduler.run_cycle().await;
        info!(
            "Checked {}/{} account(s), {} level-up(s), {} failure(s)",
            report.checked, report.accounts, report.transitions, report.failed
        );
        return Ok(());
    }

    tokio::spawn(console(tracker, cancel.clone()));
    tokio::spawn(shutdown_on_signal(cancel));

    info!(
        "Tracking level-ups every {}s. Press Ctrl+C to stop.",
        config.tracker.check_interval_secs
    );
    scheduler.run().await;
    Ok(())
}

/// Read operator commands from stdin until EOF or shutdown.
async fn console(tracker: Tracker, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read command input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let result = match Command::parse(&line) {
            Ok(command) => tracker.execute(command).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(reply) => println!("{reply}"),
            Err(e) => println!("Error: {e}"),
        }
    }
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
    cancel.cancel();
}
