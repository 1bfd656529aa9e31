//! Operator commands: add/remove/list tracked accounts, point notifications
//! somewhere, inspect status.
//!
//! Every mutation goes through the same [`SharedState`] lock the scheduler
//! takes, so a command never interleaves with a detection pass.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::api::{ApiError, CharacterSource};
use crate::detector::{DetectOptions, detect};
use crate::notifier::Notifier;
use crate::state::{SharedState, StateStore, StoreError, StoredSettings};
use crate::types::{AccountName, CharacterRecord, InvalidAccountName};

/// Characters listed in add/test replies.
const PREVIEW_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(String),
    Remove(String),
    List,
    /// `None` clears the target.
    Channel(Option<String>),
    Status,
    Test(String),
    Leagues,
    Help,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    InvalidAccount(#[from] InvalidAccountName),

    #[error("account {0} is already being tracked")]
    AlreadyTracked(AccountName),

    #[error("account {0} is not currently being tracked")]
    NotTracked(AccountName),

    #[error("cannot access account {account}: {source}")]
    Inaccessible {
        account: AccountName,
        #[source]
        source: ApiError,
    },

    #[error("invalid notification target {0:?}")]
    InvalidTarget(String),

    #[error("notifier has no configurable target")]
    TargetUnsupported,

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl Command {
    /// Parse `track add|remove|list|channel|status|test ...`, `leagues` or
    /// `help`, with or without a leading `!`.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim().trim_start_matches('!');
        let mut words = line.split_whitespace();
        let head = words.next().unwrap_or_default().to_ascii_lowercase();
        let action = words.next().map(str::to_ascii_lowercase);
        let rest: Vec<&str> = words.collect();
        let arg = (!rest.is_empty()).then(|| rest.join(" "));

        match (head.as_str(), action.as_deref()) {
            ("leagues", None) => Ok(Command::Leagues),
            ("help", None) | ("track", None) => Ok(Command::Help),
            ("track", Some("list")) => Ok(Command::List),
            ("track", Some("status")) => Ok(Command::Status),
            ("track", Some(verb @ ("add" | "remove" | "test"))) => {
                let account = arg.ok_or_else(|| {
                    CommandError::Usage(format!("usage: track {verb} AccountName#1234"))
                })?;
                Ok(match verb {
                    "add" => Command::Add(account),
                    "remove" => Command::Remove(account),
                    _ => Command::Test(account),
                })
            }
            ("track", Some("channel")) => match arg.as_deref() {
                Some("off") => Ok(Command::Channel(None)),
                Some(url) => Ok(Command::Channel(Some(url.to_string()))),
                None => Err(CommandError::Usage(
                    "usage: track channel <webhook-url>|off".to_string(),
                )),
            },
            _ => Err(CommandError::Usage(format!(
                "unknown command {line:?}, try `track` for help"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerStatus {
    pub accounts: usize,
    pub check_interval: Duration,
    pub monitored_leagues: Vec<String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Added {
        account: AccountName,
        total: usize,
        monitored: Vec<CharacterRecord>,
    },
    Removed(AccountName),
    Accounts(Vec<AccountName>),
    TargetSet(Option<String>),
    Status(TrackerStatus),
    Tested {
        account: AccountName,
        total: usize,
        monitored: Vec<CharacterRecord>,
    },
    Leagues(Vec<String>),
    Help,
}

/// The command surface over the shared tracking state.
pub struct Tracker {
    state: SharedState,
    store: StateStore,
    source: Arc<dyn CharacterSource>,
    notifier: Arc<dyn Notifier>,
    options: DetectOptions,
    check_interval: Duration,
}

impl Tracker {
    pub fn new(
        state: SharedState,
        store: StateStore,
        source: Arc<dyn CharacterSource>,
        notifier: Arc<dyn Notifier>,
        options: DetectOptions,
        check_interval: Duration,
    ) -> Self {
        Self {
            state,
            store,
            source,
            notifier,
            options,
            check_interval,
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Reply, CommandError> {
        match command {
            Command::Add(raw) => self.add(&raw).await,
            Command::Remove(raw) => self.remove(&raw).await,
            Command::List => Ok(Reply::Accounts(self.list().await)),
            Command::Channel(target) => self.set_target(target),
            Command::Status => Ok(Reply::Status(self.status().await)),
            Command::Test(raw) => self.test(&raw).await,
            Command::Leagues => Ok(Reply::Leagues(self.options.monitored_leagues.clone())),
            Command::Help => Ok(Reply::Help),
        }
    }

    /// Start tracking an account after checking it is publicly readable.
    /// Its current characters become the silent baseline.
    pub async fn add(&self, raw: &str) -> Result<Reply, CommandError> {
        let account = AccountName::parse(raw)?;
        if self.state.lock().await.is_tracked(&account) {
            return Err(CommandError::AlreadyTracked(account));
        }

        let characters = self
            .source
            .fetch_characters(&account)
            .await
            .map_err(|source| CommandError::Inaccessible {
                account: account.clone(),
                source,
            })?;

        // The shared state only changes once the new document is on disk.
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        if !next.add_account(account.clone()) {
            return Err(CommandError::AlreadyTracked(account));
        }
        let baseline = DetectOptions {
            announce_first_sight: false,
            ..self.options.clone()
        };
        detect(&account, &characters, &mut next, &baseline);
        self.store.save(&next)?;
        *state = next;
        drop(state);

        info!(%account, "Now tracking account");
        Ok(Reply::Added {
            total: characters.len(),
            monitored: self.preview(&characters),
            account,
        })
    }

    pub async fn remove(&self, raw: &str) -> Result<Reply, CommandError> {
        let account = AccountName::parse(raw)?;
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        if !next.remove_account(&account) {
            return Err(CommandError::NotTracked(account));
        }
        self.store.save(&next)?;
        *state = next;
        info!(%account, "Stopped tracking account");
        Ok(Reply::Removed(account))
    }

    pub async fn list(&self) -> Vec<AccountName> {
        self.state.lock().await.accounts()
    }

    pub fn set_target(&self, target: Option<String>) -> Result<Reply, CommandError> {
        if let Some(url) = &target {
            url::Url::parse(url).map_err(|_| CommandError::InvalidTarget(url.clone()))?;
        }
        let previous = self.notifier.target();
        if !self.notifier.set_target(target.clone()) {
            return Err(CommandError::TargetUnsupported);
        }
        let saved = self.store.save_settings(&StoredSettings {
            notification_target: target.clone(),
        });
        if let Err(e) = saved {
            self.notifier.set_target(previous);
            return Err(e.into());
        }
        info!("Notification target {}", if target.is_some() { "set" } else { "cleared" });
        Ok(Reply::TargetSet(target))
    }

    pub async fn status(&self) -> TrackerStatus {
        TrackerStatus {
            accounts: self.state.lock().await.len(),
            check_interval: self.check_interval,
            monitored_leagues: self.options.monitored_leagues.clone(),
            target: self.notifier.target(),
        }
    }

    /// Fetch an account without tracking it.
    pub async fn test(&self, raw: &str) -> Result<Reply, CommandError> {
        let account = AccountName::parse(raw)?;
        let characters = self
            .source
            .fetch_characters(&account)
            .await
            .map_err(|source| CommandError::Inaccessible {
                account: account.clone(),
                source,
            })?;
        Ok(Reply::Tested {
            total: characters.len(),
            monitored: self.preview(&characters),
            account,
        })
    }

    fn preview(&self, characters: &[CharacterRecord]) -> Vec<CharacterRecord> {
        characters
            .iter()
            .filter(|c| self.options.is_monitored(&c.league))
            .cloned()
            .collect()
    }
}

fn leagues_text(leagues: &[String]) -> String {
    if leagues.is_empty() {
        "All leagues".to_string()
    } else {
        leagues.join(", ")
    }
}

fn write_characters(f: &mut fmt::Formatter<'_>, characters: &[CharacterRecord]) -> fmt::Result {
    for c in characters.iter().take(PREVIEW_LEN) {
        writeln!(f, "  • {} (Level {}, {})", c.name, c.level, c.league)?;
    }
    if characters.len() > PREVIEW_LEN {
        writeln!(f, "  ... and {} more", characters.len() - PREVIEW_LEN)?;
    }
    Ok(())
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Added {
                account,
                total,
                monitored,
            } => {
                writeln!(f, "Now tracking account: {account}")?;
                writeln!(f, "{total} characters, {} in monitored leagues", monitored.len())?;
                write_characters(f, monitored)
            }
            Reply::Removed(account) => writeln!(f, "Stopped tracking account: {account}"),
            Reply::Accounts(accounts) if accounts.is_empty() => writeln!(
                f,
                "No accounts are being tracked. Use `track add AccountName#1234` to start."
            ),
            Reply::Accounts(accounts) => {
                writeln!(f, "Tracking {} accounts:", accounts.len())?;
                for a in accounts {
                    writeln!(f, "  • {a}")?;
                }
                Ok(())
            }
            Reply::TargetSet(Some(_)) => writeln!(f, "Level-up notifications target updated"),
            Reply::TargetSet(None) => writeln!(f, "Level-up notifications target cleared"),
            Reply::Status(s) => {
                writeln!(f, "Tracked accounts: {}", s.accounts)?;
                writeln!(f, "Check interval: {} seconds", s.check_interval.as_secs())?;
                writeln!(
                    f,
                    "Notification target: {}",
                    if s.target.is_some() { "set" } else { "not set" }
                )?;
                writeln!(f, "Monitored leagues: {}", leagues_text(&s.monitored_leagues))
            }
            Reply::Tested {
                account,
                total,
                monitored,
            } => {
                writeln!(f, "Account {account} is accessible")?;
                writeln!(f, "{total} characters, {} in monitored leagues", monitored.len())?;
                write_characters(f, monitored)
            }
            Reply::Leagues(leagues) => writeln!(f, "Monitoring: {}", leagues_text(leagues)),
            Reply::Help => f.write_str(
                "track add AccountName#1234     - add account to tracking\n\
                 track remove AccountName#1234  - remove account from tracking\n\
                 track list                     - list tracked accounts\n\
                 track channel <url>|off        - set or clear the webhook target\n\
                 track status                   - show tracking status\n\
                 track test AccountName#1234    - check an account is accessible\n\
                 leagues                        - show monitored leagues\n",
            ),
        }
    }
}
