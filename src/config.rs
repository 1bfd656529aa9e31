use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::AccountName;

/// Default config file path.
pub const CONFIG_PATH: &str = "tracker.toml";

/// Floor for the interval between polling cycles.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 60;

/// Top-level application config deserialized from `tracker.toml`.
///
/// Every section is optional; a missing file yields the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// What to poll and how often.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Seconds between polling cycles (floored at 60).
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Fixed pause between two accounts of the same cycle.
    #[serde(default = "default_inter_account_delay")]
    pub inter_account_delay_secs: u64,
    /// Leagues whose characters are checked for level-ups. Empty means all.
    #[serde(default = "default_monitored_leagues")]
    pub monitored_leagues: Vec<String>,
    /// Accounts merged into the tracked set at startup.
    #[serde(default)]
    pub tracked_accounts: Vec<AccountName>,
    /// JSON document holding the last known levels.
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    /// Emit a notification the first time a character/league pair is seen.
    #[serde(default)]
    pub announce_first_sight: bool,
    /// Also record levels for characters outside the monitored leagues.
    #[serde(default)]
    pub retain_all_leagues: bool,
    /// Realm query parameter (pc, xbox, sony).
    #[serde(default = "default_realm")]
    pub realm: String,
}

/// Client-side request pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding windows enforced until the server advertises its own policy.
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowConfig>,
    /// Minimum spacing between two requests, in milliseconds.
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
    /// Base wait after a 429 without a usable `Retry-After`.
    #[serde(default = "default_backoff_secs")]
    pub default_backoff_secs: u64,
    /// Ceiling for any backoff.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Pause before retrying a request that failed on the network.
    #[serde(default = "default_transient_retry_delay")]
    pub transient_retry_delay_secs: u64,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub secs: u64,
    pub max_requests: u32,
}

/// Where level-ups are delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Discord-compatible webhook URL. Without one, events go to stdout.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_username")]
    pub username: String,
}

fn default_check_interval() -> u64 {
    300
}

fn default_inter_account_delay() -> u64 {
    2
}

fn default_monitored_leagues() -> Vec<String> {
    vec!["Standard".to_string(), "Hardcore".to_string()]
}

fn default_data_file() -> PathBuf {
    PathBuf::from("tracked_characters_data.json")
}

fn default_realm() -> String {
    "pc".to_string()
}

fn default_windows() -> Vec<WindowConfig> {
    vec![
        WindowConfig { secs: 60, max_requests: 15 },
        WindowConfig { secs: 1800, max_requests: 90 },
        WindowConfig { secs: 7200, max_requests: 180 },
    ]
}

fn default_min_spacing_ms() -> u64 {
    1000
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    900
}

fn default_transient_retry_delay() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_username() -> String {
    "PoE Character Tracker".to_string()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            inter_account_delay_secs: default_inter_account_delay(),
            monitored_leagues: default_monitored_leagues(),
            tracked_accounts: Vec::new(),
            data_file: default_data_file(),
            announce_first_sight: false,
            retain_all_leagues: false,
            realm: default_realm(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            min_spacing_ms: default_min_spacing_ms(),
            default_backoff_secs: default_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            transient_retry_delay_secs: default_transient_retry_delay(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            username: default_username(),
        }
    }
}

impl AppConfig {
    /// Load config from the given TOML file path, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load the file, apply environment overrides, then validate.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CHECK_INTERVAL`, `MONITORED_LEAGUES`, `TRACKED_ACCOUNTS`,
    /// `DATA_FILE`, `DISCORD_WEBHOOK_URL` and `ANNOUNCE_FIRST_SIGHT`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup("CHECK_INTERVAL") {
            self.tracker.check_interval_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("CHECK_INTERVAL must be an integer, got {raw:?}"))?;
        }
        if let Some(raw) = lookup("MONITORED_LEAGUES") {
            self.tracker.monitored_leagues = split_list(&raw);
        }
        if let Some(raw) = lookup("TRACKED_ACCOUNTS") {
            self.tracker.tracked_accounts = split_list(&raw)
                .iter()
                .map(|s| AccountName::parse(s))
                .collect::<Result<_, _>>()
                .context("invalid TRACKED_ACCOUNTS")?;
        }
        if let Some(raw) = lookup("DATA_FILE") {
            if !raw.trim().is_empty() {
                self.tracker.data_file = PathBuf::from(raw.trim());
            }
        }
        if let Some(raw) = lookup("DISCORD_WEBHOOK_URL") {
            let raw = raw.trim();
            self.notifier.webhook_url = (!raw.is_empty()).then(|| raw.to_string());
        }
        if let Some(raw) = lookup("ANNOUNCE_FIRST_SIGHT") {
            self.tracker.announce_first_sight =
                matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        Ok(())
    }

    /// One-time startup validation. Raises the check interval to the floor
    /// instead of failing.
    pub fn validate(&mut self) -> Result<()> {
        if self.tracker.check_interval_secs < MIN_CHECK_INTERVAL_SECS {
            warn!(
                "check_interval_secs={} is below the {}s floor, raising it",
                self.tracker.check_interval_secs, MIN_CHECK_INTERVAL_SECS
            );
            self.tracker.check_interval_secs = MIN_CHECK_INTERVAL_SECS;
        }
        if self.rate_limit.windows.is_empty() {
            bail!("rate_limit.windows must contain at least one window");
        }
        for w in &self.rate_limit.windows {
            if w.secs == 0 || w.max_requests == 0 {
                bail!(
                    "rate limit window {}s/{} must have a non-zero duration and quota",
                    w.secs,
                    w.max_requests
                );
            }
        }
        if self.rate_limit.max_backoff_secs < self.rate_limit.default_backoff_secs {
            bail!("rate_limit.max_backoff_secs must be >= default_backoff_secs");
        }
        if let Some(webhook) = &self.notifier.webhook_url {
            url::Url::parse(webhook)
                .with_context(|| format!("invalid notifier.webhook_url {webhook:?}"))?;
        }
        let mut seen = std::collections::HashSet::new();
        self.tracker
            .monitored_leagues
            .retain(|league| seen.insert(league.clone()));
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.tracker.check_interval_secs)
    }

    pub fn inter_account_delay(&self) -> Duration {
        Duration::from_secs(self.tracker.inter_account_delay_secs)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_secs(self.rate_limit.transient_retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.rate_limit.request_timeout_secs)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
