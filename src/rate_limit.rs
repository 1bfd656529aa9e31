//! Client-side pacing for the character API.
//!
//! Requests are serialized through one [`RateLimiter`]. It enforces every
//! configured sliding window at once, a minimum spacing between requests,
//! and any backoff imposed by the server (429 or an advertised restriction).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;

/// Fraction of a window's quota at which usage is logged as a warning.
const USAGE_WARN_RATIO: f64 = 0.8;

/// At most `max_requests` within any rolling `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub duration: Duration,
    pub max_requests: u32,
}

impl RateLimitWindow {
    pub fn new(duration: Duration, max_requests: u32) -> Self {
        Self {
            duration,
            max_requests,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: Vec<RateLimitWindow>,
    /// Dispatch instants, oldest first, pruned to the longest window.
    history: VecDeque<Instant>,
    min_spacing: Duration,
    last_request: Option<Instant>,
    backoff_until: Option<Instant>,
    consecutive_rejections: u32,
    default_backoff: Duration,
    max_backoff: Duration,
}

impl RateLimiter {
    pub fn new(
        windows: Vec<RateLimitWindow>,
        min_spacing: Duration,
        default_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            windows,
            history: VecDeque::new(),
            min_spacing,
            last_request: None,
            backoff_until: None,
            consecutive_rejections: 0,
            default_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let windows = config
            .windows
            .iter()
            .map(|w| RateLimitWindow::new(Duration::from_secs(w.secs), w.max_requests))
            .collect();
        Self::new(
            windows,
            Duration::from_millis(config.min_spacing_ms),
            Duration::from_secs(config.default_backoff_secs),
            Duration::from_secs(config.max_backoff_secs),
        )
    }

    pub fn windows(&self) -> &[RateLimitWindow] {
        &self.windows
    }

    /// Wait until one more request fits every window, the spacing floor and
    /// any active backoff, then record the dispatch.
    ///
    /// Must be called immediately before each request is sent.
    pub async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            self.prune(now);
            match self.wait_needed(now) {
                None => break,
                Some(wait) => {
                    debug!("Rate limiter pausing for {:.1}s", wait.as_secs_f64());
                    tokio::time::sleep(wait).await;
                }
            }
        }
        let now = Instant::now();
        self.last_request = Some(now);
        self.history.push_back(now);
    }

    /// Register a 429 and return the backoff applied.
    ///
    /// A numeric `Retry-After` is honored as given; an unparseable one falls
    /// back to the fixed default. Without a hint the default doubles for
    /// every consecutive rejection. All waits are capped at `max_backoff`.
    pub fn on_rate_limited(&mut self, retry_after: Option<&str>) -> Duration {
        self.consecutive_rejections = self.consecutive_rejections.saturating_add(1);
        let wait = match retry_after.map(str::trim) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    warn!("Unparseable Retry-After {raw:?}, using default backoff");
                    self.default_backoff
                }
            },
            None => {
                let exp = self.consecutive_rejections.saturating_sub(1).min(16);
                self.default_backoff.saturating_mul(1 << exp)
            }
        };
        let wait = wait.min(self.max_backoff);
        warn!(
            "Rate limited ({} consecutive), backing off for {}s",
            self.consecutive_rejections,
            wait.as_secs()
        );
        self.extend_backoff(Instant::now(), wait);
        wait
    }

    /// A request went through without a rejection.
    pub fn on_success(&mut self) {
        self.consecutive_rejections = 0;
    }

    pub fn consecutive_rejections(&self) -> u32 {
        self.consecutive_rejections
    }

    /// Apply the server-advertised policy.
    ///
    /// `rules` is `max_hits:period:restriction,...` and replaces the active
    /// windows when it parses. `state` is `hits:period:active_restriction,...`;
    /// an active restriction or an exhausted window pauses further requests.
    pub fn observe_policy(&mut self, rules: Option<&str>, state: Option<&str>) {
        let rules = rules.map(parse_triples).unwrap_or_default();
        if !rules.is_empty() {
            let windows: Vec<RateLimitWindow> = rules
                .iter()
                .filter(|(max, period, _)| *max > 0 && *period > 0)
                .map(|&(max, period, _)| {
                    let max = u32::try_from(max).unwrap_or(u32::MAX);
                    RateLimitWindow::new(Duration::from_secs(period), max)
                })
                .collect();
            if !windows.is_empty() && windows != self.windows {
                info!("Adopting server rate limit policy: {}", format_windows(&windows));
                self.windows = windows;
            }
        }

        let Some(state) = state else {
            return;
        };
        let now = Instant::now();
        for (hits, period, restricted) in parse_triples(state) {
            if restricted > 0 {
                let wait = Duration::from_secs(restricted).min(self.max_backoff);
                warn!(
                    "Server reports active restriction of {restricted}s on the {period}s window, \
                     pausing for {}s",
                    wait.as_secs()
                );
                self.extend_backoff(now, wait);
                continue;
            }
            let Some(window) = self
                .windows
                .iter()
                .find(|w| w.duration.as_secs() == period)
                .copied()
            else {
                continue;
            };
            let max = u64::from(window.max_requests);
            if hits >= max {
                warn!("Server window {period}s exhausted ({hits}/{max}), pausing");
                self.extend_backoff(now, window.duration.min(self.max_backoff));
            } else if hits as f64 / max as f64 >= USAGE_WARN_RATIO {
                warn!("Close to rate limit for {period}s window: {hits}/{max}");
            }
        }
    }

    /// Hold requests back for `wait` from `now`, never shortening an existing
    /// backoff.
    fn extend_backoff(&mut self, now: Instant, wait: Duration) {
        let Some(until) = now.checked_add(wait.min(self.max_backoff)) else {
            warn!("Backoff of {}s is out of range, ignoring", wait.as_secs());
            return;
        };
        self.backoff_until = Some(match self.backoff_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    fn prune(&mut self, now: Instant) {
        let Some(longest) = self.windows.iter().map(|w| w.duration).max() else {
            self.history.clear();
            return;
        };
        while self
            .history
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= longest)
        {
            self.history.pop_front();
        }
        if self.backoff_until.is_some_and(|until| until <= now) {
            self.backoff_until = None;
        }
    }

    /// Time until the next request is allowed, or `None` if it may go now.
    fn wait_needed(&self, now: Instant) -> Option<Duration> {
        let mut ready_at = now;

        if let Some(until) = self.backoff_until {
            ready_at = ready_at.max(until);
        }
        if let Some(last) = self.last_request {
            ready_at = ready_at.max(last + self.min_spacing);
        }
        for window in &self.windows {
            let in_window: Vec<Instant> = self
                .history
                .iter()
                .copied()
                .filter(|&t| now.saturating_duration_since(t) < window.duration)
                .collect();
            let max = window.max_requests as usize;
            if in_window.len() >= max {
                // The slot frees once enough of the oldest in-window requests expire.
                let pivot = in_window[in_window.len() - max];
                ready_at = ready_at.max(pivot + window.duration);
            }
        }

        (ready_at > now).then(|| ready_at - now)
    }
}

/// Parse `a:b:c,a:b:c` header values, skipping malformed parts.
fn parse_triples(raw: &str) -> Vec<(u64, u64, u64)> {
    raw.split(',')
        .filter_map(|part| {
            let mut it = part.trim().split(':').map(|n| n.trim().parse::<u64>());
            match (it.next(), it.next(), it.next(), it.next()) {
                (Some(Ok(a)), Some(Ok(b)), Some(Ok(c)), None) => Some((a, b, c)),
                _ => None,
            }
        })
        .collect()
}

fn format_windows(windows: &[RateLimitWindow]) -> String {
    windows
        .iter()
        .map(|w| format!("{}/{}s", w.max_requests, w.duration.as_secs()))
        .collect::<Vec<_>>()
        .join(", ")
}
