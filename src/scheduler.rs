//! The poll-detect-notify-persist loop.
//!
//! Accounts are processed strictly one after another; the rate limiter's
//! quota is global, so nothing here runs concurrently. Every wait (request
//! pacing, the inter-account delay and the inter-cycle sleep) is raced
//! against the cancellation token so shutdown is immediate.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{CharacterSource, fetch_with_retry};
use crate::config::AppConfig;
use crate::detector::{DetectOptions, detect};
use crate::notifier::Notifier;
use crate::state::{SharedState, StateStore};
use crate::types::{AccountName, CharacterRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching(usize),
    Detecting(usize),
    Notifying(usize),
    Persisting(usize),
    Sleeping,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerTiming {
    pub check_interval: Duration,
    pub inter_account_delay: Duration,
    pub transient_retry_delay: Duration,
}

impl SchedulerTiming {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            check_interval: config.check_interval(),
            inter_account_delay: config.inter_account_delay(),
            transient_retry_delay: config.transient_retry_delay(),
        }
    }
}

/// Counters for one pass over the tracked accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub accounts: usize,
    pub checked: usize,
    pub failed: usize,
    pub transitions: usize,
    pub notify_failures: usize,
    pub persist_failures: usize,
    pub cancelled: bool,
}

enum AccountOutcome {
    Checked {
        transitions: usize,
        notify_failures: usize,
    },
    Untracked,
}

pub struct Scheduler {
    source: Arc<dyn CharacterSource>,
    notifier: Arc<dyn Notifier>,
    store: StateStore,
    state: SharedState,
    options: DetectOptions,
    timing: SchedulerTiming,
    cancel: CancellationToken,
    phase: Phase,
    /// In-memory levels differ from the last successful save.
    dirty: bool,
    /// Failed saves during the current cycle.
    persist_failures: usize,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn CharacterSource>,
        notifier: Arc<dyn Notifier>,
        store: StateStore,
        state: SharedState,
        options: DetectOptions,
        timing: SchedulerTiming,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            notifier,
            store,
            state,
            options,
            timing,
            cancel,
            phase: Phase::Idle,
            dirty: false,
            persist_failures: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run cycles until the cancellation token fires.
    pub async fn run(mut self) {
        info!(
            "Entering polling loop (interval: {}s)",
            self.timing.check_interval.as_secs()
        );
        let cancel = self.cancel.clone();
        loop {
            let report = self.run_cycle().await;
            if report.cancelled || cancel.is_cancelled() {
                break;
            }

            self.phase = Phase::Sleeping;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.timing.check_interval) => {}
            }
        }

        if self.dirty {
            self.persist().await;
        }
        info!("Scheduler stopped");
    }

    /// One pass over the accounts tracked at the start of the cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.phase = Phase::Idle;
        self.persist_failures = 0;
        let cancel = self.cancel.clone();
        let accounts = self.state.lock().await.accounts();
        let mut report = CycleReport {
            accounts: accounts.len(),
            ..CycleReport::default()
        };
        if accounts.is_empty() {
            debug!("No tracked accounts, nothing to check");
            // A failed save from the previous cycle still gets retried.
            if self.dirty {
                self.persist().await;
            }
            report.persist_failures = self.persist_failures;
            return report;
        }

        info!("Running tracking check for {} accounts", accounts.len());
        for (idx, account) in accounts.iter().enumerate() {
            if idx > 0 && !self.timing.inter_account_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.timing.inter_account_delay) => {}
                }
            }

            // Only the fetch (and the pacing wait inside it) is cancellable.
            // Once levels are fetched the account is detected, notified and
            // persisted in full.
            self.phase = Phase::Fetching(idx);
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                fetched = fetch_with_retry(
                    self.source.as_ref(),
                    account,
                    self.timing.transient_retry_delay,
                ) => fetched,
            };
            let characters = match fetched {
                Ok(characters) => characters,
                Err(e) => {
                    warn!(%account, kind = e.kind(), "Skipping account this cycle: {e}");
                    report.failed += 1;
                    continue;
                }
            };

            match self.process_account(idx, account, &characters).await {
                AccountOutcome::Checked {
                    transitions,
                    notify_failures,
                } => {
                    report.checked += 1;
                    report.transitions += transitions;
                    report.notify_failures += notify_failures;
                }
                AccountOutcome::Untracked => {}
            }
        }

        if report.transitions > 0 {
            info!("Found {} level-ups this cycle", report.transitions);
        }
        report.persist_failures = self.persist_failures;
        self.phase = Phase::Idle;
        report
    }

    async fn process_account(
        &mut self,
        idx: usize,
        account: &AccountName,
        characters: &[CharacterRecord],
    ) -> AccountOutcome {
        self.phase = Phase::Detecting(idx);
        let detection = {
            let mut state = self.state.lock().await;
            if !state.is_tracked(account) {
                debug!(%account, "Account removed during the cycle, skipping");
                return AccountOutcome::Untracked;
            }
            detect(account, characters, &mut state, &self.options)
        };
        if detection.changed {
            self.dirty = true;
        }

        self.phase = Phase::Notifying(idx);
        let mut notify_failures = 0;
        for transition in &detection.transitions {
            if let Err(e) = self.notifier.notify(account, transition).await {
                notify_failures += 1;
                warn!(%account, kind = "notify_failed", "Failed to deliver {transition}: {e}");
            }
        }

        self.phase = Phase::Persisting(idx);
        if self.dirty {
            self.persist().await;
        }

        AccountOutcome::Checked {
            transitions: detection.transitions.len(),
            notify_failures,
        }
    }

    /// Save the full document. On failure the in-memory state is kept and
    /// the save is attempted again at the next opportunity.
    async fn persist(&mut self) -> bool {
        let result = {
            let state = self.state.lock().await;
            self.store.save(&state)
        };
        match result {
            Ok(()) => {
                self.dirty = false;
                true
            }
            Err(e) => {
                self.persist_failures += 1;
                error!(
                    kind = "persistence_failure",
                    "Failed to save {}: {e}",
                    self.store.path().display()
                );
                false
            }
        }
    }
}
