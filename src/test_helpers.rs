use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::api::{ApiError, CharacterSource};
use crate::notifier::{NotifyError, Notifier};
use crate::types::{AccountName, CharacterRecord, Transition};

type Reply = Result<Vec<CharacterRecord>, ApiError>;

pub fn character(name: &str, league: &str, level: u32) -> CharacterRecord {
    CharacterRecord {
        name: name.to_string(),
        class_name: "Witch".to_string(),
        level,
        league: league.to_string(),
        realm: Some("pc".to_string()),
    }
}

pub fn account(raw: &str) -> AccountName {
    AccountName::parse(raw).unwrap()
}

/// Replays canned replies, per account or from a shared queue.
#[derive(Default)]
pub struct ScriptedSource {
    shared: Mutex<VecDeque<Reply>>,
    per_account: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            shared: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn with_account(self, account: &str, replies: Vec<Reply>) -> Self {
        self.per_account
            .lock()
            .unwrap()
            .insert(account.to_string(), replies.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Accounts in the order they were fetched.
    pub fn fetched(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl CharacterSource for ScriptedSource {
    async fn fetch_characters(&self, account: &AccountName) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(account.to_string());
        let scripted = self
            .per_account
            .lock()
            .unwrap()
            .get_mut(account.as_str())
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| self.shared.lock().unwrap().pop_front())
            .unwrap_or_else(|| Err(ApiError::Transient("script exhausted".into())))
    }
}

/// Captures delivered transitions; can be switched to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(AccountName, Transition)>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        let n = Self::default();
        n.failing.store(true, Ordering::SeqCst);
        n
    }

    pub fn sent(&self) -> Vec<(AccountName, Transition)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        account: &AccountName,
        transition: &Transition,
    ) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected(500));
        }
        self.sent
            .lock()
            .unwrap()
            .push((account.clone(), transition.clone()));
        Ok(())
    }
}
