//! Durable tracking state: which accounts are tracked and the last known
//! level of every (account, character, league) triple.
//!
//! The on-disk document is a JSON object
//! `{ "Name#1234": { "Character": { "League": level } } }`. The tracked
//! account set is its key set; a freshly added account maps to `{}`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::AccountName;

/// league -> last known level
pub type LeagueLevels = BTreeMap<String, u32>;
/// character -> leagues
pub type CharacterLevels = BTreeMap<String, LeagueLevels>;

/// The exclusive-access gate shared by the scheduler and the command surface.
pub type SharedState = Arc<Mutex<TrackedState>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on state file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The document exists but no account entry could be recovered.
    #[error("state document is unsalvageable: {0}")]
    Unsalvageable(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackedState {
    accounts: BTreeMap<AccountName, CharacterLevels>,
}

impl TrackedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Tracked accounts in sorted order.
    pub fn accounts(&self) -> Vec<AccountName> {
        self.accounts.keys().cloned().collect()
    }

    pub fn is_tracked(&self, account: &AccountName) -> bool {
        self.accounts.contains_key(account)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Returns `false` if the account was already tracked.
    pub fn add_account(&mut self, account: AccountName) -> bool {
        if self.accounts.contains_key(&account) {
            return false;
        }
        self.accounts.insert(account, CharacterLevels::new());
        true
    }

    /// Drops the account together with every level recorded for it.
    pub fn remove_account(&mut self, account: &AccountName) -> bool {
        self.accounts.remove(account).is_some()
    }

    pub fn characters(&self, account: &AccountName) -> Option<&CharacterLevels> {
        self.accounts.get(account)
    }

    pub fn level(&self, account: &AccountName, character: &str, league: &str) -> Option<u32> {
        self.accounts
            .get(account)?
            .get(character)?
            .get(league)
            .copied()
    }

    pub fn set_level(&mut self, account: &AccountName, character: &str, league: &str, level: u32) {
        self.accounts
            .entry(account.clone())
            .or_default()
            .entry(character.to_string())
            .or_default()
            .insert(league.to_string(), level);
    }
}

/// Settings changed through the command surface, persisted next to the
/// level document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSettings {
    #[serde(default)]
    pub notification_target: Option<String>,
}

/// Whole-document load/save of [`TrackedState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings_path(&self) -> PathBuf {
        self.path.with_extension("settings.json")
    }

    /// Load the document.
    ///
    /// A missing or unreadable file is a cold start. Account entries that do
    /// not have the expected shape are dropped individually; the load only
    /// fails when the document is present but nothing can be recovered.
    pub fn load(&self) -> Result<TrackedState, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", self.path.display());
                return Ok(TrackedState::new());
            }
            Err(e) => {
                warn!("State file {} is unreadable ({e}), starting empty", self.path.display());
                return Ok(TrackedState::new());
            }
        };
        if contents.trim().is_empty() {
            warn!("State file {} is empty, starting empty", self.path.display());
            return Ok(TrackedState::new());
        }

        let root: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Unsalvageable(format!("invalid JSON: {e}")))?;
        let serde_json::Value::Object(entries) = root else {
            return Err(StoreError::Unsalvageable("top level is not an object".into()));
        };

        let total = entries.len();
        let mut state = TrackedState::new();
        let mut dropped = Vec::new();
        for (key, value) in entries {
            let Ok(account) = AccountName::parse(&key) else {
                dropped.push(key);
                continue;
            };
            match serde_json::from_value::<CharacterLevels>(value) {
                Ok(levels) => {
                    state.accounts.insert(account, levels);
                }
                Err(e) => {
                    warn!(account = %key, "Dropping unreadable state entry: {e}");
                    dropped.push(key);
                }
            }
        }

        if !dropped.is_empty() {
            if state.is_empty() {
                return Err(StoreError::Unsalvageable(format!(
                    "none of {total} account entries could be read"
                )));
            }
            warn!(
                "Salvaged {} of {total} accounts from {}; dropped: {}",
                state.len(),
                self.path.display(),
                dropped.join(", ")
            );
        }
        info!("Loaded {} tracked account(s) from {}", state.len(), self.path.display());
        Ok(state)
    }

    /// Replace the document atomically.
    pub fn save(&self, state: &TrackedState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&self.path, json.as_bytes())?;
        Ok(())
    }

    /// Move an unsalvageable document aside so a fresh one can be written.
    pub fn quarantine(&self) -> Result<PathBuf, StoreError> {
        let target = self.path.with_extension("corrupt");
        fs::rename(&self.path, &target)?;
        warn!("Moved corrupt state file to {}", target.display());
        Ok(target)
    }

    pub fn load_settings(&self) -> StoredSettings {
        let path = self.settings_path();
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Ignoring unreadable settings file {}: {e}", path.display());
                StoredSettings::default()
            }),
            Err(_) => StoredSettings::default(),
        }
    }

    pub fn save_settings(&self, settings: &StoredSettings) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(settings)?;
        atomic_write(&self.settings_path(), json.as_bytes())?;
        Ok(())
    }
}

/// Write to a sibling temp file, flush it to disk, then rename over the
/// target so readers see either the old or the new document.
fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = dir.join(tmp_name);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::account;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("levels.json"))
    }

    #[test]
    fn missing_file_is_cold_start_and_save_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut state = store.load().unwrap();
        assert!(state.is_empty());

        state.set_level(&account("A#1111"), "Char1", "Standard", 80);
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn save_then_load_round_trips_every_triple() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut state = TrackedState::new();
        state.set_level(&account("A#1111"), "Char1", "Standard", 82);
        state.set_level(&account("A#1111"), "Char1", "Settlers", 12);
        state.set_level(&account("B#2222"), "Other", "Hardcore", 95);
        state.add_account(account("C#3333"));

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.level(&account("A#1111"), "Char1", "Settlers"), Some(12));
        assert!(loaded.is_tracked(&account("C#3333")));

        // Saving what was loaded changes nothing.
        store.save(&loaded).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn document_shape_is_account_character_league_level() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut state = TrackedState::new();
        state.set_level(&account("A#1111"), "Char1", "Standard", 82);
        store.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"A#1111": {"Char1": {"Standard": 82}}}));
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&TrackedState::new()).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["levels.json".to_string()]);
    }

    #[test]
    fn invalid_json_is_unsalvageable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{\"A#1111\": {\"Char1\":").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Unsalvageable(_))));
    }

    #[test]
    fn non_object_document_is_unsalvageable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "[1, 2, 3]").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Unsalvageable(_))));
    }

    #[test]
    fn bad_entries_are_dropped_individually() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{
                "A#1111": {"Char1": {"Standard": 80}},
                "B#2222": {"Char2": {"Standard": "eighty"}},
                "not-an-account": {},
                "C#3333": {}
            }"#,
        )
        .unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.accounts(), vec![account("A#1111"), account("C#3333")]);
        assert_eq!(state.level(&account("A#1111"), "Char1", "Standard"), Some(80));
    }

    #[test]
    fn nothing_salvageable_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), r#"{"B#2222": 5, "junk": {}}"#).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Unsalvageable(_))));
    }

    #[test]
    fn empty_object_and_blank_file_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{}").unwrap();
        assert!(store.load().unwrap().is_empty());
        fs::write(store.path(), "  \n").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn quarantine_moves_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "garbage").unwrap();
        let moved = store.quarantine().unwrap();
        assert!(moved.exists());
        assert!(!store.path().exists());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn settings_round_trip_next_to_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.load_settings(), StoredSettings::default());
        let settings = StoredSettings {
            notification_target: Some("https://discord.example/api/webhooks/1/abc".into()),
        };
        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings(), settings);
        assert_eq!(store.settings_path(), dir.path().join("levels.settings.json"));
    }

    #[test]
    fn add_and_remove_accounts() {
        let mut state = TrackedState::new();
        assert!(state.add_account(account("A#1111")));
        assert!(!state.add_account(account("A#1111")));
        state.set_level(&account("A#1111"), "Char1", "Standard", 10);
        assert!(state.remove_account(&account("A#1111")));
        assert!(!state.remove_account(&account("A#1111")));
        assert_eq!(state.level(&account("A#1111"), "Char1", "Standard"), None);
    }
}
