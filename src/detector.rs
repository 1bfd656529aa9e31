use tracing::{debug, info};

use crate::config::TrackerConfig;
use crate::state::TrackedState;
use crate::types::{AccountName, CharacterRecord, Transition};

/// Which characters take part in detection and how new ones are treated.
#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// Leagues checked for level-ups. Empty means every league.
    pub monitored_leagues: Vec<String>,
    /// Report a transition (with `from: None`) for a newly seen pair.
    pub announce_first_sight: bool,
    /// Record levels for unmonitored leagues too, without reporting them.
    pub retain_all_leagues: bool,
}

impl DetectOptions {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            monitored_leagues: config.monitored_leagues.clone(),
            announce_first_sight: config.announce_first_sight,
            retain_all_leagues: config.retain_all_leagues,
        }
    }

    pub fn is_monitored(&self, league: &str) -> bool {
        self.monitored_leagues.is_empty() || self.monitored_leagues.iter().any(|l| l == league)
    }
}

/// Result of one detection pass over one account.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Detection {
    /// Level-ups in the order the characters were fetched.
    pub transitions: Vec<Transition>,
    /// Whether `state` was modified and needs saving.
    pub changed: bool,
}

/// Compare one account's fetched characters with the stored levels, update
/// the stored levels and return the level-ups.
///
/// A first sighting becomes a silent baseline unless `announce_first_sight`
/// is set. A lower level than stored is a league reset: the baseline is
/// overwritten and nothing is reported.
pub fn detect(
    account: &AccountName,
    fetched: &[CharacterRecord],
    state: &mut TrackedState,
    options: &DetectOptions,
) -> Detection {
    let mut detection = Detection::default();

    for character in fetched {
        let monitored = options.is_monitored(&character.league);
        if !monitored && !options.retain_all_leagues {
            continue;
        }

        let stored = state.level(account, &character.name, &character.league);
        match stored {
            None => {
                state.set_level(account, &character.name, &character.league, character.level);
                detection.changed = true;
                debug!(
                    "First time tracking {} in {} at level {}",
                    character.name, character.league, character.level
                );
                if monitored && options.announce_first_sight {
                    detection.transitions.push(transition(character, None));
                }
            }
            Some(old) if character.level > old => {
                state.set_level(account, &character.name, &character.league, character.level);
                detection.changed = true;
                if monitored {
                    info!(
                        %account,
                        "LEVEL UP! {} ({}): {old} -> {}",
                        character.name, character.league, character.level
                    );
                    detection.transitions.push(transition(character, Some(old)));
                }
            }
            Some(old) if character.level < old => {
                state.set_level(account, &character.name, &character.league, character.level);
                detection.changed = true;
                info!(
                    %account,
                    "{} in {} dropped from {old} to {}, treating as a reset",
                    character.name, character.league, character.level
                );
            }
            Some(_) => {}
        }
    }

    detection
}

fn transition(character: &CharacterRecord, from: Option<u32>) -> Transition {
    Transition {
        character: character.name.clone(),
        class_name: character.class_name.clone(),
        league: character.league.clone(),
        from,
        to: character.level,
    }
}
