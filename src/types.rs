use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account identifier in `Name#Discriminator` form, e.g. `dtmhawk#4430`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountName(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid account name {0:?}: expected Name#Discriminator")]
pub struct InvalidAccountName(pub String);

impl AccountName {
    pub fn parse(raw: &str) -> Result<Self, InvalidAccountName> {
        let trimmed = raw.trim();
        match trimmed.rsplit_once('#') {
            Some((name, disc))
                if !name.is_empty()
                    && !name.contains(char::is_whitespace)
                    && !disc.is_empty()
                    && disc.chars().all(|c| c.is_ascii_digit()) =>
            {
                Ok(Self(trimmed.to_string()))
            }
            _ => Err(InvalidAccountName(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display name without the discriminator.
    pub fn display_name(&self) -> &str {
        self.0.rsplit_once('#').map(|(name, _)| name).unwrap_or(&self.0)
    }
}

impl FromStr for AccountName {
    type Err = InvalidAccountName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AccountName {
    type Error = InvalidAccountName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccountName> for String {
    fn from(value: AccountName) -> Self {
        value.0
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One character as returned by the character listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub name: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub level: u32,
    pub league: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

/// A detected level increase for one character within one league.
///
/// `from` is `None` only for first-sight announcements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub character: String,
    pub class_name: String,
    pub league: String,
    pub from: Option<u32>,
    pub to: u32,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from {
            Some(from) => write!(
                f,
                "{} ({}) {} -> {} in {}",
                self.character, self.class_name, from, self.to, self.league
            ),
            None => write!(
                f,
                "{} ({}) first seen at {} in {}",
                self.character, self.class_name, self.to, self.league
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_with_discriminator() {
        let acct = AccountName::parse(" dtmhawk#4430 ").unwrap();
        assert_eq!(acct.as_str(), "dtmhawk#4430");
        assert_eq!(acct.display_name(), "dtmhawk");
    }

    #[test]
    fn rejects_missing_or_non_numeric_discriminator() {
        assert!(AccountName::parse("dtmhawk").is_err());
        assert!(AccountName::parse("dtmhawk#").is_err());
        assert!(AccountName::parse("#1234").is_err());
        assert!(AccountName::parse("dtmhawk#12a4").is_err());
        assert!(AccountName::parse("two words#1234").is_err());
    }

    #[test]
    fn account_name_serde_validates() {
        let ok: AccountName = serde_json::from_str("\"A#1111\"").unwrap();
        assert_eq!(ok.to_string(), "A#1111");
        assert!(serde_json::from_str::<AccountName>("\"nope\"").is_err());
    }

    #[test]
    fn character_record_reads_api_shape() {
        let rec: CharacterRecord = serde_json::from_value(serde_json::json!({
            "name": "Char1",
            "realm": "pc",
            "class": "Berserker",
            "league": "Standard",
            "level": 82,
            "experience": 1234567
        }))
        .unwrap();
        assert_eq!(rec.class_name, "Berserker");
        assert_eq!(rec.level, 82);
        assert_eq!(rec.realm.as_deref(), Some("pc"));
    }
}
