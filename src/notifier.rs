use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::types::{AccountName, Transition};

/// Embed accent color for level-up messages.
const LEVEL_UP_COLOR: u32 = 0xff6b35;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no notification target configured")]
    NoTarget,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("endpoint rejected notification with status {0}")]
    Rejected(u16),
}

/// Delivers level-ups somewhere a human will see them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account: &AccountName, transition: &Transition)
    -> Result<(), NotifyError>;

    /// Redirect future notifications. Returns `false` if this notifier has
    /// no configurable target.
    fn set_target(&self, _target: Option<String>) -> bool {
        false
    }

    fn target(&self) -> Option<String> {
        None
    }
}

/// Posts to a Discord-compatible incoming webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    target: RwLock<Option<String>>,
    username: String,
}

impl WebhookNotifier {
    pub fn new(target: Option<String>, username: impl Into<String>) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            target: RwLock::new(target),
            username: username.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        account: &AccountName,
        transition: &Transition,
    ) -> Result<(), NotifyError> {
        let Some(url) = self.target() else {
            return Err(NotifyError::NoTarget);
        };
        let payload = build_payload(&self.username, account, transition);
        let response = self.http.post(&url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }

    fn set_target(&self, target: Option<String>) -> bool {
        if let Ok(mut guard) = self.target.write() {
            *guard = target;
        }
        true
    }

    fn target(&self) -> Option<String> {
        self.target.read().ok().and_then(|g| g.clone())
    }
}

/// Webhook body: a plain-text line plus an embed with the details.
pub fn build_payload(
    username: &str,
    account: &AccountName,
    transition: &Transition,
) -> serde_json::Value {
    let mut content = format!(
        "🎉 **Congrats {} on reaching Level {} in {}!** 🎉",
        transition.character, transition.to, transition.league
    );
    let progress = match transition.from {
        Some(from) => {
            content.push_str(&format!(" (Level {from} → {})", transition.to));
            format!("{from} → {}", transition.to)
        }
        None => format!("first seen at {}", transition.to),
    };

    json!({
        "username": username,
        "content": content,
        "embeds": [{
            "title": "🎉 Level Up!",
            "description": format!(
                "**{}** reached Level **{}** in **{}**!",
                transition.character, transition.to, transition.league
            ),
            "color": LEVEL_UP_COLOR,
            "fields": [
                { "name": "Character", "value": transition.character, "inline": true },
                { "name": "Class", "value": transition.class_name, "inline": true },
                { "name": "League", "value": transition.league, "inline": true },
                { "name": "Account", "value": account.as_str(), "inline": true },
                { "name": "Level Progress", "value": progress, "inline": true },
            ],
        }],
    })
}

/// One level-up event as a JSON line.
#[derive(Debug, Serialize)]
pub struct LevelUpEvent<'a> {
    pub timestamp: String,
    pub account: &'a AccountName,
    #[serde(flatten)]
    pub transition: &'a Transition,
}

/// Emits each level-up as a single JSON line on stdout. Used when no
/// webhook is configured.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    async fn notify(
        &self,
        account: &AccountName,
        transition: &Transition,
    ) -> Result<(), NotifyError> {
        let event = LevelUpEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            account,
            transition,
        };
        if let Ok(json) = serde_json::to_string(&event) {
            println!("{json}");
        }
        Ok(())
    }
}
