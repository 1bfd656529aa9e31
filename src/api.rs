use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER, USER_AGENT};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::rate_limit::RateLimiter;
use crate::types::{AccountName, CharacterRecord};

/// Failure of a single character listing request.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("profile of {0} is private")]
    ProfilePrivate(AccountName),

    #[error("account {0} not found")]
    AccountNotFound(AccountName),

    #[error("rate limited (retry after: {})", retry_after.as_deref().unwrap_or("unspecified"))]
    RateLimited { retry_after: Option<String> },

    /// Network error, timeout or 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    /// The body was not a character list at all.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ApiError {
    /// Short machine-readable kind for log records.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::ProfilePrivate(_) => "profile_private",
            ApiError::AccountNotFound(_) => "account_not_found",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Transient(_) => "transient",
            ApiError::UnexpectedStatus(_) => "unexpected_status",
            ApiError::MalformedResponse(_) => "malformed_response",
        }
    }

    /// Whether a single retry within the same cycle is allowed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. } | ApiError::Transient(_))
    }
}

/// Anything that can list the characters of an account.
#[async_trait]
pub trait CharacterSource: Send + Sync {
    /// Issue exactly one listing request for `account`.
    async fn fetch_characters(&self, account: &AccountName)
    -> Result<Vec<CharacterRecord>, ApiError>;
}

/// HTTP client for the public character-window endpoint.
///
/// Owns the rate limiter, so no request can bypass it.
pub struct PoeClient {
    http: reqwest::Client,
    endpoint: String,
    realm: String,
    limiter: Mutex<RateLimiter>,
}

impl PoeClient {
    pub fn new(
        endpoint: impl Into<String>,
        realm: impl Into<String>,
        limiter: RateLimiter,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            realm: realm.into(),
            limiter: Mutex::new(limiter),
        })
    }

    #[cfg(test)]
    pub(crate) async fn consecutive_rejections(&self) -> u32 {
        self.limiter.lock().await.consecutive_rejections()
    }
}

#[async_trait]
impl CharacterSource for PoeClient {
    async fn fetch_characters(
        &self,
        account: &AccountName,
    ) -> Result<Vec<CharacterRecord>, ApiError> {
        // Held for the whole exchange: at most one request in flight.
        let mut limiter = self.limiter.lock().await;
        limiter.acquire().await;

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("accountName", account.as_str()), ("realm", self.realm.as_str())])
            .header(USER_AGENT, crate::USER_AGENT)
            .send()
            .await
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        let headers = response.headers();
        limiter.observe_policy(
            header_str(headers, "x-rate-limit-ip"),
            header_str(headers, "x-rate-limit-ip-state"),
        );

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = header_str(headers, RETRY_AFTER.as_str()).map(str::to_string);
            limiter.on_rate_limited(retry_after.as_deref());
            return Err(ApiError::RateLimited { retry_after });
        }
        limiter.on_success();
        drop(limiter);

        match status.as_u16() {
            403 => Err(ApiError::ProfilePrivate(account.clone())),
            404 => Err(ApiError::AccountNotFound(account.clone())),
            _ if status.is_success() => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| ApiError::Transient(e.to_string()))?;
                parse_characters(account, &body)
            }
            _ if status.is_server_error() => Err(ApiError::Transient(format!("HTTP {status}"))),
            code => Err(ApiError::UnexpectedStatus(code)),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse a character list, skipping entries that do not have the expected
/// shape instead of failing the whole response.
pub fn parse_characters(
    account: &AccountName,
    body: &str,
) -> Result<Vec<CharacterRecord>, ApiError> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| ApiError::MalformedResponse(format!("expected a character list: {e}")))?;

    let mut characters = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<CharacterRecord>(entry) {
            Ok(c) if c.level >= 1 => characters.push(c),
            Ok(c) => {
                warn!(%account, kind = "malformed_response", "Skipping {} with level 0", c.name);
            }
            Err(e) => {
                warn!(
                    %account,
                    kind = "malformed_response",
                    "Skipping character entry #{idx}: {e}"
                );
            }
        }
    }
    debug!("Fetched {} characters for {account}", characters.len());
    Ok(characters)
}

/// Fetch with the bounded retry policy: one retry after a rate-limit
/// rejection (the limiter has already scheduled the backoff) and one retry
/// after a transient failure, following `transient_delay`. Anything else, or
/// a second failure, is returned to the caller.
pub async fn fetch_with_retry<S: CharacterSource + ?Sized>(
    source: &S,
    account: &AccountName,
    transient_delay: Duration,
) -> Result<Vec<CharacterRecord>, ApiError> {
    match source.fetch_characters(account).await {
        Ok(characters) => Ok(characters),
        Err(e @ ApiError::RateLimited { .. }) => {
            info!(%account, kind = e.kind(), "Retrying once after backoff");
            source.fetch_characters(account).await
        }
        Err(e @ ApiError::Transient(_)) => {
            warn!(
                %account,
                kind = e.kind(),
                "Retrying once in {}s: {e}",
                transient_delay.as_secs()
            );
            tokio::time::sleep(transient_delay).await;
            source.fetch_characters(account).await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;
    use crate::rate_limit::RateLimitWindow;
    use crate::test_helpers::{ScriptedSource, character};

    const PATH: &str = "/character-window/get-characters";

    fn account() -> AccountName {
        AccountName::parse("A#1111").unwrap()
    }

    fn client(base: &str) -> PoeClient {
        let limiter = RateLimiter::new(
            vec![RateLimitWindow::new(Duration::from_secs(60), 100)],
            Duration::ZERO,
            Duration::from_secs(60),
            Duration::from_secs(900),
        );
        PoeClient::new(format!("{base}{PATH}"), "pc", limiter, Duration::from_secs(5)).unwrap()
    }

    ////////////////////////////////////////////////////////////
    // PoeClient
    ////////////////////////////////////////////////////////////

    #[tokio::test]
    async fn success_sends_identity_and_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("accountName".into(), "A#1111".into()),
                Matcher::UrlEncoded("realm".into(), "pc".into()),
            ]))
            .match_header("user-agent", crate::USER_AGENT)
            .with_status(200)
            .with_body(
                r#"[
                    {"name":"Char1","class":"Witch","league":"Standard","level":82,"realm":"pc"},
                    {"name":"Broken","class":"Duelist","league":"Standard"},
                    {"name":"Char2","class":"Ranger","league":"Hardcore","level":50}
                ]"#,
            )
            .create_async()
            .await;

        let chars = client(&server.url())
            .fetch_characters(&account())
            .await
            .unwrap();
        mock.assert_async().await;
        let names: Vec<&str> = chars.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Char1", "Char2"]);
    }

    #[tokio::test]
    async fn forbidden_is_profile_private() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .match_query(Matcher::Any)
            .with_status(403)
            .create_async()
            .await;
        let err = client(&server.url())
            .fetch_characters(&account())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ProfilePrivate(ref a) if a.as_str() == "A#1111"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn not_found_is_account_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        let err = client(&server.url())
            .fetch_characters(&account())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn too_many_requests_carries_hint_and_arms_backoff() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("Retry-After", "7")
            .create_async()
            .await;
        let client = client(&server.url());
        let err = client.fetch_characters(&account()).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { retry_after: Some(ref h) } if h == "7"));
        assert_eq!(client.consecutive_rejections().await, 1);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;
        let err = client(&server.url())
            .fetch_characters(&account())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transient(_)));
    }

    #[tokio::test]
    async fn other_client_errors_are_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .match_query(Matcher::Any)
            .with_status(400)
            .create_async()
            .await;
        let err = client(&server.url())
            .fetch_characters(&account())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnexpectedStatus(400)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn non_list_body_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error":{"code":1}}"#)
            .create_async()
            .await;
        let err = client(&server.url())
            .fetch_characters(&account())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let err = client("http://127.0.0.1:1").fetch_characters(&account()).await.unwrap_err();
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn level_zero_entries_are_skipped() {
        let chars = parse_characters(
            &account(),
            r#"[{"name":"Fresh","class":"Witch","league":"Standard","level":0}]"#,
        )
        .unwrap();
        assert!(chars.is_empty());
    }

    ////////////////////////////////////////////////////////////
    // fetch_with_retry
    ////////////////////////////////////////////////////////////

    #[tokio::test]
    async fn rate_limited_then_success_retries_once() {
        let source = ScriptedSource::new(vec![
            Err(ApiError::RateLimited {
                retry_after: Some("1".into()),
            }),
            Ok(vec![character("Char1", "Standard", 82)]),
        ]);
        let chars = fetch_with_retry(&source, &account(), Duration::ZERO).await.unwrap();
        assert_eq!(chars.len(), 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn second_rate_limit_gives_up() {
        let source = ScriptedSource::new(vec![
            Err(ApiError::RateLimited { retry_after: None }),
            Err(ApiError::RateLimited { retry_after: None }),
            Ok(vec![]),
        ]);
        let err = fetch_with_retry(&source, &account(), Duration::ZERO).await.unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_waits_then_retries_once() {
        let source = ScriptedSource::new(vec![
            Err(ApiError::Transient("timeout".into())),
            Err(ApiError::Transient("timeout".into())),
        ]);
        let start = tokio::time::Instant::now();
        let err = fetch_with_retry(&source, &account(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transient(_)));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let source = ScriptedSource::new(vec![
            Err(ApiError::ProfilePrivate(account())),
            Ok(vec![]),
        ]);
        let err = fetch_with_retry(&source, &account(), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, ApiError::ProfilePrivate(_)));
        assert_eq!(source.calls(), 1);
    }
}
