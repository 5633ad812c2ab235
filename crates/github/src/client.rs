//! [`FollowersApi`] over the GitHub REST API.

use std::time::Duration;

use async_trait::async_trait;
use indexer::{
    AccessToken, FetchError, FollowerLogin, FollowersApi, FollowersPage, IndexerError, PageCursor,
    RateLimitSnapshot, RepositoryName, Timestamp,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::headers::{
    classify_failure, error_message, parse_next_page, parse_rate_limit, parse_retry_after,
};

/// Public GitHub API root.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Largest page size GitHub accepts.
pub const MAX_PER_PAGE: u32 = 100;

const API_VERSION_HEADER: &str = "x-github-api-version";
const API_VERSION: &str = "2022-11-28";
const MEDIA_TYPE: &str = "application/vnd.github+json";
const CLIENT_USER_AGENT: &str = concat!("followers-indexer/", env!("CARGO_PKG_VERSION"));

/// Connection settings for [`GithubFollowersClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubClientConfig {
    /// API root, without a trailing slash. Point at a GitHub Enterprise
    /// instance or a test server to override.
    pub api_url: String,
    /// Followers per page, `1..=100`.
    pub per_page: u32,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for GithubClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            per_page: MAX_PER_PAGE,
            timeout: Duration::from_secs(30),
        }
    }
}

impl GithubClientConfig {
    fn validate(&self) -> Result<(), IndexerError> {
        if !(1..=MAX_PER_PAGE).contains(&self.per_page) {
            return Err(IndexerError::configuration(format!(
                "per_page must be between 1 and {MAX_PER_PAGE}, got {}",
                self.per_page
            )));
        }
        if self.timeout.is_zero() {
            return Err(IndexerError::configuration("request timeout must be non-zero"));
        }
        reqwest::Url::parse(&self.api_url).map_err(|e| {
            IndexerError::configuration(format!("invalid API URL '{}': {e}", self.api_url))
        })?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FollowerEntry {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: CoreQuota,
}

#[derive(Debug, Deserialize)]
struct CoreQuota {
    limit: u32,
    remaining: u32,
    reset: i64,
}

impl From<CoreQuota> for RateLimitSnapshot {
    fn from(core: CoreQuota) -> Self {
        Self {
            limit: Some(core.limit),
            remaining: core.remaining,
            reset_at: Timestamp::from_unix_seconds(core.reset),
        }
    }
}

/// Reads one repository owner's followers, one page per call.
///
/// The client holds no credential of its own; every request carries the
/// token the caller leased from the pool.
#[derive(Debug, Clone)]
pub struct GithubFollowersClient {
    http: Client,
    api_url: String,
    per_page: u32,
}

impl GithubFollowersClient {
    /// Builds the HTTP client. Fails on out-of-range settings.
    pub fn new(config: GithubClientConfig) -> Result<Self, IndexerError> {
        config.validate()?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static(MEDIA_TYPE));
        default_headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        default_headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));

        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| IndexerError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            per_page: config.per_page,
        })
    }

    fn followers_url(&self, repository: &RepositoryName) -> String {
        format!("{}/users/{}/followers", self.api_url, repository.owner())
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        token: &AccessToken,
    ) -> Result<Response, FetchError> {
        let response = request
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let err = classify_failure(
            status,
            parse_rate_limit(&headers).as_ref(),
            parse_retry_after(&headers),
            error_message(status, &body),
            Timestamp::now(),
        );
        debug!(status = status.as_u16(), error = %err, "GitHub request failed");
        Err(err)
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    FetchError::transient(format!("{kind}: {err}"))
}

#[async_trait]
impl FollowersApi for GithubFollowersClient {
    #[instrument(skip_all, fields(repository = %repository, page = page.number()))]
    async fn followers_page(
        &self,
        repository: &RepositoryName,
        token: &AccessToken,
        page: PageCursor,
    ) -> Result<FollowersPage, FetchError> {
        let request = self.http.get(self.followers_url(repository)).query(&[
            ("per_page", self.per_page),
            ("page", page.number()),
        ]);
        let response = self.send(request, token).await?;

        let rate_limit = parse_rate_limit(response.headers());
        let next = parse_next_page(response.headers());
        let entries: Vec<FollowerEntry> = response
            .json()
            .await
            .map_err(|e| FetchError::transient(format!("malformed followers page: {e}")))?;

        let followers: Vec<FollowerLogin> = entries
            .into_iter()
            .filter_map(|entry| {
                let login = FollowerLogin::new(entry.login);
                if login.is_none() {
                    warn!("skipping follower entry with empty login");
                }
                login
            })
            .collect();

        debug!(count = followers.len(), next = ?next.map(PageCursor::number), "page fetched");
        Ok(FollowersPage {
            followers,
            next,
            rate_limit,
        })
    }

    #[instrument(skip_all)]
    async fn quota(&self, token: &AccessToken) -> Result<Option<RateLimitSnapshot>, FetchError> {
        let request = self.http.get(format!("{}/rate_limit", self.api_url));
        let response = self.send(request, token).await?;

        let from_headers = parse_rate_limit(response.headers());
        match response.json::<RateLimitBody>().await {
            Ok(body) => Ok(Some(body.resources.core.into())),
            Err(e) => {
                debug!(error = %e, "rate_limit body unreadable, using headers");
                Ok(from_headers)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_public_api() {
        let config = GithubClientConfig::default();
        assert_eq!(config.api_url, "https://api.github.com");
        assert_eq!(config.per_page, 100);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn per_page_out_of_range_is_rejected() {
        for per_page in [0, 101] {
            let config = GithubClientConfig {
                per_page,
                ..GithubClientConfig::default()
            };
            let err = GithubFollowersClient::new(config).unwrap_err();
            assert!(matches!(err, IndexerError::Configuration { .. }));
        }
    }

    #[test]
    fn unparsable_api_url_is_rejected() {
        let config = GithubClientConfig {
            api_url: "not a url".into(),
            ..GithubClientConfig::default()
        };
        assert!(GithubFollowersClient::new(config).is_err());
    }

    #[test]
    fn followers_url_uses_owner_segment() {
        let client = GithubFollowersClient::new(GithubClientConfig {
            api_url: "https://ghe.example.com/api/v3/".into(),
            ..GithubClientConfig::default()
        })
        .unwrap();

        let name = RepositoryName::new("rust-lang/cargo").unwrap();
        assert_eq!(
            client.followers_url(&name),
            "https://ghe.example.com/api/v3/users/rust-lang/followers"
        );
    }

    #[test]
    fn core_quota_converts_to_snapshot() {
        let body: RateLimitBody = serde_json::from_str(
            r#"{"resources":{"core":{"limit":5000,"remaining":12,"reset":1700000000,"used":4988}},"rate":{}}"#,
        )
        .unwrap();
        let snapshot: RateLimitSnapshot = body.resources.core.into();
        assert_eq!(snapshot.limit, Some(5000));
        assert_eq!(snapshot.remaining, 12);
        assert_eq!(snapshot.reset_at, Timestamp::from_unix_seconds(1_700_000_000));
    }
}
