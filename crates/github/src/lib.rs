//! GitHub adapter for the followers indexer.
//!
//! Implements the [`indexer::FollowersApi`] port with `reqwest` against the
//! GitHub REST API:
//!
//! - `GET {api_url}/users/{owner}/followers?per_page=N&page=P` for each page,
//! - `GET {api_url}/rate_limit` to check a credential before the run.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Everything GitHub-specific (headers, pagination links,
//! status codes, secondary rate limits) is translated here into the domain's
//! [`indexer::FetchError`] kinds and [`indexer::RateLimitSnapshot`]s. The
//! engine never sees an HTTP status.

pub mod client;
pub mod headers;

pub use client::{GithubClientConfig, GithubFollowersClient, DEFAULT_API_URL, MAX_PER_PAGE};
