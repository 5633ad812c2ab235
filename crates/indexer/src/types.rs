//! Shared value types for the followers indexer domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! values that participate in domain computations: follower sets, rate-limit
//! figures, page cursors, and wall-clock time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FollowerLogin, RepositoryName};

// ---------------------------------------------------------------------------
// Input records
// ---------------------------------------------------------------------------

/// One entry of the input repository list.
///
/// Only `name` is interpreted. Every other field is carried through unchanged
/// so that the record serialises back to what was read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Identity of the record and key of the checkpoint store.
    pub name: RepositoryName,

    /// Fields the indexer does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RepositoryRecord {
    /// Creates a record with no pass-through fields.
    pub fn new(name: RepositoryName) -> Self {
        Self {
            name,
            extra: serde_json::Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The followers of one repository, in the order the API returned them.
///
/// Semantically a set, but the API's order is preserved so repeated runs
/// produce identical artefacts. An empty set is also the sentinel recorded for
/// repositories that no longer exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FollowerSet(Vec<FollowerLogin>);

impl FollowerSet {
    /// Creates an empty set.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Appends one page of followers, keeping their order.
    pub fn extend_page(&mut self, page: impl IntoIterator<Item = FollowerLogin>) {
        self.0.extend(page);
    }

    /// Number of followers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when no followers were recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<FollowerLogin>> for FollowerSet {
    fn from(logins: Vec<FollowerLogin>) -> Self {
        Self(logins)
    }
}

impl FromIterator<FollowerLogin> for FollowerSet {
    fn from_iter<I: IntoIterator<Item = FollowerLogin>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// One-based page number of a paginated list endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCursor(u32);

impl PageCursor {
    /// The first page.
    pub fn first() -> Self {
        Self(1)
    }

    /// Creates a cursor, returning `None` for page zero.
    pub fn new(page: u32) -> Option<Self> {
        if page == 0 {
            None
        } else {
            Some(Self(page))
        }
    }

    /// Returns the page number.
    pub fn number(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PageCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single page returned by a [`crate::FollowersApi`].
#[derive(Debug, Clone, PartialEq)]
pub struct FollowersPage {
    /// Followers on this page, in API order.
    pub followers: Vec<FollowerLogin>,

    /// Where the next page is, or `None` if this was the last one.
    pub next: Option<PageCursor>,

    /// Quota figures reported with this response, if the API sent any.
    pub rate_limit: Option<RateLimitSnapshot>,
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

/// Quota state for one credential, as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    /// Size of the quota window, when reported.
    pub limit: Option<u32>,

    /// Requests left in the current window.
    pub remaining: u32,

    /// When the current window ends and the quota is restored.
    pub reset_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from seconds since the Unix epoch.
    ///
    /// Returns `None` if the value is out of range.
    pub fn from_unix_seconds(secs: i64) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).map(Self)
    }

    /// Returns this timestamp shifted forward by `duration`.
    ///
    /// Saturates at the original value if the shift overflows.
    pub fn after(self, duration: std::time::Duration) -> Self {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| self.0.checked_add_signed(d))
            .map(Self)
            .unwrap_or(self)
    }

    /// Time remaining from `now` until this timestamp; zero if already past.
    pub fn duration_since(self, now: Timestamp) -> std::time::Duration {
        (self.0 - now.0).to_std().unwrap_or_default()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
