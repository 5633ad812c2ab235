//! Error and retry-policy types for the followers indexer domain.
//!
//! [`IndexerError`] covers conditions that halt the whole run. [`FetchError`]
//! covers per-unit failures reported by a [`crate::FollowersApi`]; the engine
//! handles those locally and never lets them abort the run.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Timestamp;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable` errors: timeouts, connection failures, server errors.
/// - `NonRetryable` errors: missing entities, rejected credentials, exhausted quota.
///   Exhausted quota is handled by credential rotation rather than by retrying
///   the same request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried with the same inputs.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Per-unit fetch errors
// ---------------------------------------------------------------------------

/// Failure of a single request against the followers API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// The credential's quota is used up. Rotate to another credential.
    #[error("rate limited{}", until_suffix(.reset_at))]
    RateLimited {
        /// When the quota window resets, if the API said so.
        reset_at: Option<Timestamp>,
    },

    /// The entity no longer exists (deleted or renamed). Terminal for the unit.
    #[error("not found")]
    NotFound,

    /// The API rejected the credential itself.
    #[error("credential rejected: {message}")]
    Unauthorized {
        /// Details reported by the API.
        message: String,
    },

    /// A timeout, connection failure, server error, or malformed response.
    #[error("transient network error: {message}")]
    Transient {
        /// Details of the failure.
        message: String,
        /// Server-requested delay before retrying, if any.
        retry_after: Option<Duration>,
    },
}

fn until_suffix(reset_at: &Option<Timestamp>) -> String {
    reset_at.map(|t| format!(" until {t}")).unwrap_or_default()
}

impl FetchError {
    /// Shorthand for a [`FetchError::Transient`] with no server-requested delay.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether retrying the same request on the same credential may succeed.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Transient { retry_after, .. } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::RateLimited { .. } | Self::NotFound | Self::Unauthorized { .. } => {
                RetryPolicy::NonRetryable
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint errors
// ---------------------------------------------------------------------------

/// Failure to load or persist the checkpoint store.
///
/// Both variants are fatal: proceeding would either discard history or lose
/// completed work.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckpointError {
    /// The existing checkpoint could not be read or parsed.
    #[error("checkpoint at '{location}' is unreadable: {message}")]
    Corrupt {
        /// Where the checkpoint lives (file path or backend name).
        location: String,
        /// Parser or I/O details.
        message: String,
    },

    /// A completed unit could not be made durable.
    #[error("failed to write checkpoint at '{location}': {message}")]
    Write {
        /// Where the checkpoint lives (file path or backend name).
        location: String,
        /// I/O or serialisation details.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Run-level errors
// ---------------------------------------------------------------------------

/// Errors that halt the whole run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexerError {
    /// The configuration is invalid or no credential is usable.
    ///
    /// Produced before any work starts.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The input repository list is missing or unparsable.
    #[error("input error: {message}")]
    Input {
        /// Description of the input problem.
        message: String,
    },

    /// The checkpoint store is corrupt or a write failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl IndexerError {
    /// Shorthand for [`IndexerError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for [`IndexerError::Input`].
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }
}
