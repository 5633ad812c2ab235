//! Core domain for the followers indexer.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, and error type used by the resumable indexing engine, together with
//! the two pure components that need no I/O: the [`CredentialPool`] and the
//! work [`plan`]ner. Infrastructure crates implement the port traits defined
//! here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RepositoryName`, `FollowerLogin`, `RunId`, ...) |
//! | [`types`] | Value types (`RepositoryRecord`, `FollowerSet`, `RateLimitSnapshot`, ...) |
//! | [`errors`] | Run-level, checkpoint, and per-fetch error types plus `RetryPolicy` |
//! | [`config`] | `IndexerConfig` and its retry / wait policies |
//! | [`ports`] | `FollowersApi`, `CheckpointStore`, and `Clock` traits |
//! | [`credentials`] | Credential pool with quota tracking and LRU rotation |
//! | [`planner`] | Work planning against the checkpoint store |
//! | [`memory`] | In-memory `CheckpointStore` |

pub mod config;
pub mod credentials;
pub mod errors;
pub mod identifiers;
pub mod memory;
pub mod planner;
pub mod ports;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use config::{IndexerConfig, RetryConfig, WaitPolicy, DEFAULT_MAX_PAGES};
pub use credentials::{AcquireError, Credential, CredentialLease, CredentialPool, RESET_SLACK};
pub use errors::{CheckpointError, FetchError, IndexerError, RetryPolicy};
pub use identifiers::{AccessToken, CredentialId, FollowerLogin, RepositoryName, RunId};
pub use memory::InMemoryCheckpointStore;
pub use planner::{plan, RunStats, WorkPlan};
pub use ports::{CheckpointStore, Clock, FollowersApi, SystemClock};
pub use types::{
    FollowerSet, FollowersPage, PageCursor, RateLimitSnapshot, RepositoryRecord, Timestamp,
};
