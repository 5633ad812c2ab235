//! Followers indexer engine.
//!
//! This crate provides the [`PaginatedFetcher`], which collects every page of
//! one repository's follower list on a single credential, and the
//! [`IndexingEngine`], which drives a [`indexer::WorkPlan`] through the
//! per-unit state machine, rotates credentials, and checkpoints each completed
//! unit before moving on.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The engine sequences calls between business logic
//! in the [`indexer`] crate and the infrastructure behind its port traits
//! (`FollowersApi`, `CheckpointStore`). It contains no transport or storage
//! details of its own.
//!
//! ## Guarantees
//!
//! - A unit is recorded only after its full follower set has been fetched.
//! - A rate-limited or rejected credential never costs a unit its retry budget.
//! - Cancellation abandons in-flight fetches but never interrupts a checkpoint write.

pub mod fetcher;
pub mod indexing;
pub mod summary;

pub use fetcher::PaginatedFetcher;
pub use indexing::IndexingEngine;
pub use summary::{HaltReason, RunFailure, RunSummary};
