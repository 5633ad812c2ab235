//! Credential pool: quota tracking and least-recently-used rotation.
//!
//! The pool never guesses quota. It starts with nothing known about any
//! credential and learns limits, remaining calls, and reset times only from
//! what the API reports (see [`CredentialPool::observe`]). Between reports it
//! counts requests down locally so a burst of calls cannot overshoot.
//!
//! Each credential is leased to at most one caller at a time. A lease must be
//! handed back with exactly one of [`CredentialPool::release`],
//! [`CredentialPool::mark_exhausted`], or [`CredentialPool::revoke`]; all three
//! consume it.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::{AccessToken, CredentialId, IndexerError, RateLimitSnapshot, Timestamp};

/// Quota state of one credential as currently known.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    /// The opaque token.
    pub token: AccessToken,
    /// Calls left in the current window; `None` until the API reports it.
    pub remaining: Option<u32>,
    /// Size of the quota window, as last reported.
    pub limit: Option<u32>,
    /// When the current window ends.
    pub reset_at: Option<Timestamp>,
}

impl Credential {
    fn new(token: AccessToken) -> Self {
        Self {
            token,
            remaining: None,
            limit: None,
            reset_at: None,
        }
    }

    fn is_spent(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Exclusive use of one credential for the duration of a fetch.
#[derive(Debug)]
pub struct CredentialLease {
    id: CredentialId,
    token: AccessToken,
}

impl CredentialLease {
    /// Which credential this lease is for.
    pub fn id(&self) -> CredentialId {
        self.id
    }

    /// The token to authenticate requests with.
    pub fn token(&self) -> &AccessToken {
        &self.token
    }
}

/// Why [`CredentialPool::acquire`] could not hand out a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// No credential has quota left.
    Exhausted {
        /// The soonest moment at which some credential regains quota, if known.
        earliest_reset: Option<Timestamp>,
    },
    /// Some credentials have quota, but all of them are leased right now.
    AllInFlight,
}

/// Margin past a reported reset before a spent credential is trusted again.
/// Absorbs skew between the local clock and the API's.
pub const RESET_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Slot {
    credential: Credential,
    last_used: u64,
    in_flight: bool,
    revoked: bool,
}

impl Slot {
    /// Restores the quota once the reset time (plus [`RESET_SLACK`]) has passed.
    fn refresh(&mut self, now: Timestamp) {
        let credential = &mut self.credential;
        let reset_passed = credential
            .reset_at
            .is_some_and(|reset| reset.after(RESET_SLACK) <= now);
        if credential.is_spent() && reset_passed {
            credential.remaining = credential.limit;
            credential.reset_at = None;
        }
    }

    fn is_usable(&self) -> bool {
        !self.revoked && !self.credential.is_spent()
    }
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    uses: u64,
}

/// A fixed set of credentials with per-credential quota tracking.
#[derive(Debug)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Builds a pool from configured tokens, in configuration order.
    ///
    /// Duplicate tokens are collapsed since they share one quota.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::Configuration`] if `tokens` is empty.
    pub fn new(tokens: impl IntoIterator<Item = AccessToken>) -> Result<Self, IndexerError> {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        for token in tokens {
            if !seen.insert(token.expose().to_string()) {
                tracing::warn!(credential = slots.len(), "Ignoring duplicate access token");
                continue;
            }
            slots.push(Slot {
                credential: Credential::new(token),
                last_used: 0,
                in_flight: false,
                revoked: false,
            });
        }

        if slots.is_empty() {
            return Err(IndexerError::configuration("no access tokens configured"));
        }

        Ok(Self {
            state: Mutex::new(PoolState { slots, uses: 0 }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of credentials in the pool, revoked ones included.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Always `false`: construction rejects empty pools.
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    /// Number of credentials that have not been revoked.
    pub fn usable_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| !s.revoked).count()
    }

    /// Every credential's id and token, for start-up probing.
    pub fn tokens(&self) -> Vec<(CredentialId, AccessToken)> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (CredentialId::new(i), s.credential.token.clone()))
            .collect()
    }

    /// A copy of every credential's known state, in pool order.
    pub fn snapshot(&self) -> Vec<Credential> {
        self.lock()
            .slots
            .iter()
            .map(|s| s.credential.clone())
            .collect()
    }

    /// Leases the least-recently-used credential with quota left.
    ///
    /// # Errors
    ///
    /// See [`AcquireError`].
    pub fn acquire(&self) -> Result<CredentialLease, AcquireError> {
        self.acquire_at(Timestamp::now())
    }

    /// [`CredentialPool::acquire`] against an explicit clock.
    pub fn acquire_at(&self, now: Timestamp) -> Result<CredentialLease, AcquireError> {
        let mut state = self.lock();
        for slot in &mut state.slots {
            slot.refresh(now);
        }

        let chosen = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_usable() && !s.in_flight)
            .min_by_key(|(i, s)| (s.last_used, *i))
            .map(|(i, _)| i);

        match chosen {
            Some(index) => {
                state.uses += 1;
                let uses = state.uses;
                let slot = &mut state.slots[index];
                slot.in_flight = true;
                slot.last_used = uses;
                Ok(CredentialLease {
                    id: CredentialId::new(index),
                    token: slot.credential.token.clone(),
                })
            }
            None if state.slots.iter().any(Slot::is_usable) => Err(AcquireError::AllInFlight),
            None => Err(AcquireError::Exhausted {
                earliest_reset: state
                    .slots
                    .iter()
                    .filter(|s| !s.revoked)
                    .filter_map(|s| s.credential.reset_at)
                    .min(),
            }),
        }
    }

    /// Counts one request against the credential before it is sent.
    pub fn record_request(&self, id: CredentialId) {
        if let Some(slot) = self.lock().slots.get_mut(id.index()) {
            let credential = &mut slot.credential;
            credential.remaining = credential.remaining.map(|r| r.saturating_sub(1));
        }
    }

    /// Replaces the known quota with the figures the API reported.
    pub fn observe(&self, id: CredentialId, snapshot: &RateLimitSnapshot) {
        if let Some(slot) = self.lock().slots.get_mut(id.index()) {
            let credential = &mut slot.credential;
            credential.remaining = Some(snapshot.remaining);
            credential.limit = snapshot.limit.or(credential.limit);
            credential.reset_at = snapshot.reset_at.or(credential.reset_at);
        }
    }

    /// Returns a lease after use, recording the last reported quota if any.
    pub fn release(&self, lease: CredentialLease, last_seen: Option<&RateLimitSnapshot>) {
        if let Some(snapshot) = last_seen {
            self.observe(lease.id, snapshot);
        }
        if let Some(slot) = self.lock().slots.get_mut(lease.id.index()) {
            slot.in_flight = false;
        }
    }

    /// Returns a lease whose quota the API reports as used up.
    ///
    /// The credential is skipped until `reset_at` passes. Without a reset time
    /// it stays out of rotation for the rest of the run.
    pub fn mark_exhausted(&self, lease: CredentialLease, reset_at: Option<Timestamp>) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(lease.id.index()) {
            slot.in_flight = false;
            slot.credential.remaining = Some(0);
            slot.credential.reset_at = reset_at.or(slot.credential.reset_at);
            tracing::info!(
                credential = lease.id.index(),
                reset_at = ?slot.credential.reset_at.map(|t| t.to_string()),
                "Credential quota exhausted"
            );
        }
    }

    /// Returns a lease whose token the API rejected. It is never handed out again.
    pub fn revoke(&self, lease: CredentialLease) {
        self.disable(lease.id);
    }

    /// Takes a credential out of rotation for the rest of the run.
    pub fn disable(&self, id: CredentialId) {
        if let Some(slot) = self.lock().slots.get_mut(id.index()) {
            slot.revoked = true;
            slot.in_flight = false;
            tracing::warn!(credential = id.index(), "Credential rejected by the API; disabled");
        }
    }
}
