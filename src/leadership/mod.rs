//! Leader election against the remote arbiter.
//!
//! Exactly one instance may run mutating scan cycles at a time, even
//! though many instances can be alive. The coordinator claims a
//! time-bounded lease, heartbeats it, reconciles local belief with the
//! arbiter (split-brain guard), and releases it on teardown.
//!
//! State machine: `Unclaimed → Leader → [Lost on verify mismatch] →
//! Unclaimed`, with `ClaimedByOther` as an externally visible state that
//! requires a forced claim to leave.

use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::collaborators::Arbiter;
use crate::retry::RetryPolicy;
use crate::types::{ClaimResponse, WardenError};

/// Consecutive renew failures before the renewal loop escalates to a
/// full verify round-trip.
pub const RENEW_FAILURES_BEFORE_VERIFY: u32 = 3;

/// Local belief about who leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipState {
    Unclaimed,
    /// This instance holds the lease and is heartbeating it.
    Leader,
    /// Another, non-stale holder is active. Requires force to take over.
    ClaimedByOther { holder_id: String },
    /// The arbiter disagreed with a local Leader belief; stood down.
    Lost,
}

/// Outcome of a claim attempt. A conflict is an actionable state, not an
/// error: the operator may choose to force-claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Granted,
    Conflict { holder_id: String },
}

pub struct LeaderElectionCoordinator {
    arbiter: Arc<dyn Arbiter>,
    instance_id: String,
    lease_ttl: chrono::Duration,
    retry: RetryPolicy,
    state: RwLock<LeadershipState>,
    renew_failures: AtomicU32,
}

impl LeaderElectionCoordinator {
    pub fn new(
        arbiter: Arc<dyn Arbiter>,
        instance_id: String,
        lease_ttl: chrono::Duration,
        claim_max_attempts: u32,
        claim_base_delay: Duration,
    ) -> Self {
        Self {
            arbiter,
            instance_id,
            lease_ttl,
            retry: RetryPolicy::new(claim_max_attempts, claim_base_delay),
            state: RwLock::new(LeadershipState::Unclaimed),
            renew_failures: AtomicU32::new(0),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> LeadershipState {
        self.state.read().unwrap().clone()
    }

    pub fn is_leader(&self) -> bool {
        matches!(*self.state.read().unwrap(), LeadershipState::Leader)
    }

    fn set_state(&self, next: LeadershipState) {
        *self.state.write().unwrap() = next;
    }

    /// Attempt to acquire the lease.
    ///
    /// Without `force`, a denial from a fresh holder is final; a denial
    /// whose lease looks stale is retried with escalating backoff (the
    /// arbiter may still be in the middle of expiring it). `force`
    /// overwrites the holder unconditionally and never retries.
    pub async fn claim(&self, force: bool) -> Result<ClaimResult, WardenError> {
        if force {
            let response = self.arbiter.claim_session(&self.instance_id, true).await?;
            return match response {
                ClaimResponse::Granted { lease } => {
                    info!(
                        instance_id = %self.instance_id,
                        forced = lease.forced,
                        "Leadership force-claimed"
                    );
                    self.renew_failures.store(0, Ordering::SeqCst);
                    self.set_state(LeadershipState::Leader);
                    Ok(ClaimResult::Granted)
                }
                ClaimResponse::Denied { lease } => {
                    // A forced claim should never be denied; treat as an
                    // arbiter fault so the caller can surface it.
                    Err(WardenError::Arbiter(format!(
                        "forced claim denied, holder {}",
                        lease.holder_id
                    )))
                }
            };
        }

        let lease_ttl = self.lease_ttl;
        let arbiter = self.arbiter.clone();
        let instance_id = self.instance_id.clone();

        let outcome = self
            .retry
            .run(
                "lease_claim",
                move || {
                    let arbiter = arbiter.clone();
                    let instance_id = instance_id.clone();
                    async move {
                        match arbiter.claim_session(&instance_id, false).await? {
                            ClaimResponse::Granted { .. } => Ok(ClaimResult::Granted),
                            ClaimResponse::Denied { lease } => {
                                if lease.is_stale(lease_ttl, Utc::now()) {
                                    // Holder stopped renewing but the slot
                                    // has not been reaped yet; retryable.
                                    Err(WardenError::Arbiter(format!(
                                        "stale holder {} still registered",
                                        lease.holder_id
                                    )))
                                } else {
                                    Ok(ClaimResult::Conflict {
                                        holder_id: lease.holder_id,
                                    })
                                }
                            }
                        }
                    }
                },
                |e| matches!(e, WardenError::Arbiter(msg) if msg.starts_with("stale holder")),
            )
            .await?;

        match &outcome {
            ClaimResult::Granted => {
                info!(instance_id = %self.instance_id, "Leadership claimed");
                self.renew_failures.store(0, Ordering::SeqCst);
                self.set_state(LeadershipState::Leader);
            }
            ClaimResult::Conflict { holder_id } => {
                info!(
                    instance_id = %self.instance_id,
                    holder = %holder_id,
                    "Leadership held by another active instance"
                );
                self.set_state(LeadershipState::ClaimedByOther {
                    holder_id: holder_id.clone(),
                });
            }
        }
        Ok(outcome)
    }

    /// Idempotent heartbeat. Failures are non-fatal locally; after
    /// `RENEW_FAILURES_BEFORE_VERIFY` consecutive failures the caller
    /// should run `verify` to reconcile with the arbiter.
    ///
    /// Returns whether the lease is believed renewed.
    pub async fn renew(&self) -> bool {
        if !self.is_leader() {
            return false;
        }

        match self.arbiter.claim_session(&self.instance_id, false).await {
            Ok(ClaimResponse::Granted { .. }) => {
                self.renew_failures.store(0, Ordering::SeqCst);
                true
            }
            Ok(ClaimResponse::Denied { lease }) => {
                // The arbiter already handed the lease to someone else.
                let failures = self.renew_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    instance_id = %self.instance_id,
                    holder = %lease.holder_id,
                    failures,
                    "Renew denied, lease held elsewhere"
                );
                false
            }
            Err(e) => {
                let failures = self.renew_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    instance_id = %self.instance_id,
                    failures,
                    error = %e,
                    "Renew failed, keeping local state"
                );
                false
            }
        }
    }

    /// Whether the renewal loop should escalate to a verify round-trip.
    pub fn should_verify(&self) -> bool {
        self.renew_failures.load(Ordering::SeqCst) >= RENEW_FAILURES_BEFORE_VERIFY
    }

    /// Reconcile local belief with the arbiter's authoritative state.
    ///
    /// If the local belief is Leader but the arbiter disagrees, the
    /// coordinator stands down (`Lost`) — this is the split-brain guard;
    /// the scheduler must stop when it observes the transition.
    pub async fn verify(&self) -> Result<bool, WardenError> {
        let status = self.arbiter.session_status().await?;
        self.renew_failures.store(0, Ordering::SeqCst);

        let arbiter_says_us = status.is_active
            && status
                .active_id
                .as_deref()
                .is_some_and(|id| id == self.instance_id);

        let believed_leader = self.is_leader();
        if believed_leader && !arbiter_says_us {
            warn!(
                instance_id = %self.instance_id,
                arbiter_active = status.is_active,
                arbiter_holder = ?status.active_id,
                "Arbiter disagrees with local leadership — standing down"
            );
            self.set_state(LeadershipState::Lost);
            return Ok(false);
        }

        Ok(arbiter_says_us)
    }

    /// Explicit, best-effort release. Local state is cleared regardless of
    /// whether the arbiter round-trip succeeded.
    pub async fn release(&self) -> bool {
        let released = match self.arbiter.release_session(&self.instance_id).await {
            Ok(released) => released,
            Err(e) => {
                warn!(instance_id = %self.instance_id, error = %e, "Release failed");
                false
            }
        };
        self.set_state(LeadershipState::Unclaimed);
        self.renew_failures.store(0, Ordering::SeqCst);
        if released {
            info!(instance_id = %self.instance_id, "Leadership released");
        }
        released
    }

    /// Teardown-path release that can complete even while the normal
    /// pipeline is being torn down.
    pub async fn release_best_effort(&self) {
        self.arbiter.release_best_effort(&self.instance_id).await;
        self.set_state(LeadershipState::Unclaimed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
