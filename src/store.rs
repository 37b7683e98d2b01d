//! The storage seam the resolver and fan-out are written against.
//!
//! Only `compare_and_set` may move a trip out of `pending`, and it commits
//! only if nothing it was handed a version of has changed since the read.
//! `retire_claim` is the independent per-record update used for siblings.

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// Terminal status to give a claim, with its reason and decision time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub status: ClaimStatus,
    pub reason: String,
    pub at: Ms,
}

impl Decision {
    pub fn rejected(at: Ms) -> Self {
        Self {
            status: ClaimStatus::Rejected,
            reason: REASON_ALREADY_CLAIMED.into(),
            at,
        }
    }

    pub fn superseded(at: Ms) -> Self {
        Self {
            status: ClaimStatus::Superseded,
            reason: REASON_SUPERSEDED.into(),
            at,
        }
    }

    pub fn expired(reason: &str, at: Ms) -> Self {
        Self {
            status: ClaimStatus::Expired,
            reason: reason.into(),
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasWrite {
    /// Claim the trip for the claim's driver and accept the claim.
    Claim { driver_id: UserId, at: Ms },
    /// Decide the claim only; the trip is read but not written.
    Decide(Decision),
}

/// One read-validate-write transaction over a trip and one of its claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCas {
    pub trip_id: Ulid,
    pub expected_trip_status: TripStatus,
    pub trip_version: u64,
    pub claim_id: Ulid,
    pub claim_version: u64,
    pub write: CasWrite,
}

impl ClaimCas {
    /// Build a transaction that expects `trip` and `claim` to be exactly as read.
    pub fn over(trip: &Trip, claim: &Claim, write: CasWrite) -> Self {
        Self {
            trip_id: trip.id,
            expected_trip_status: trip.status,
            trip_version: trip.version,
            claim_id: claim.id,
            claim_version: claim.version,
            write,
        }
    }
}

#[async_trait]
pub trait TripStore: Send + Sync {
    async fn load_trip(&self, id: Ulid) -> Result<Option<Trip>, EngineError>;

    async fn load_claim(&self, id: Ulid) -> Result<Option<Claim>, EngineError>;

    /// Commit `cas` atomically, or fail with `EngineError::Conflict` if the
    /// trip or claim moved past the versions it was built from.
    async fn compare_and_set(&self, cas: ClaimCas) -> Result<(), EngineError>;

    async fn pending_claims(&self, trip_id: Ulid) -> Result<Vec<Claim>, EngineError>;

    /// Move one claim from `pending` to `decision.status`. `Ok(false)` when the
    /// claim had already left `pending`, which makes the call idempotent.
    async fn retire_claim(&self, claim_id: Ulid, decision: Decision) -> Result<bool, EngineError>;
}
