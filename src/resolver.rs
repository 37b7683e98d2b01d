//! Decides a single accept attempt: claim the trip if it is still pending,
//! otherwise reject the claim. The decision commits through
//! `TripStore::compare_and_set`, so two racing attempts can never both win;
//! the one that reads a stale version conflicts, re-reads, and loses.

use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_MS, MAX_RETRY_DELAY_MS};
use crate::model::*;
use crate::observability;
use crate::store::{CasWrite, ClaimCas, Decision, TripStore};

/// Bounded exponential backoff for transaction conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This call committed the decision.
    Decided(Outcome),
    /// The claim was terminal before this call; nothing was written.
    AlreadyResolved(ClaimStatus),
}

impl Resolution {
    pub fn outcome(self) -> Outcome {
        match self {
            Resolution::Decided(outcome) => outcome,
            Resolution::AlreadyResolved(status) => Outcome::of_terminal(status),
        }
    }
}

#[derive(Debug)]
pub enum ResolveError {
    ResourceNotFound(Ulid),
    ClaimNotFound(Ulid),
    /// The claim exists but belongs to another trip or driver.
    ClaimMismatch(Ulid),
    /// The claim is still plain `pending`; there is no attempt to decide.
    NotAttempting(Ulid),
    TransactionConflict { trip_id: Ulid, attempts: u32 },
    Store(EngineError),
}

impl ResolveError {
    /// Worth redelivering later.
    pub fn is_transient(&self) -> bool {
        match self {
            ResolveError::TransactionConflict { .. } => true,
            ResolveError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<EngineError> for ResolveError {
    fn from(e: EngineError) -> Self {
        ResolveError::Store(e)
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::ResourceNotFound(id) => write!(f, "trip not found: {id}"),
            ResolveError::ClaimNotFound(id) => write!(f, "claim not found: {id}"),
            ResolveError::ClaimMismatch(id) => {
                write!(f, "claim {id} does not match trip or driver")
            }
            ResolveError::NotAttempting(id) => write!(f, "claim {id} has no accept attempt"),
            ResolveError::TransactionConflict { trip_id, attempts } => {
                write!(f, "trip {trip_id}: transaction conflict after {attempts} attempts")
            }
            ResolveError::Store(e) => write!(f, "store: {e}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Resolve `claim_id`'s accept attempt on `trip_id`.
///
/// Redelivered attempts on a decided claim return `AlreadyResolved` without
/// touching anything. Conflicts are retried per `policy`; a missing trip is
/// reported immediately.
pub async fn resolve<S: TripStore + ?Sized>(
    store: &S,
    policy: &RetryPolicy,
    trip_id: Ulid,
    claim_id: Ulid,
    driver_id: &str,
) -> Result<Resolution, ResolveError> {
    let mut attempt = 1;
    loop {
        match try_resolve(store, trip_id, claim_id, driver_id).await {
            Err(ResolveError::Store(EngineError::Conflict(_))) => {
                if attempt >= policy.max_attempts {
                    warn!("trip {trip_id}: claim {claim_id} gave up after {attempt} conflicts");
                    metrics::counter!(observability::RESOLUTIONS_TOTAL, "outcome" => "conflict")
                        .increment(1);
                    return Err(ResolveError::TransactionConflict { trip_id, attempts: attempt });
                }
                let delay = policy.backoff(attempt);
                debug!(
                    "trip {trip_id}: claim {claim_id} conflicted on attempt {attempt}, \
                     retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => {
                metrics::histogram!(observability::RESOLUTION_ATTEMPTS).record(attempt as f64);
                let label = match &result {
                    Ok(Resolution::Decided(Outcome::Won)) => "won",
                    Ok(Resolution::Decided(Outcome::Lost)) => "lost",
                    Ok(Resolution::AlreadyResolved(_)) => "already_resolved",
                    Err(_) => "error",
                };
                metrics::counter!(observability::RESOLUTIONS_TOTAL, "outcome" => label)
                    .increment(1);
                return result;
            }
        }
    }
}

async fn try_resolve<S: TripStore + ?Sized>(
    store: &S,
    trip_id: Ulid,
    claim_id: Ulid,
    driver_id: &str,
) -> Result<Resolution, ResolveError> {
    let trip = store.load_trip(trip_id).await?.ok_or(ResolveError::ResourceNotFound(trip_id))?;
    let claim = store.load_claim(claim_id).await?.ok_or(ResolveError::ClaimNotFound(claim_id))?;
    if claim.trip_id != trip_id || claim.driver_id != driver_id {
        return Err(ResolveError::ClaimMismatch(claim_id));
    }
    if claim.status.is_terminal() {
        debug!("claim {claim_id} already {}", claim.status.as_str());
        return Ok(Resolution::AlreadyResolved(claim.status));
    }
    if claim.status != ClaimStatus::AttemptingAccept {
        return Err(ResolveError::NotAttempting(claim_id));
    }

    let at = now_ms();
    if trip.status != TripStatus::Pending {
        let write = CasWrite::Decide(Decision::rejected(at));
        store.compare_and_set(ClaimCas::over(&trip, &claim, write)).await?;
        info!("trip {trip_id}: claim {claim_id} by {driver_id} lost ({})", trip.status.as_str());
        return Ok(Resolution::Decided(Outcome::Lost));
    }

    let write = CasWrite::Claim { driver_id: driver_id.to_string(), at };
    store.compare_and_set(ClaimCas::over(&trip, &claim, write)).await?;
    info!("trip {trip_id}: claim {claim_id} by {driver_id} won");
    Ok(Resolution::Decided(Outcome::Won))
}
