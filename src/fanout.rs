//! Retires the pending siblings of a won claim.
//!
//! Each sibling is its own unit of work with its own retries: some may fail
//! while others succeed, and a sibling that already left `pending` is skipped.
//! Nothing here re-checks who owns the trip.

use futures::future::join_all;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;
use crate::notify::{notify_logged, Notifier, NotifyPayload, TemplateKind};
use crate::observability;
use crate::resolver::RetryPolicy;
use crate::store::{Decision, TripStore};

/// Move every `pending` claim of `trip_id` other than `winning_claim_id` to
/// `superseded` and tell each driver. Returns how many claims this call moved.
pub async fn supersede<S, N>(
    store: &S,
    notifier: &N,
    policy: &RetryPolicy,
    trip_id: Ulid,
    winning_claim_id: Ulid,
) -> Result<usize, EngineError>
where
    S: TripStore + ?Sized,
    N: Notifier + ?Sized,
{
    let siblings: Vec<Claim> = store
        .pending_claims(trip_id)
        .await?
        .into_iter()
        .filter(|c| c.id != winning_claim_id)
        .collect();

    let moved = retire_all(store, notifier, policy, &siblings, TemplateKind::ClaimSuperseded, || {
        Decision::superseded(now_ms())
    })
    .await;
    metrics::counter!(observability::CLAIMS_SUPERSEDED_TOTAL).increment(moved as u64);
    debug!("trip {trip_id}: superseded {moved} of {} pending claims", siblings.len());
    Ok(moved)
}

/// Retire each of `claims` independently and notify its driver with `kind`
/// after the transition commits. Returns the number actually moved.
pub(crate) async fn retire_all<S, N>(
    store: &S,
    notifier: &N,
    policy: &RetryPolicy,
    claims: &[Claim],
    kind: TemplateKind,
    decide: impl Fn() -> Decision,
) -> usize
where
    S: TripStore + ?Sized,
    N: Notifier + ?Sized,
{
    let work = claims
        .iter()
        .map(|claim| retire_one(store, notifier, policy, claim, kind, decide()));
    join_all(work).await.into_iter().filter(|moved| *moved).count()
}

async fn retire_one<S, N>(
    store: &S,
    notifier: &N,
    policy: &RetryPolicy,
    claim: &Claim,
    kind: TemplateKind,
    decision: Decision,
) -> bool
where
    S: TripStore + ?Sized,
    N: Notifier + ?Sized,
{
    let reason = decision.reason.clone();
    let mut attempt = 1;
    let moved = loop {
        match store.retire_claim(claim.id, decision.clone()).await {
            Ok(moved) => break moved,
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                debug!("claim {}: retire attempt {attempt} failed: {e}", claim.id);
                tokio::time::sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("claim {}: could not move to {}: {e}", claim.id, decision.status.as_str());
                metrics::counter!(observability::FANOUT_FAILURES_TOTAL).increment(1);
                return false;
            }
        }
    };
    if !moved {
        debug!("claim {} left pending on its own", claim.id);
        return false;
    }

    let payload = NotifyPayload::from_template(kind, claim.trip_id, Some(claim.id))
        .with_data("reason", reason);
    notify_logged(notifier, &claim.driver_id, kind, &payload).await;
    true
}
