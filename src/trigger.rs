//! Reacts to the engine's change feed.
//!
//! Claim changes: only the edge into `attempting_accept` starts a
//! resolution; a win is followed by the rider's notification and the sibling
//! fan-out, a loss by the driver's. Trip changes produce lifecycle
//! notifications, and a trip cancelled while still pending takes its pending
//! claims down with it.
//!
//! Every handler tolerates being run twice for the same change.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::engine::{Engine, EngineError, MutationFeed};
use crate::fanout::{retire_all, supersede};
use crate::model::*;
use crate::notify::{notify_logged, Notifier, NotifyPayload, TemplateKind};
use crate::resolver::{resolve, ResolveError, Resolution, RetryPolicy};
use crate::store::{Decision, TripStore};

pub async fn on_claim_mutation<S, N>(
    store: &S,
    notifier: &N,
    policy: &RetryPolicy,
    change: &ClaimMutation,
) -> Result<Option<Resolution>, ResolveError>
where
    S: TripStore + ?Sized,
    N: Notifier + ?Sized,
{
    if !change.is_accept_attempt() {
        return Ok(None);
    }
    let resolution =
        resolve(store, policy, change.trip_id, change.claim_id, &change.driver_id).await?;

    match resolution {
        Resolution::Decided(Outcome::Won) => {
            if let Some(trip) = store.load_trip(change.trip_id).await? {
                let kind = TemplateKind::TripAccepted;
                let payload = NotifyPayload::from_template(kind, trip.id, Some(change.claim_id))
                    .with_data("driver_id", change.driver_id.clone());
                notify_logged(notifier, &trip.rider_id, kind, &payload).await;
            }
            fan_out(store, notifier, policy, change).await;
        }
        // Redelivered win: the fan-out may not have finished last time.
        Resolution::AlreadyResolved(ClaimStatus::Accepted) => {
            fan_out(store, notifier, policy, change).await
        }
        Resolution::Decided(Outcome::Lost) => {
            let kind = TemplateKind::ClaimRejected;
            let payload = NotifyPayload::from_template(kind, change.trip_id, Some(change.claim_id))
                .with_data("reason", REASON_ALREADY_CLAIMED);
            notify_logged(notifier, &change.driver_id, kind, &payload).await;
        }
        Resolution::AlreadyResolved(_) => {}
    }
    Ok(Some(resolution))
}

async fn fan_out<S, N>(store: &S, notifier: &N, policy: &RetryPolicy, change: &ClaimMutation)
where
    S: TripStore + ?Sized,
    N: Notifier + ?Sized,
{
    if let Err(e) = supersede(store, notifier, policy, change.trip_id, change.claim_id).await {
        warn!("trip {}: fan-out failed: {e}", change.trip_id);
    }
}

/// Lifecycle notifications for an external trip status change.
pub async fn on_trip_mutation<S, N>(
    store: &S,
    notifier: &N,
    policy: &RetryPolicy,
    change: &TripMutation,
) -> Result<(), EngineError>
where
    S: TripStore + ?Sized,
    N: Notifier + ?Sized,
{
    let Some(trip) = store.load_trip(change.trip_id).await? else {
        return Err(EngineError::NotFound(change.trip_id));
    };
    let mut recipients: Vec<&str> = Vec::new();
    let kind = match change.current {
        TripStatus::InProgress => {
            recipients.push(&trip.rider_id);
            TemplateKind::TripStarted
        }
        TripStatus::Completed => {
            recipients.push(&trip.rider_id);
            recipients.extend(trip.owner_id.as_deref());
            TemplateKind::TripCompleted
        }
        TripStatus::Cancelled => {
            match trip.cancelled_by {
                Some(Party::Rider) => recipients.extend(trip.owner_id.as_deref()),
                Some(Party::Driver) => recipients.push(&trip.rider_id),
                None => {
                    recipients.push(&trip.rider_id);
                    recipients.extend(trip.owner_id.as_deref());
                }
            }
            TemplateKind::TripCancelled
        }
        TripStatus::Pending | TripStatus::Claimed => return Ok(()),
    };

    let payload = NotifyPayload::from_template(kind, trip.id, trip.accepted_claim_id)
        .with_data("status", change.current.as_str());
    for recipient in recipients {
        notify_logged(notifier, recipient, kind, &payload).await;
    }

    if change.current == TripStatus::Cancelled && change.previous == TripStatus::Pending {
        let pending = store.pending_claims(trip.id).await?;
        let expired = retire_all(store, notifier, policy, &pending, TemplateKind::ClaimExpired, || {
            Decision::expired(REASON_TRIP_CANCELLED, now_ms())
        })
        .await;
        metrics::counter!(crate::observability::CLAIMS_EXPIRED_TOTAL).increment(expired as u64);
        debug!("trip {}: cancelled while pending, expired {expired} claims", trip.id);
    }
    Ok(())
}

async fn dispatch<N: Notifier + ?Sized>(
    engine: &Engine,
    notifier: &N,
    policy: &RetryPolicy,
    mutation: Mutation,
) {
    match mutation {
        Mutation::Claim(change) => {
            match on_claim_mutation(engine, notifier, policy, &change).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!("claim {}: resolution deferred to redelivery: {e}", change.claim_id);
                }
                Err(e) => error!("claim {}: resolution failed: {e}", change.claim_id),
            }
        }
        Mutation::Trip(change) => {
            if let Err(e) = on_trip_mutation(engine, notifier, policy, &change).await {
                error!("trip {}: lifecycle handling failed: {e}", change.trip_id);
            }
        }
    }
}

/// Drain `feed`, handling each mutation on its own task so changes to
/// different trips never wait on each other.
pub async fn run_dispatcher<N>(
    engine: Arc<Engine>,
    mut feed: MutationFeed,
    notifier: Arc<N>,
    policy: RetryPolicy,
) where
    N: Notifier + ?Sized + 'static,
{
    while let Some(mutation) = feed.recv().await {
        let engine = engine.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move { dispatch(&engine, &*notifier, &policy, mutation).await });
    }
    debug!("mutation feed closed; dispatcher exiting");
}
