use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    /// Snapshot of a trip.
    pub async fn trip(&self, id: &Ulid) -> Option<Trip> {
        let trip = self.records.get_trip(id)?;
        let snapshot = trip.read().await.clone();
        Some(snapshot)
    }

    /// Snapshot of a claim.
    pub async fn claim(&self, id: &Ulid) -> Option<Claim> {
        let claim = self.records.get_claim(id)?;
        let snapshot = claim.read().await.clone();
        Some(snapshot)
    }

    /// Claims of a trip in creation order, optionally filtered by status.
    pub async fn claims_for_trip(&self, trip_id: &Ulid, status: Option<ClaimStatus>) -> Vec<Claim> {
        let mut out = Vec::new();
        for claim_id in self.records.claims_of(trip_id) {
            if let Some(claim) = self.claim(&claim_id).await
                && status.is_none_or(|s| s == claim.status)
            {
                out.push(claim);
            }
        }
        out
    }

    /// Pending claims created at or before `now - ttl`.
    pub async fn collect_stale_pending(&self, now: Ms, ttl: Ms) -> Vec<Claim> {
        self.collect_claims(|c| c.status == ClaimStatus::Pending && c.created_at + ttl <= now)
            .await
    }

    /// Claims whose accept attempt has waited at least `after` ms without a decision.
    pub async fn collect_stalled_attempts(&self, now: Ms, after: Ms) -> Vec<Claim> {
        self.collect_claims(|c| {
            c.status == ClaimStatus::AttemptingAccept && c.updated_at + after <= now
        })
        .await
    }

    /// Trips that already left `pending` but still have `pending` claims,
    /// with those claims. These are leftovers of a fan-out or cancellation
    /// that did not finish.
    pub async fn collect_stranded_pending(&self) -> Vec<(Trip, Vec<Claim>)> {
        let mut trip_ids = self.records.trip_ids();
        trip_ids.sort();
        let mut out = Vec::new();
        for trip_id in trip_ids {
            let Some(trip) = self.trip(&trip_id).await else { continue };
            if trip.status == TripStatus::Pending {
                continue;
            }
            let pending = self.claims_for_trip(&trip_id, Some(ClaimStatus::Pending)).await;
            if !pending.is_empty() {
                out.push((trip, pending));
            }
        }
        out
    }

    async fn collect_claims(&self, keep: impl Fn(&Claim) -> bool) -> Vec<Claim> {
        let mut out = Vec::new();
        for claim_id in self.records.claim_ids() {
            if let Some(claim) = self.claim(&claim_id).await
                && keep(&claim)
            {
                out.push(claim);
            }
        }
        out.sort_by_key(|c| c.id);
        out
    }
}
