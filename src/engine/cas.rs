use async_trait::async_trait;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::store::{CasWrite, ClaimCas, Decision, TripStore};

use super::store::{apply_to_claim, apply_to_trip};
use super::{Engine, EngineError};

#[async_trait]
impl TripStore for Engine {
    async fn load_trip(&self, id: Ulid) -> Result<Option<Trip>, EngineError> {
        Ok(self.trip(&id).await)
    }

    async fn load_claim(&self, id: Ulid) -> Result<Option<Claim>, EngineError> {
        Ok(self.claim(&id).await)
    }

    async fn compare_and_set(&self, cas: ClaimCas) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let trip_lock =
            self.records.get_trip(&cas.trip_id).ok_or(EngineError::NotFound(cas.trip_id))?;
        let claim_lock =
            self.records.get_claim(&cas.claim_id).ok_or(EngineError::NotFound(cas.claim_id))?;
        let mut trip = trip_lock.write().await;
        let mut claim = claim_lock.write().await;

        if trip.version != cas.trip_version
            || trip.status != cas.expected_trip_status
            || claim.version != cas.claim_version
        {
            debug!(
                "cas conflict on trip {}: trip v{} (read v{}), claim v{} (read v{})",
                cas.trip_id, trip.version, cas.trip_version, claim.version, cas.claim_version
            );
            metrics::counter!(crate::observability::TXN_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(cas.trip_id));
        }
        if claim.trip_id != trip.id {
            return Err(EngineError::NotFound(cas.claim_id));
        }

        let event = match cas.write {
            CasWrite::Claim { driver_id, at } => {
                if trip.status != TripStatus::Pending {
                    return Err(EngineError::InvalidTransition {
                        id: trip.id,
                        from: trip.status.as_str(),
                        to: TripStatus::Claimed.as_str(),
                    });
                }
                Event::ClaimAccepted { id: claim.id, trip_id: trip.id, driver_id, at }
            }
            CasWrite::Decide(Decision { status, reason, at }) => {
                Event::ClaimDecided { id: claim.id, status, reason, at }
            }
        };

        self.wal_append(&event).await?;
        let previous_trip = trip.status;
        let previous_claim = claim.status;
        apply_to_trip(&mut trip, &event);
        apply_to_claim(&mut claim, &event);

        let claim_change = ClaimMutation {
            trip_id: trip.id,
            claim_id: claim.id,
            driver_id: claim.driver_id.clone(),
            previous: Some(previous_claim),
            current: claim.status,
        };
        let trip_change = (trip.status != previous_trip).then(|| TripMutation {
            trip_id: trip.id,
            previous: previous_trip,
            current: trip.status,
        });
        drop(claim);
        drop(trip);

        self.emit(Mutation::Claim(claim_change));
        if let Some(change) = trip_change {
            self.emit(Mutation::Trip(change));
        }
        Ok(())
    }

    async fn pending_claims(&self, trip_id: Ulid) -> Result<Vec<Claim>, EngineError> {
        if !self.records.contains_trip(&trip_id) {
            return Err(EngineError::NotFound(trip_id));
        }
        Ok(self.claims_for_trip(&trip_id, Some(ClaimStatus::Pending)).await)
    }

    async fn retire_claim(&self, claim_id: Ulid, decision: Decision) -> Result<bool, EngineError> {
        let _gate = self.write_gate.read().await;
        let claim_lock = self.records.get_claim(&claim_id).ok_or(EngineError::NotFound(claim_id))?;
        let mut claim = claim_lock.write().await;
        if claim.status != ClaimStatus::Pending {
            return Ok(false);
        }

        let event = Event::ClaimDecided {
            id: claim_id,
            status: decision.status,
            reason: decision.reason,
            at: decision.at,
        };
        self.wal_append(&event).await?;
        apply_to_claim(&mut claim, &event);
        let change = ClaimMutation {
            trip_id: claim.trip_id,
            claim_id,
            driver_id: claim.driver_id.clone(),
            previous: Some(ClaimStatus::Pending),
            current: claim.status,
        };
        drop(claim);

        self.emit(Mutation::Claim(change));
        Ok(true)
    }
}
