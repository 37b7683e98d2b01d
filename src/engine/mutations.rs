use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::{apply_to_claim, apply_to_trip};
use super::{Engine, EngineError, WalCommand};

fn validate_user_id(id: &str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::LimitExceeded("user id is empty"));
    }
    if id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_trip(&self, id: Ulid, rider_id: UserId) -> Result<(), EngineError> {
        validate_user_id(&rider_id)?;
        let _gate = self.write_gate.read().await;
        if self.records.trip_count() >= MAX_TRIPS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many trips"));
        }
        if self.records.contains_trip(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let at = now_ms();
        let event = Event::TripCreated { id, rider_id: rider_id.clone(), at };
        self.wal_append(&event).await?;
        self.records.insert_trip(Trip::new(id, rider_id, at));
        Ok(())
    }

    /// Register a driver's claim on a trip that is still `pending`.
    pub async fn create_claim(
        &self,
        id: Ulid,
        trip_id: Ulid,
        driver_id: UserId,
    ) -> Result<(), EngineError> {
        validate_user_id(&driver_id)?;
        let _gate = self.write_gate.read().await;
        if self.records.contains_claim(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let trip = self.records.get_trip(&trip_id).ok_or(EngineError::NotFound(trip_id))?;
        // Held across the insert so a resolution cannot claim the trip mid-way.
        let trip = trip.read().await;
        if trip.status != TripStatus::Pending {
            return Err(EngineError::NotClaimable { trip_id, status: trip.status });
        }

        let siblings = self.records.claims_of(&trip_id);
        if siblings.len() >= MAX_CLAIMS_PER_TRIP {
            return Err(EngineError::LimitExceeded("too many claims on trip"));
        }
        for sibling in &siblings {
            if let Some(claim) = self.records.get_claim(sibling)
                && claim.read().await.driver_id == driver_id
            {
                return Err(EngineError::DuplicateClaim { trip_id, driver_id });
            }
        }

        let at = now_ms();
        let event = Event::ClaimCreated { id, trip_id, driver_id: driver_id.clone(), at };
        self.wal_append(&event).await?;
        self.records.insert_claim(Claim::new(id, trip_id, driver_id.clone(), at));
        drop(trip);

        self.emit(Mutation::Claim(ClaimMutation {
            trip_id,
            claim_id: id,
            driver_id,
            previous: None,
            current: ClaimStatus::Pending,
        }));
        Ok(())
    }

    /// The driver's "accept" tap: `pending → attempting_accept`.
    ///
    /// Repeating it while the attempt is undecided changes nothing. Returns the
    /// claim's status after the call.
    pub async fn request_accept(&self, claim_id: Ulid) -> Result<ClaimStatus, EngineError> {
        let _gate = self.write_gate.read().await;
        let claim = self.records.get_claim(&claim_id).ok_or(EngineError::NotFound(claim_id))?;
        let mut claim = claim.write().await;
        match claim.status {
            ClaimStatus::Pending => {}
            ClaimStatus::AttemptingAccept => return Ok(ClaimStatus::AttemptingAccept),
            terminal => {
                return Err(EngineError::InvalidTransition {
                    id: claim_id,
                    from: terminal.as_str(),
                    to: ClaimStatus::AttemptingAccept.as_str(),
                });
            }
        }

        let event = Event::ClaimAttempted { id: claim_id, at: now_ms() };
        self.wal_append(&event).await?;
        apply_to_claim(&mut claim, &event);
        let mutation = ClaimMutation {
            trip_id: claim.trip_id,
            claim_id,
            driver_id: claim.driver_id.clone(),
            previous: Some(ClaimStatus::Pending),
            current: ClaimStatus::AttemptingAccept,
        };
        drop(claim);

        self.emit(Mutation::Claim(mutation));
        Ok(ClaimStatus::AttemptingAccept)
    }

    /// Externally driven lifecycle change. Never touches the trip's owner.
    /// Returns the status the trip had before.
    pub async fn update_trip_status(
        &self,
        trip_id: Ulid,
        status: TripStatus,
        cancelled_by: Option<Party>,
    ) -> Result<TripStatus, EngineError> {
        let _gate = self.write_gate.read().await;
        let trip = self.records.get_trip(&trip_id).ok_or(EngineError::NotFound(trip_id))?;
        let mut trip = trip.write().await;
        let previous = trip.status;
        if previous == status {
            return Ok(previous);
        }
        if !previous.allows_external(status) {
            return Err(EngineError::InvalidTransition {
                id: trip_id,
                from: previous.as_str(),
                to: status.as_str(),
            });
        }

        let cancelled_by = if status == TripStatus::Cancelled { cancelled_by } else { None };
        let event = Event::TripStatusChanged { id: trip_id, status, cancelled_by, at: now_ms() };
        self.wal_append(&event).await?;
        apply_to_trip(&mut trip, &event);
        drop(trip);

        info!("trip {trip_id}: {} -> {}", previous.as_str(), status.as_str());
        self.emit(Mutation::Trip(TripMutation { trip_id, previous, current: status }));
        Ok(previous)
    }

    /// Re-send the accept edge for a claim still waiting on resolution.
    /// Returns false if the claim is no longer `attempting_accept`.
    pub async fn redeliver(&self, claim_id: Ulid) -> bool {
        let Some(claim) = self.records.get_claim(&claim_id) else {
            return false;
        };
        let claim = claim.read().await;
        if claim.status != ClaimStatus::AttemptingAccept {
            return false;
        }
        self.emit(Mutation::Claim(ClaimMutation {
            trip_id: claim.trip_id,
            claim_id,
            driver_id: claim.driver_id.clone(),
            previous: Some(ClaimStatus::Pending),
            current: ClaimStatus::AttemptingAccept,
        }));
        true
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// Writers are held off for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        let mut trip_ids = self.records.trip_ids();
        trip_ids.sort();
        for trip_id in trip_ids {
            let Some(trip) = self.records.get_trip(&trip_id) else { continue };
            let trip = trip.read().await.clone();
            events.push(Event::TripCreated {
                id: trip.id,
                rider_id: trip.rider_id.clone(),
                at: trip.created_at,
            });

            for claim_id in self.records.claims_of(&trip_id) {
                let Some(claim) = self.records.get_claim(&claim_id) else { continue };
                let claim = claim.read().await.clone();
                events.push(Event::ClaimCreated {
                    id: claim.id,
                    trip_id,
                    driver_id: claim.driver_id.clone(),
                    at: claim.created_at,
                });
                let at = claim.decided_at.unwrap_or(claim.updated_at);
                match claim.status {
                    ClaimStatus::Pending => {}
                    ClaimStatus::AttemptingAccept => {
                        events.push(Event::ClaimAttempted { id: claim.id, at: claim.updated_at });
                    }
                    ClaimStatus::Accepted => events.push(Event::ClaimAccepted {
                        id: claim.id,
                        trip_id,
                        driver_id: claim.driver_id.clone(),
                        at: trip.claimed_at.unwrap_or(at),
                    }),
                    decided => events.push(Event::ClaimDecided {
                        id: claim.id,
                        status: decided,
                        reason: claim.reason.clone().unwrap_or_default(),
                        at,
                    }),
                }
            }

            if matches!(
                trip.status,
                TripStatus::InProgress | TripStatus::Completed | TripStatus::Cancelled
            ) {
                events.push(Event::TripStatusChanged {
                    id: trip.id,
                    status: trip.status,
                    cancelled_by: trip.cancelled_by,
                    at: trip.updated_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::AppendsSinceCompact { response: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
