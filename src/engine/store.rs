use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedTrip = Arc<RwLock<Trip>>;
pub type SharedClaim = Arc<RwLock<Claim>>;

/// Record maps plus the trip → claims index. Each record has its own lock;
/// the maps only hand out `Arc`s.
pub struct InMemoryStore {
    trips: DashMap<Ulid, SharedTrip>,
    claims: DashMap<Ulid, SharedClaim>,
    claims_by_trip: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            trips: DashMap::new(),
            claims: DashMap::new(),
            claims_by_trip: DashMap::new(),
        }
    }

    // ── Trips ────────────────────────────────────────────────

    pub fn trip_count(&self) -> usize {
        self.trips.len()
    }

    pub fn contains_trip(&self, id: &Ulid) -> bool {
        self.trips.contains_key(id)
    }

    pub fn get_trip(&self, id: &Ulid) -> Option<SharedTrip> {
        self.trips.get(id).map(|e| e.value().clone())
    }

    pub fn insert_trip(&self, trip: Trip) {
        self.trips.insert(trip.id, Arc::new(RwLock::new(trip)));
    }

    pub fn trip_ids(&self) -> Vec<Ulid> {
        self.trips.iter().map(|e| *e.key()).collect()
    }

    // ── Claims ───────────────────────────────────────────────

    pub fn contains_claim(&self, id: &Ulid) -> bool {
        self.claims.contains_key(id)
    }

    pub fn get_claim(&self, id: &Ulid) -> Option<SharedClaim> {
        self.claims.get(id).map(|e| e.value().clone())
    }

    pub fn insert_claim(&self, claim: Claim) {
        self.claims_by_trip.entry(claim.trip_id).or_default().push(claim.id);
        self.claims.insert(claim.id, Arc::new(RwLock::new(claim)));
    }

    pub fn claim_ids(&self) -> Vec<Ulid> {
        self.claims.iter().map(|e| *e.key()).collect()
    }

    /// Claim ids of a trip in creation order.
    pub fn claims_of(&self, trip_id: &Ulid) -> Vec<Ulid> {
        self.claims_by_trip
            .get(trip_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

/// Apply the trip-side effect of `event`. Caller holds the trip's write lock.
pub(crate) fn apply_to_trip(trip: &mut Trip, event: &Event) {
    match event {
        Event::ClaimAccepted { id, driver_id, at, .. } => {
            trip.status = TripStatus::Claimed;
            trip.owner_id = Some(driver_id.clone());
            trip.accepted_claim_id = Some(*id);
            trip.claimed_at = Some(*at);
            trip.updated_at = *at;
        }
        Event::TripStatusChanged { status, cancelled_by, at, .. } => {
            trip.status = *status;
            if cancelled_by.is_some() {
                trip.cancelled_by = *cancelled_by;
            }
            trip.updated_at = *at;
        }
        Event::TripCreated { .. }
        | Event::ClaimCreated { .. }
        | Event::ClaimAttempted { .. }
        | Event::ClaimDecided { .. } => return,
    }
    trip.version += 1;
}

/// Apply the claim-side effect of `event`. Caller holds the claim's write lock.
pub(crate) fn apply_to_claim(claim: &mut Claim, event: &Event) {
    match event {
        Event::ClaimAttempted { at, .. } => {
            claim.status = ClaimStatus::AttemptingAccept;
            claim.updated_at = *at;
        }
        Event::ClaimAccepted { at, .. } => {
            claim.status = ClaimStatus::Accepted;
            claim.decided_at = Some(*at);
            claim.reason = None;
            claim.updated_at = *at;
        }
        Event::ClaimDecided { status, reason, at, .. } => {
            claim.status = *status;
            claim.decided_at = Some(*at);
            claim.reason = Some(reason.clone());
            claim.updated_at = *at;
        }
        Event::TripCreated { .. }
        | Event::TripStatusChanged { .. }
        | Event::ClaimCreated { .. } => return,
    }
    claim.version += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_index_keeps_creation_order() {
        let store = InMemoryStore::new();
        let trip = Trip::new(Ulid::new(), "r".into(), 0);
        let tid = trip.id;
        store.insert_trip(trip);
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            store.insert_claim(Claim::new(*id, tid, format!("d{i}"), i as Ms));
        }
        assert_eq!(store.claims_of(&tid), ids);
        assert!(store.claims_of(&Ulid::new()).is_empty());
    }

    #[test]
    fn accepted_event_claims_trip_and_bumps_versions() {
        let mut trip = Trip::new(Ulid::new(), "r".into(), 0);
        let mut claim = Claim::new(Ulid::new(), trip.id, "d1".into(), 0);
        let event = Event::ClaimAccepted {
            id: claim.id,
            trip_id: trip.id,
            driver_id: "d1".into(),
            at: 42,
        };
        apply_to_trip(&mut trip, &event);
        apply_to_claim(&mut claim, &event);

        assert_eq!(trip.status, TripStatus::Claimed);
        assert_eq!(trip.owner_id.as_deref(), Some("d1"));
        assert_eq!(trip.claimed_at, Some(42));
        assert_eq!(trip.version, 1);
        assert_eq!(claim.status, ClaimStatus::Accepted);
        assert_eq!(claim.decided_at, Some(42));
        assert_eq!(claim.version, 1);
    }

    #[test]
    fn claim_only_events_leave_trip_version_alone() {
        let mut trip = Trip::new(Ulid::new(), "r".into(), 0);
        let event = Event::ClaimDecided {
            id: Ulid::new(),
            status: ClaimStatus::Rejected,
            reason: REASON_ALREADY_CLAIMED.into(),
            at: 5,
        };
        apply_to_trip(&mut trip, &event);
        assert_eq!(trip.version, 0);
        assert_eq!(trip.status, TripStatus::Pending);
    }

    #[test]
    fn lifecycle_change_keeps_owner() {
        let tid = Ulid::new();
        let mut trip = Trip::new(tid, "r".into(), 0);
        apply_to_trip(
            &mut trip,
            &Event::ClaimAccepted { id: Ulid::new(), trip_id: tid, driver_id: "d9".into(), at: 1 },
        );
        apply_to_trip(
            &mut trip,
            &Event::TripStatusChanged {
                id: tid,
                status: TripStatus::Cancelled,
                cancelled_by: Some(Party::Rider),
                at: 2,
            },
        );
        assert_eq!(trip.status, TripStatus::Cancelled);
        assert_eq!(trip.owner_id.as_deref(), Some("d9"));
        assert_eq!(trip.cancelled_by, Some(Party::Rider));
    }
}
