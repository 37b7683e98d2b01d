use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Opaque rider/driver identifier assigned by the identity provider.
pub type UserId = String;

pub const REASON_ALREADY_CLAIMED: &str = "resource already claimed";
pub const REASON_SUPERSEDED: &str = "resource claimed by another party";
pub const REASON_TIMED_OUT: &str = "claim timed out";
pub const REASON_TRIP_CANCELLED: &str = "trip cancelled";

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TripStatus::Pending => "pending",
            TripStatus::Claimed => "claimed",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        }
    }

    /// Transitions external actors may request. `pending → claimed` is absent:
    /// only a won resolution claims a trip.
    pub fn allows_external(self, next: TripStatus) -> bool {
        matches!(
            (self, next),
            (TripStatus::Claimed, TripStatus::InProgress)
                | (TripStatus::InProgress, TripStatus::Completed)
                | (
                    TripStatus::Pending | TripStatus::Claimed | TripStatus::InProgress,
                    TripStatus::Cancelled
                )
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    /// The driver asked to take the trip; resolution has not decided yet.
    AttemptingAccept,
    Accepted,
    Rejected,
    Superseded,
    Expired,
}

impl ClaimStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::AttemptingAccept => "attempting_accept",
            ClaimStatus::Accepted => "accepted",
            ClaimStatus::Rejected => "rejected",
            ClaimStatus::Superseded => "superseded",
            ClaimStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClaimStatus::Accepted
                | ClaimStatus::Rejected
                | ClaimStatus::Superseded
                | ClaimStatus::Expired
        )
    }
}

/// Which side of a trip acted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Rider,
    Driver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Won,
    Lost,
}

impl Outcome {
    /// Outcome implied by a claim that already reached a terminal status.
    pub fn of_terminal(status: ClaimStatus) -> Outcome {
        if status == ClaimStatus::Accepted {
            Outcome::Won
        } else {
            Outcome::Lost
        }
    }
}

/// A trip request; the resource drivers compete for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trip {
    pub id: Ulid,
    pub rider_id: UserId,
    pub status: TripStatus,
    /// Set exactly once, by the winning resolution.
    pub owner_id: Option<UserId>,
    pub accepted_claim_id: Option<Ulid>,
    pub claimed_at: Option<Ms>,
    pub cancelled_by: Option<Party>,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Bumped on every applied change; read-validate-write checks it.
    pub version: u64,
}

impl Trip {
    pub fn new(id: Ulid, rider_id: UserId, at: Ms) -> Self {
        Self {
            id,
            rider_id,
            status: TripStatus::Pending,
            owner_id: None,
            accepted_claim_id: None,
            claimed_at: None,
            cancelled_by: None,
            created_at: at,
            updated_at: at,
            version: 0,
        }
    }
}

/// One driver's request to take a trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub id: Ulid,
    pub trip_id: Ulid,
    pub driver_id: UserId,
    pub status: ClaimStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub decided_at: Option<Ms>,
    pub reason: Option<String>,
    pub version: u64,
}

impl Claim {
    pub fn new(id: Ulid, trip_id: Ulid, driver_id: UserId, at: Ms) -> Self {
        Self {
            id,
            trip_id,
            driver_id,
            status: ClaimStatus::Pending,
            created_at: at,
            updated_at: at,
            decided_at: None,
            reason: None,
            version: 0,
        }
    }
}

// ── Change feed ──────────────────────────────────────────────────

/// Emitted for every claim status change. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMutation {
    pub trip_id: Ulid,
    pub claim_id: Ulid,
    pub driver_id: UserId,
    /// `None` when the claim was just created.
    pub previous: Option<ClaimStatus>,
    pub current: ClaimStatus,
}

impl ClaimMutation {
    /// True only for the edge into `attempting_accept`.
    pub fn is_accept_attempt(&self) -> bool {
        self.current == ClaimStatus::AttemptingAccept
            && self.previous != Some(ClaimStatus::AttemptingAccept)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripMutation {
    pub trip_id: Ulid,
    pub previous: TripStatus,
    pub current: TripStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Claim(ClaimMutation),
    Trip(TripMutation),
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat record format written to the WAL. Replaying these in order rebuilds all state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TripCreated {
        id: Ulid,
        rider_id: UserId,
        at: Ms,
    },
    TripStatusChanged {
        id: Ulid,
        status: TripStatus,
        cancelled_by: Option<Party>,
        at: Ms,
    },
    ClaimCreated {
        id: Ulid,
        trip_id: Ulid,
        driver_id: UserId,
        at: Ms,
    },
    ClaimAttempted {
        id: Ulid,
        at: Ms,
    },
    /// The winning commit: claims the trip and accepts the claim in one record.
    ClaimAccepted {
        id: Ulid,
        trip_id: Ulid,
        driver_id: UserId,
        at: Ms,
    },
    ClaimDecided {
        id: Ulid,
        status: ClaimStatus,
        reason: String,
        at: Ms,
    },
}
