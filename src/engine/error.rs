use ulid::Ulid;

use crate::model::{TripStatus, UserId};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    DuplicateClaim { trip_id: Ulid, driver_id: UserId },
    NotClaimable { trip_id: Ulid, status: TripStatus },
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        to: &'static str,
    },
    /// A record changed between read and commit. Transient; replay the transaction.
    Conflict(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::DuplicateClaim { .. } => "duplicate_claim",
            EngineError::NotClaimable { .. } => "not_claimable",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Conflict(_) => "transaction_conflict",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateClaim { trip_id, driver_id } => {
                write!(f, "driver {driver_id} already has a claim on trip {trip_id}")
            }
            EngineError::NotClaimable { trip_id, status } => {
                write!(f, "trip {trip_id} is {} and no longer takes claims", status.as_str())
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "{id}: cannot move from {from} to {to}")
            }
            EngineError::Conflict(id) => write!(f, "transaction conflict on {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
