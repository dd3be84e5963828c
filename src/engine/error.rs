use ulid::Ulid;

use crate::model::{BookingStatus, MachineStatus, SlotKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Machine,
    Booking,
}

impl Entity {
    fn as_str(&self) -> &'static str {
        match self {
            Entity::User => "user",
            Entity::Machine => "machine",
            Entity::Booking => "booking",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Missing or malformed input.
    Validation(String),
    NotFound(Entity, Ulid),
    AlreadyExists(Entity, Ulid),
    /// The session's principal is not a registered user.
    Unauthorized,
    Forbidden(&'static str),
    ResourceUnavailable(MachineStatus),
    CertificationRequired,
    SlotConflict {
        slot: SlotKey,
        reason: ConflictReason,
    },
    /// A status string outside the enumerated set.
    InvalidStatus(String),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The slot is in the machine's held set.
    Held,
    /// Another pending or approved booking already claims the slot.
    Claimed,
    /// Approval would make a second approved booking for the slot.
    ApprovedElsewhere,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(kind, id) => write!(f, "{} not found: {id}", kind.as_str()),
            EngineError::AlreadyExists(kind, id) => {
                write!(f, "{} already exists: {id}", kind.as_str())
            }
            EngineError::Unauthorized => write!(f, "unknown principal"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::ResourceUnavailable(status) => {
                write!(f, "machine is not available for booking (status: {status})")
            }
            EngineError::CertificationRequired => {
                write!(f, "certification required to book this machine")
            }
            EngineError::SlotConflict { slot, reason } => match reason {
                ConflictReason::Held => write!(f, "slot {slot} is already booked"),
                ConflictReason::Claimed => {
                    write!(f, "slot {slot} is already requested by another booking")
                }
                ConflictReason::ApprovedElsewhere => {
                    write!(f, "slot {slot} is already booked by another approved booking")
                }
            },
            EngineError::InvalidStatus(s) => write!(f, "invalid status: {s:?}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
