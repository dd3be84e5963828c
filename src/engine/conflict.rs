use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::{ConflictReason, EngineError};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

fn conflict(slot: &SlotKey, reason: ConflictReason) -> EngineError {
    metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
    EngineError::SlotConflict {
        slot: slot.clone(),
        reason,
    }
}

/// A new request may only take a slot that is neither held nor claimed by
/// another pending or approved booking. Both are checked: the held set only
/// reflects approvals, and a pending claim must still block double submission.
pub(crate) fn check_slot_unclaimed(
    ms: &MachineState,
    slot: &SlotKey,
    bookings: &DashMap<Ulid, Booking>,
) -> Result<(), EngineError> {
    if ms.machine.is_held(slot) {
        return Err(conflict(slot, ConflictReason::Held));
    }
    let claimed = ms
        .bookings_for_slot(slot)
        .iter()
        .any(|id| bookings.get(id).is_some_and(|b| b.status.claims_slot()));
    if claimed {
        return Err(conflict(slot, ConflictReason::Claimed));
    }
    Ok(())
}

/// Approval fails if any other booking on the slot is already approved.
/// Pending rivals do not block: the admin rules on them separately.
pub(crate) fn check_approvable(
    ms: &MachineState,
    slot: &SlotKey,
    booking_id: &Ulid,
    bookings: &DashMap<Ulid, Booking>,
) -> Result<(), EngineError> {
    let rival_approved = ms
        .bookings_for_slot(slot)
        .iter()
        .filter(|id| *id != booking_id)
        .any(|id| {
            bookings
                .get(id)
                .is_some_and(|b| b.status == BookingStatus::Approved)
        });
    if rival_approved {
        return Err(conflict(slot, ConflictReason::ApprovedElsewhere));
    }
    Ok(())
}
