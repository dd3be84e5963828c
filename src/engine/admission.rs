use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::conflict::check_slot_unclaimed;
use super::EngineError;

/// `isAdmin OR !requiresCertification OR machine ∈ certifications`.
pub fn can_book(principal: &Principal, user: &UserRecord, machine: &Machine) -> bool {
    principal.is_admin || !machine.requires_certification || user.is_certified_for(&machine.id)
}

/// Gate a new booking request for `owner` on a machine.
///
/// An administrator principal skips every rule here in one place:
/// availability, certification, and the pending/held slot check. Admins may
/// therefore stage several pending requests for one slot; only one of them
/// can ever be approved.
pub(super) fn admit(
    principal: &Principal,
    owner: &UserRecord,
    ms: &MachineState,
    slot: &SlotKey,
    bookings: &DashMap<Ulid, Booking>,
) -> Result<(), EngineError> {
    if principal.is_admin {
        return Ok(());
    }
    if ms.machine.status != MachineStatus::Available {
        return Err(EngineError::ResourceUnavailable(ms.machine.status));
    }
    if !can_book(principal, owner, &ms.machine) {
        return Err(EngineError::CertificationRequired);
    }
    check_slot_unclaimed(ms, slot, bookings)
}
