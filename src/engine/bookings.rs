use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::admit;
use super::conflict::{check_approvable, now_ms};
use super::{Engine, EngineError, Entity};

/// A booking request as it arrives from a client: fields may be missing
/// and the date is unnormalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    /// Book on behalf of this user (administrators only). Defaults to the principal.
    pub user_id: Option<Ulid>,
    pub machine_id: Option<Ulid>,
    pub date: Option<String>,
    pub time: Option<String>,
}

impl BookingRequest {
    pub fn new(machine_id: Ulid, date: impl Into<String>, time: impl Into<String>) -> Self {
        Self {
            user_id: None,
            machine_id: Some(machine_id),
            date: Some(date.into()),
            time: Some(time.into()),
        }
    }

    pub fn on_behalf_of(mut self, user_id: Ulid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

struct ValidRequest {
    owner: Ulid,
    machine_id: Ulid,
    slot_date: chrono::NaiveDate,
    time: String,
}

fn validate_request(principal: &Principal, req: BookingRequest) -> Result<ValidRequest, EngineError> {
    let machine_id = req
        .machine_id
        .ok_or_else(|| EngineError::Validation("machine_id is required".into()))?;
    let raw_date = req
        .date
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| EngineError::Validation("date is required".into()))?;
    let slot_date = normalize_date(&raw_date)
        .ok_or_else(|| EngineError::Validation(format!("unrecognized date: {raw_date:?}")))?;
    let time = req
        .time
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| EngineError::Validation("time is required".into()))?;
    if time.len() > MAX_TIME_LABEL_LEN {
        return Err(EngineError::LimitExceeded("time label too long"));
    }

    let owner = match req.user_id {
        Some(uid) if uid != principal.user_id && !principal.is_admin => {
            return Err(EngineError::Forbidden("cannot book on behalf of another user"));
        }
        Some(uid) => uid,
        None if principal.is_operator() => {
            return Err(EngineError::Validation(
                "user_id is required when booking as the operator".into(),
            ));
        }
        None => principal.user_id,
    };

    Ok(ValidRequest {
        owner,
        machine_id,
        slot_date,
        time,
    })
}

impl Engine {
    /// Request a machine slot. The booking starts `Pending` and the machine's
    /// held slots are untouched until an administrator approves it.
    ///
    /// `MAX_BOOKINGS_PER_SITE` is checked under the machine lock, so it is exact
    /// per machine but only approximate across concurrent creates on different machines.
    pub async fn create_booking(
        &self,
        principal: &Principal,
        req: BookingRequest,
    ) -> Result<Booking, EngineError> {
        let req = validate_request(principal, req)?;

        let _gate = self.commit_gate.read().await;
        let rs = self
            .machine_state(&req.machine_id)
            .ok_or(EngineError::NotFound(Entity::Machine, req.machine_id))?;
        let mut guard = rs.write().await;
        // A machine deleted while we waited for its lock stays deleted.
        if !self.machines.contains_key(&req.machine_id) {
            return Err(EngineError::NotFound(Entity::Machine, req.machine_id));
        }
        // Soft cap: creates on other machines hold other locks and may overshoot by a few.
        if self.bookings.len() >= MAX_BOOKINGS_PER_SITE {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        let owner = match self.user_snapshot(&req.owner) {
            Some(u) => u,
            None if req.owner == principal.user_id => return Err(EngineError::Unauthorized),
            None => return Err(EngineError::NotFound(Entity::User, req.owner)),
        };

        let slot = SlotKey::new(req.slot_date, &req.time);
        if let Err(e) = admit(principal, &owner, &guard, &slot, &self.bookings) {
            debug!("booking request by {} on machine {} rejected: {e}", owner.id, req.machine_id);
            return Err(e);
        }

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            user_id: owner.id,
            machine_id: req.machine_id,
            date: req.slot_date,
            time: req.time,
            status: BookingStatus::Pending,
            user_name: Some(owner.name.clone()),
            machine_name: Some(guard.machine.name.clone()),
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!("booking {} requested by {} for {} slot {slot}", booking.id, owner.id, req.machine_id);
        Ok(booking)
    }

    /// Set a booking's status from free-form text. Unknown values are `InvalidStatus`.
    pub async fn set_booking_status(
        &self,
        principal: &Principal,
        id: Ulid,
        status: &str,
    ) -> Result<Booking, EngineError> {
        let to: BookingStatus = status
            .parse()
            .map_err(|_| EngineError::InvalidStatus(status.to_string()))?;
        self.transition_booking(principal, id, to).await
    }

    pub async fn cancel_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(principal, id, BookingStatus::Canceled).await
    }

    /// Move a booking along its lifecycle, keeping the machine's held slots in
    /// step: entering `Approved` holds the slot, leaving it releases the slot.
    /// Members may only cancel their own bookings; every other move is admin-only.
    pub async fn transition_booking(
        &self,
        principal: &Principal,
        id: Ulid,
        to: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let snapshot = self.booking_snapshot(&id)?;
        if !principal.is_admin {
            if snapshot.user_id != principal.user_id {
                return Err(EngineError::Forbidden("booking belongs to another user"));
            }
            if to != BookingStatus::Canceled {
                return Err(EngineError::Forbidden("only administrators may change booking status"));
            }
        }

        let _gate = self.commit_gate.read().await;
        let rs = self
            .machine_state(&snapshot.machine_id)
            .ok_or(EngineError::NotFound(Entity::Machine, snapshot.machine_id))?;
        let mut guard = rs.write().await;
        if !self.machines.contains_key(&snapshot.machine_id) {
            return Err(EngineError::NotFound(Entity::Machine, snapshot.machine_id));
        }

        // Re-read under the machine lock; the snapshot may be stale.
        let current = self.booking_snapshot(&id)?;
        if !current.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to,
            });
        }

        let slot = current.slot_key();
        if to == BookingStatus::Approved {
            check_approvable(&guard, &slot, &id, &self.bookings)?;
        }

        let event = Event::BookingStatusChanged {
            id,
            machine_id: current.machine_id,
            from: current.status,
            to,
            at: now_ms(),
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;

        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str())
            .increment(1);
        info!("booking {id} {} -> {to} (slot {slot})", current.status);
        self.booking_snapshot(&id)
    }

    /// Remove a booking outright. The owner or an administrator may delete.
    ///
    /// An approved booking's slot is released in the same step. If the
    /// machine record is gone the booking is still removed.
    pub async fn delete_booking(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        let snapshot = self.booking_snapshot(&id)?;
        if !principal.may_access(&snapshot.user_id) {
            return Err(EngineError::Forbidden("booking belongs to another user"));
        }

        let _gate = self.commit_gate.read().await;
        let event = Event::BookingDeleted {
            id,
            machine_id: snapshot.machine_id,
            user_id: snapshot.user_id,
        };

        if let Some(rs) = self.machine_state(&snapshot.machine_id) {
            let mut guard = rs.write().await;
            // Machine removal takes this lock, so presence here is stable.
            if self.machines.contains_key(&snapshot.machine_id) {
                let current = self.booking_snapshot(&id)?;
                self.persist_and_apply(Some(&mut *guard), &event).await?;
                info!("booking {id} deleted (was {}, slot {})", current.status, current.slot_key());
                return Ok(());
            }
        }

        // Orphans have no machine lock; the registry lock serializes them.
        let _registry = self.registry.lock().await;
        let current = self.booking_snapshot(&id)?;
        if current.status.holds_slot() {
            warn!(
                "booking {id}: machine {} no longer exists, slot {} not released",
                current.machine_id,
                current.slot_key()
            );
        }
        self.persist_and_apply(None, &event).await?;
        info!("orphaned booking {id} deleted");
        Ok(())
    }
}
