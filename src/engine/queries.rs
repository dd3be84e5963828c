use std::cmp::Reverse;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, Entity};

/// Newest slot date first; ties broken by most recent request.
fn sort_newest_first(bookings: &mut [Booking]) {
    bookings.sort_by_key(|b| (Reverse(b.date), Reverse(b.created_at), Reverse(b.id)));
}

fn cached_name(name: &Option<String>) -> Option<String> {
    name.as_ref().filter(|n| !n.trim().is_empty()).cloned()
}

impl Engine {
    pub fn get_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.booking_snapshot(&id)?;
        if !principal.may_access(&booking.user_id) {
            return Err(EngineError::Forbidden("booking belongs to another user"));
        }
        Ok(booking)
    }

    /// A user's bookings, newest date first. Members may only list their own.
    pub fn list_bookings_for_user(
        &self,
        principal: &Principal,
        user_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        if !principal.may_access(&user_id) {
            return Err(EngineError::Forbidden("cannot list another user's bookings"));
        }
        let ids = self
            .users
            .get(&user_id)
            .map(|u| u.bookings.clone())
            .ok_or(EngineError::NotFound(Entity::User, user_id))?;
        let mut bookings: Vec<Booking> = ids
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
            .collect();
        sort_newest_first(&mut bookings);
        Ok(bookings)
    }

    /// Every booking on a machine, including bookings orphaned by its deletion.
    pub fn list_bookings_for_machine(
        &self,
        principal: &Principal,
        machine_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        if !principal.is_admin {
            return Err(EngineError::Forbidden("administrator required"));
        }
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.machine_id == machine_id)
            .map(|b| b.value().clone())
            .collect();
        sort_newest_first(&mut bookings);
        Ok(bookings)
    }

    /// Admin view of every booking with display names resolved.
    pub async fn list_all_bookings(&self, principal: &Principal) -> Result<Vec<BookingView>, EngineError> {
        if !principal.is_admin {
            return Err(EngineError::Forbidden("administrator required"));
        }
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|b| b.value().clone()).collect();
        sort_newest_first(&mut bookings);

        let mut views = Vec::with_capacity(bookings.len());
        for booking in bookings {
            views.push(self.enrich(booking).await);
        }
        Ok(views)
    }

    /// Prefer the names captured at creation, fall back to a live lookup.
    pub async fn enrich(&self, booking: Booking) -> BookingView {
        let user_name = match cached_name(&booking.user_name) {
            Some(n) => n,
            None => self
                .users
                .get(&booking.user_id)
                .map(|u| u.name.clone())
                .unwrap_or_else(|| "unknown user".to_string()),
        };
        let machine_name = match cached_name(&booking.machine_name) {
            Some(n) => n,
            None => match self.machine_state(&booking.machine_id) {
                Some(rs) => rs.read().await.machine.name.clone(),
                None => "unknown machine".to_string(),
            },
        };
        BookingView {
            booking,
            user_name,
            machine_name,
        }
    }

    /// Slots on `date` claimed by a pending or approved booking, in slot order.
    /// Claimant identities are not exposed.
    pub async fn claimed_slots(&self, machine_id: Ulid, date: &str) -> Result<Vec<SlotClaim>, EngineError> {
        let day = normalize_date(date)
            .ok_or_else(|| EngineError::Validation(format!("unrecognized date: {date:?}")))?;
        let rs = self
            .machine_state(&machine_id)
            .ok_or(EngineError::NotFound(Entity::Machine, machine_id))?;
        let guard = rs.read().await;

        // Every key for `day` starts with this prefix, which is also the smallest such key.
        let floor = SlotKey::new(day, "");
        let mut claims = Vec::new();
        for (slot, ids) in guard.claims.range(floor.clone()..) {
            if !slot.as_str().starts_with(floor.as_str()) {
                break;
            }
            for id in ids {
                if let Some(b) = self.bookings.get(id)
                    && b.status.claims_slot()
                {
                    claims.push(SlotClaim {
                        slot: slot.clone(),
                        time: b.time.clone(),
                        status: b.status,
                    });
                }
            }
        }
        Ok(claims)
    }
}
