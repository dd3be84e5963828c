use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Minimal event sequence that rebuilds the current state.
    ///
    /// Held slots travel inside `MachineCreated`; bookings are replayed with
    /// their current status in creation order so user booking lists keep it.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut users: Vec<UserRecord> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for user in &users {
            events.push(Event::UserRegistered {
                id: user.id,
                name: user.name.clone(),
                is_admin: user.is_admin,
            });
        }

        let states: Vec<_> = self.machines.iter().map(|e| e.value().clone()).collect();
        let mut machines = Vec::with_capacity(states.len());
        for rs in states {
            machines.push(rs.read().await.machine.clone());
        }
        machines.sort_by_key(|m| m.id);
        for m in machines {
            events.push(Event::MachineCreated {
                id: m.id,
                name: m.name,
                kind: m.kind,
                requires_certification: m.requires_certification,
                status: m.status,
                maintenance_note: m.maintenance_note,
                held_slots: m.held_slots.into_iter().collect(),
            });
        }

        for user in &users {
            for machine_id in &user.certifications {
                events.push(Event::CertificationGranted {
                    user_id: user.id,
                    machine_id: *machine_id,
                });
            }
        }

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|b| b.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));

        events
    }

    /// Rewrite the WAL as a snapshot. Mutations wait at the commit gate
    /// until the new log is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("wal compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
