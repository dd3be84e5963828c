mod admission;
mod bookings;
mod compaction;
mod conflict;
mod error;
mod queries;
mod registry;

pub use admission::can_book;
pub use bookings::BookingRequest;
pub use error::{ConflictReason, EngineError, Entity};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedMachineState = Arc<RwLock<MachineState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then does one flush + fsync and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("wal writer for {} stopped", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, &mut vec![(event, response)]),
    }
}

/// One makerspace site: users, machines, and bookings, plus the WAL they replay from.
///
/// Lock order: `commit_gate` (read) → `registry` → a machine's `RwLock`.
/// Booking mutations skip `registry` and hold only the machine lock.
pub struct Engine {
    pub(super) machines: DashMap<Ulid, SharedMachineState>,
    pub(super) users: DashMap<Ulid, UserRecord>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation from check to apply; compaction takes it
    /// exclusively so its snapshot and the log swap see no in-flight writes.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes user, certification, and machine registry changes.
    pub(super) registry: Mutex<()>,
}

/// Apply an event to in-memory state. The caller holds the machine's write
/// lock and passes its state when the event concerns a live machine.
fn apply_event(
    machine: Option<&mut MachineState>,
    event: &Event,
    users: &DashMap<Ulid, UserRecord>,
    bookings: &DashMap<Ulid, Booking>,
) {
    match event {
        Event::UserRegistered { id, name, is_admin } => {
            users.insert(*id, UserRecord::new(*id, name.clone(), *is_admin));
        }
        Event::UserUpdated { id, name, is_admin } => {
            if let Some(mut user) = users.get_mut(id) {
                user.name = name.clone();
                user.is_admin = *is_admin;
            }
        }
        Event::CertificationGranted { user_id, machine_id } => {
            if let Some(mut user) = users.get_mut(user_id) {
                user.certifications.insert(*machine_id);
            }
        }
        Event::CertificationRevoked { user_id, machine_id } => {
            if let Some(mut user) = users.get_mut(user_id) {
                user.certifications.remove(machine_id);
            }
        }
        Event::MachineUpdated {
            name,
            kind,
            requires_certification,
            status,
            maintenance_note,
            ..
        } => {
            if let Some(ms) = machine {
                ms.machine.name = name.clone();
                ms.machine.kind = kind.clone();
                ms.machine.requires_certification = *requires_certification;
                ms.machine.status = *status;
                ms.machine.maintenance_note = maintenance_note.clone();
            }
        }
        Event::BookingCreated { booking } => {
            if let Some(ms) = machine {
                ms.index_booking(booking.slot_key(), booking.id);
            }
            if let Some(mut user) = users.get_mut(&booking.user_id)
                && !user.bookings.contains(&booking.id)
            {
                user.bookings.push(booking.id);
            }
            bookings.insert(booking.id, booking.clone());
        }
        Event::BookingStatusChanged { id, from, to, at, .. } => {
            let slot = match bookings.get_mut(id) {
                Some(mut booking) => {
                    booking.status = *to;
                    booking.updated_at = *at;
                    booking.slot_key()
                }
                None => return,
            };
            if let Some(ms) = machine {
                if from.holds_slot() && !to.holds_slot() {
                    ms.machine.release_slot(&slot);
                }
                if to.holds_slot() && !from.holds_slot() {
                    ms.machine.hold_slot(slot);
                }
            }
        }
        Event::BookingDeleted { id, user_id, .. } => {
            if let Some((_, booking)) = bookings.remove(id)
                && let Some(ms) = machine
            {
                let slot = booking.slot_key();
                if booking.status.holds_slot() {
                    ms.machine.release_slot(&slot);
                }
                ms.unindex_booking(&slot, id);
            }
            if let Some(mut user) = users.get_mut(user_id) {
                user.bookings.retain(|b| b != id);
            }
        }
        // Created/Deleted are handled at the map level, not here
        Event::MachineCreated { .. } | Event::MachineDeleted { .. } => {}
    }
}

/// The machine an event is scoped to, if any.
fn event_machine_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::MachineUpdated { id, .. } => Some(*id),
        Event::BookingCreated { booking } => Some(booking.machine_id),
        Event::BookingStatusChanged { machine_id, .. } | Event::BookingDeleted { machine_id, .. } => {
            Some(*machine_id)
        }
        Event::UserRegistered { .. }
        | Event::UserUpdated { .. }
        | Event::CertificationGranted { .. }
        | Event::CertificationRevoked { .. }
        | Event::MachineCreated { .. }
        | Event::MachineDeleted { .. } => None,
    }
}

fn machine_from_event(event: &Event) -> Option<MachineState> {
    let Event::MachineCreated {
        id,
        name,
        kind,
        requires_certification,
        status,
        maintenance_note,
        held_slots,
    } = event
    else {
        return None;
    };
    let mut machine = Machine::new(*id, name.clone(), kind.clone(), *requires_certification);
    machine.status = *status;
    machine.maintenance_note = maintenance_note.clone();
    machine.held_slots = held_slots.iter().cloned().collect();
    Some(MachineState::new(machine))
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Needs a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let users = DashMap::new();
        let bookings = DashMap::new();
        // Replay into plain maps; locks are only introduced once the engine is shared.
        let mut machines: HashMap<Ulid, MachineState> = HashMap::new();

        for event in &events {
            match event {
                Event::MachineCreated { id, .. } => {
                    if let Some(ms) = machine_from_event(event) {
                        machines.insert(*id, ms);
                    }
                }
                Event::MachineDeleted { id } => {
                    machines.remove(id);
                }
                other => {
                    let ms = event_machine_id(other).and_then(|mid| machines.get_mut(&mid));
                    apply_event(ms, other, &users, &bookings);
                }
            }
        }

        tracing::info!(
            "replayed {} events from {}: {} users, {} machines, {} bookings",
            events.len(),
            wal_path.display(),
            users.len(),
            machines.len(),
            bookings.len()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            machines: machines
                .into_iter()
                .map(|(id, ms)| (id, Arc::new(RwLock::new(ms))))
                .collect(),
            users,
            bookings,
            wal_tx,
            commit_gate: RwLock::new(()),
            registry: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make an event durable, then apply it. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        machine: Option<&mut MachineState>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(machine, event, &self.users, &self.bookings);
        Ok(())
    }

    pub(super) fn machine_state(&self, id: &Ulid) -> Option<SharedMachineState> {
        self.machines.get(id).map(|e| e.value().clone())
    }

    pub(super) fn booking_snapshot(&self, id: &Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get(id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(Entity::Booking, *id))
    }

    pub(super) fn user_snapshot(&self, id: &Ulid) -> Option<UserRecord> {
        self.users.get(id).map(|u| u.value().clone())
    }

    /// Resolve a session login to a principal. The operator login is a
    /// built-in admin; any other login must be a registered user's id.
    pub fn principal_for_login(&self, login: &str, operator_login: &str) -> Result<Principal, EngineError> {
        if login == operator_login {
            return Ok(Principal::operator());
        }
        let id = Ulid::from_string(login).map_err(|_| EngineError::Unauthorized)?;
        self.users
            .get(&id)
            .map(|u| Principal {
                user_id: u.id,
                is_admin: u.is_admin,
            })
            .ok_or(EngineError::Unauthorized)
    }

    pub fn has_certification(&self, user_id: &Ulid, machine_id: &Ulid) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|u| u.is_certified_for(machine_id))
    }
}
