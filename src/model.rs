use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for record timestamps only. Booking dates are calendar dates.
pub type Ms = i64;

// ── Slot keys ────────────────────────────────────────────────────

/// Reduce a booking date as supplied by a client to its calendar date.
///
/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD`, RFC 3339 timestamps and naive
/// date-times (`T` or space separated). The date is taken as written:
/// time-of-day and offset are dropped, not converted.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }
    None
}

/// `YYYY-MM-DD-<time>`: the unit of exclusivity on a machine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey(String);

impl SlotKey {
    pub fn new(date: NaiveDate, time: &str) -> Self {
        Self(format!("{}-{time}", date.format("%Y-%m-%d")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Status enums ─────────────────────────────────────────────────

/// Booking lifecycle:
///
/// ```text
/// Pending ──► Approved ──► Completed
///    │            │
///    ├──► Rejected└──► Canceled
///    └──► Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Completed,
    Canceled,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Completed => "completed",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Canceled | BookingStatus::Rejected
        )
    }

    /// Only an approved booking occupies its slot in the machine's held set.
    pub fn holds_slot(&self) -> bool {
        *self == BookingStatus::Approved
    }

    /// Pending and approved bookings both block a new request for the same slot.
    pub fn claims_slot(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Canceled)
                | (Approved, Completed)
                | (Approved, Canceled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status: {:?}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

/// The single place free-form status text becomes a `BookingStatus`.
impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "approved" => Ok(BookingStatus::Approved),
            "completed" => Ok(BookingStatus::Completed),
            "canceled" | "cancelled" => Ok(BookingStatus::Canceled),
            "rejected" => Ok(BookingStatus::Rejected),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineStatus {
    Available,
    Maintenance,
    OutOfOrder,
    InUse,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Available => "available",
            MachineStatus::Maintenance => "maintenance",
            MachineStatus::OutOfOrder => "out_of_order",
            MachineStatus::InUse => "in_use",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "available" => Ok(MachineStatus::Available),
            "maintenance" => Ok(MachineStatus::Maintenance),
            "outoforder" => Ok(MachineStatus::OutOfOrder),
            "inuse" => Ok(MachineStatus::InUse),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub machine_id: Ulid,
    pub date: NaiveDate,
    /// Opaque slot label, stored exactly as supplied.
    pub time: String,
    pub status: BookingStatus,
    /// Display names captured at creation. A cache, not a source of truth.
    pub user_name: Option<String>,
    pub machine_name: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.date, &self.time)
    }
}

/// A bookable machine. `held_slots` is written only by the reservation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
    pub status: MachineStatus,
    pub requires_certification: bool,
    pub maintenance_note: Option<String>,
    pub held_slots: BTreeSet<SlotKey>,
}

impl Machine {
    pub fn new(id: Ulid, name: String, kind: String, requires_certification: bool) -> Self {
        Self {
            id,
            name,
            kind,
            status: MachineStatus::Available,
            requires_certification,
            maintenance_note: None,
            held_slots: BTreeSet::new(),
        }
    }

    /// Idempotent. Returns true if the slot was newly held.
    pub fn hold_slot(&mut self, slot: SlotKey) -> bool {
        self.held_slots.insert(slot)
    }

    /// Idempotent. Returns true if the slot was held.
    pub fn release_slot(&mut self, slot: &SlotKey) -> bool {
        self.held_slots.remove(slot)
    }

    pub fn is_held(&self, slot: &SlotKey) -> bool {
        self.held_slots.contains(slot)
    }
}

/// Machine record plus the index of every booking that references it, by slot.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub machine: Machine,
    pub claims: BTreeMap<SlotKey, Vec<Ulid>>,
}

impl MachineState {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            claims: BTreeMap::new(),
        }
    }

    pub fn index_booking(&mut self, slot: SlotKey, booking_id: Ulid) {
        let ids = self.claims.entry(slot).or_default();
        if !ids.contains(&booking_id) {
            ids.push(booking_id);
        }
    }

    pub fn unindex_booking(&mut self, slot: &SlotKey, booking_id: &Ulid) {
        if let Some(ids) = self.claims.get_mut(slot) {
            ids.retain(|id| id != booking_id);
            if ids.is_empty() {
                self.claims.remove(slot);
            }
        }
    }

    /// Booking ids recorded against a slot, in creation order.
    pub fn bookings_for_slot(&self, slot: &SlotKey) -> &[Ulid] {
        self.claims.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn booking_ids(&self) -> impl Iterator<Item = &Ulid> {
        self.claims.values().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Ulid,
    pub name: String,
    pub is_admin: bool,
    pub certifications: BTreeSet<Ulid>,
    /// The user's booking list, oldest first.
    pub bookings: Vec<Ulid>,
}

impl UserRecord {
    pub fn new(id: Ulid, name: String, is_admin: bool) -> Self {
        Self {
            id,
            name,
            is_admin,
            certifications: BTreeSet::new(),
            bookings: Vec::new(),
        }
    }

    pub fn is_certified_for(&self, machine_id: &Ulid) -> bool {
        self.certifications.contains(machine_id)
    }
}

/// Who is acting. Supplied by the session layer and trusted as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub is_admin: bool,
}

impl Principal {
    pub fn member(user_id: Ulid) -> Self {
        Self { user_id, is_admin: false }
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self { user_id, is_admin: true }
    }

    /// Built-in administrator with no user record behind it.
    pub fn operator() -> Self {
        Self::admin(Ulid::nil())
    }

    pub fn is_operator(&self) -> bool {
        self.is_admin && self.user_id.is_nil()
    }

    /// Administrators may act on anything; members only on what they own.
    pub fn may_access(&self, owner: &Ulid) -> bool {
        self.is_admin || self.user_id == *owner
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// One event per mutation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        is_admin: bool,
    },
    UserUpdated {
        id: Ulid,
        name: String,
        is_admin: bool,
    },
    CertificationGranted {
        user_id: Ulid,
        machine_id: Ulid,
    },
    CertificationRevoked {
        user_id: Ulid,
        machine_id: Ulid,
    },
    /// `held_slots` is empty except when written by compaction.
    MachineCreated {
        id: Ulid,
        name: String,
        kind: String,
        requires_certification: bool,
        status: MachineStatus,
        maintenance_note: Option<String>,
        held_slots: Vec<SlotKey>,
    },
    MachineUpdated {
        id: Ulid,
        name: String,
        kind: String,
        requires_certification: bool,
        status: MachineStatus,
        maintenance_note: Option<String>,
    },
    MachineDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Applying this both moves the status and, when either side is
    /// `Approved`, adds or removes the held slot.
    BookingStatusChanged {
        id: Ulid,
        machine_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        machine_id: Ulid,
        user_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A booking with display names resolved for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub user_name: String,
    pub machine_name: String,
}

/// A claimed slot on a machine, without the claimant's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotClaim {
    pub slot: SlotKey,
    pub time: String,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub name: String,
    pub is_admin: bool,
    pub certifications: Vec<Ulid>,
    pub booking_count: usize,
}

impl From<&UserRecord> for UserInfo {
    fn from(u: &UserRecord) -> Self {
        Self {
            id: u.id,
            name: u.name.clone(),
            is_admin: u.is_admin,
            certifications: u.certifications.iter().copied().collect(),
            booking_count: u.bookings.len(),
        }
    }
}

/// Partial update of a machine's admin-editable fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachinePatch {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub status: Option<MachineStatus>,
    pub requires_certification: Option<bool>,
    /// `Some(None)` clears the note.
    pub maintenance_note: Option<Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn slot_key_format() {
        let key = SlotKey::new(d(2024, 6, 1), "10:00");
        assert_eq!(key.as_str(), "2024-06-01-10:00");
        assert_eq!(key.to_string(), "2024-06-01-10:00");
    }

    #[test]
    fn normalize_plain_date() {
        assert_eq!(normalize_date("2024-06-01"), Some(d(2024, 6, 1)));
        assert_eq!(normalize_date("  2024-06-01 "), Some(d(2024, 6, 1)));
        assert_eq!(normalize_date("2024/06/01"), Some(d(2024, 6, 1)));
    }

    #[test]
    fn normalize_drops_time_and_offset() {
        assert_eq!(normalize_date("2024-06-01T00:00:00.000Z"), Some(d(2024, 6, 1)));
        assert_eq!(normalize_date("2024-06-01T23:30:00-05:00"), Some(d(2024, 6, 1)));
        assert_eq!(normalize_date("2024-06-01T08:15:00"), Some(d(2024, 6, 1)));
        assert_eq!(normalize_date("2024-06-01 08:15"), Some(d(2024, 6, 1)));
    }

    #[test]
    fn differently_formatted_dates_collide() {
        let a = SlotKey::new(normalize_date("2024-06-01").unwrap(), "10:00");
        let b = SlotKey::new(normalize_date("2024-06-01T14:00:00Z").unwrap(), "10:00");
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert_eq!(normalize_date(""), None);
        assert_eq!(normalize_date("tomorrow"), None);
        assert_eq!(normalize_date("2024-13-01"), None);
        assert_eq!(normalize_date("2024-02-30"), None);
    }

    #[test]
    fn status_canonicalization() {
        assert_eq!("Approved".parse::<BookingStatus>(), Ok(BookingStatus::Approved));
        assert_eq!(" pending ".parse::<BookingStatus>(), Ok(BookingStatus::Pending));
        assert_eq!("cancelled".parse::<BookingStatus>(), Ok(BookingStatus::Canceled));
        assert_eq!("CANCELED".parse::<BookingStatus>(), Ok(BookingStatus::Canceled));
        assert!("done".parse::<BookingStatus>().is_err());
        assert!("".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn status_display_parses_back() {
        use BookingStatus::*;
        for s in [Pending, Approved, Completed, Canceled, Rejected] {
            assert_eq!(s.as_str().parse::<BookingStatus>(), Ok(s));
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use BookingStatus::*;
        let all = [Pending, Approved, Completed, Canceled, Rejected];
        for from in [Completed, Canceled, Rejected] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be closed");
            }
        }
    }

    #[test]
    fn allowed_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Pending.can_transition_to(Canceled));
        assert!(Approved.can_transition_to(Completed));
        assert!(Approved.can_transition_to(Canceled));

        assert!(!Pending.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Approved.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Approved.can_transition_to(Pending));
    }

    #[test]
    fn slot_occupancy_flags() {
        use BookingStatus::*;
        assert!(Approved.holds_slot());
        assert!(!Pending.holds_slot());
        assert!(Pending.claims_slot());
        assert!(Approved.claims_slot());
        assert!(!Rejected.claims_slot());
        assert!(!Canceled.claims_slot());
        assert!(!Completed.claims_slot());
    }

    #[test]
    fn machine_status_aliases() {
        assert_eq!("Available".parse::<MachineStatus>(), Ok(MachineStatus::Available));
        assert_eq!("out-of-order".parse::<MachineStatus>(), Ok(MachineStatus::OutOfOrder));
        assert_eq!("OutOfOrder".parse::<MachineStatus>(), Ok(MachineStatus::OutOfOrder));
        assert_eq!("in_use".parse::<MachineStatus>(), Ok(MachineStatus::InUse));
        assert!("broken".parse::<MachineStatus>().is_err());
    }

    #[test]
    fn hold_and_release_are_idempotent() {
        let mut m = Machine::new(Ulid::new(), "Laser".into(), "laser".into(), false);
        let slot = SlotKey::new(d(2024, 6, 1), "10:00");
        assert!(m.hold_slot(slot.clone()));
        assert!(!m.hold_slot(slot.clone()));
        assert_eq!(m.held_slots.len(), 1);
        assert!(m.release_slot(&slot));
        assert!(!m.release_slot(&slot));
        assert!(m.held_slots.is_empty());
    }

    #[test]
    fn claims_index() {
        let mut ms = MachineState::new(Machine::new(Ulid::new(), "Mill".into(), "cnc".into(), true));
        let slot = SlotKey::new(d(2024, 6, 1), "10:00");
        let (a, b) = (Ulid::new(), Ulid::new());
        ms.index_booking(slot.clone(), a);
        ms.index_booking(slot.clone(), b);
        ms.index_booking(slot.clone(), a);
        assert_eq!(ms.bookings_for_slot(&slot), &[a, b]);

        ms.unindex_booking(&slot, &a);
        assert_eq!(ms.bookings_for_slot(&slot), &[b]);
        ms.unindex_booking(&slot, &b);
        assert!(ms.claims.is_empty());
        assert_eq!(ms.booking_ids().count(), 0);
    }

    #[test]
    fn principal_access() {
        let owner = Ulid::new();
        assert!(Principal::member(owner).may_access(&owner));
        assert!(!Principal::member(Ulid::new()).may_access(&owner));
        assert!(Principal::admin(Ulid::new()).may_access(&owner));
        assert!(Principal::operator().is_operator());
        assert!(!Principal::admin(Ulid::new()).is_operator());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                user_id: Ulid::new(),
                machine_id: Ulid::new(),
                date: d(2024, 6, 1),
                time: "09:00-10:00".into(),
                status: BookingStatus::Pending,
                user_name: Some("Ada".into()),
                machine_name: None,
                created_at: 1,
                updated_at: 1,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
