use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar nights. Ordered so iteration (and therefore WAL output) is stable.
pub type DateSet = BTreeSet<NaiveDate>;

/// How a room is handed out: as one unit, or bed by bed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationStrategy {
    WholeRoom,
    PerBed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomCategory {
    SharedDorm,
    Exclusive,
    Suite,
    Studio,
    SharedBathroom,
}

impl RoomCategory {
    pub fn strategy(self) -> AllocationStrategy {
        match self {
            RoomCategory::SharedDorm => AllocationStrategy::PerBed,
            RoomCategory::Exclusive
            | RoomCategory::Suite
            | RoomCategory::Studio
            | RoomCategory::SharedBathroom => AllocationStrategy::WholeRoom,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            RoomCategory::SharedDorm => "shared dorm",
            RoomCategory::Exclusive => "exclusive room",
            RoomCategory::Suite => "suite",
            RoomCategory::Studio => "studio",
            RoomCategory::SharedBathroom => "room with shared bathroom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomStatus {
    Vacant,
    Occupied,
}

/// Three-way reduction of a room's physical occupancy. Whole rooms are never `Partial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomOccupancy {
    Vacant,
    Partial,
    Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BedStatus {
    Vacant,
    Occupied,
    Available,
    Maintenance,
    Cleaning,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

/// Where a CONFIRMED reservation stands, derived from its check-in/check-out history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StayPhase {
    NotArrived,
    CheckedIn,
    CheckedOut,
}

/// A physical sleeping unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Unit {
    Room { room_id: Ulid },
    Bed { room_id: Ulid, bed_id: Ulid },
}

impl Unit {
    pub fn room_id(&self) -> Ulid {
        match self {
            Unit::Room { room_id } | Unit::Bed { room_id, .. } => *room_id,
        }
    }

    pub fn bed_id(&self) -> Option<Ulid> {
        match self {
            Unit::Room { .. } => None,
            Unit::Bed { bed_id, .. } => Some(*bed_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub number: u32,
    pub category: RoomCategory,
    /// Only authoritative for whole rooms; dorm status is derived from beds.
    pub status: RoomStatus,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bed {
    pub id: Ulid,
    pub room_id: Ulid,
    pub status: BedStatus,
}

/// Ledger entry: one unit, one reservation, the nights it holds there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEntry {
    pub id: Ulid,
    pub unit: Unit,
    pub reservation_id: Ulid,
    pub dates: DateSet,
}

/// Reservation-side pointer to a ledger entry stored with its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyRef {
    pub entry_id: Ulid,
    pub unit: Unit,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Append-only order; allocation walks beds in this order.
    pub beds: Vec<Bed>,
    /// Ledger entries for the room itself and for each of its beds.
    pub ledger: Vec<OccupancyEntry>,
    /// Checked-in reservations and the unit each one is sleeping in.
    pub occupants: Vec<(Unit, Ulid)>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            beds: Vec::new(),
            ledger: Vec::new(),
            occupants: Vec::new(),
        }
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.room.category.strategy()
    }

    pub fn bed(&self, id: &Ulid) -> Option<&Bed> {
        self.beds.iter().find(|b| b.id == *id)
    }

    pub fn bed_mut(&mut self, id: &Ulid) -> Option<&mut Bed> {
        self.beds.iter_mut().find(|b| b.id == *id)
    }

    pub fn insert_entry(&mut self, entry: OccupancyEntry) {
        self.ledger.push(entry);
    }

    pub fn remove_entry(&mut self, id: Ulid) -> Option<OccupancyEntry> {
        if let Some(pos) = self.ledger.iter().position(|e| e.id == id) {
            Some(self.ledger.remove(pos))
        } else {
            None
        }
    }

    pub fn entry_mut(&mut self, id: &Ulid) -> Option<&mut OccupancyEntry> {
        self.ledger.iter_mut().find(|e| e.id == *id)
    }

    /// Drop every entry owned by `reservation_id`, returning how many went.
    pub fn release_reservation(&mut self, reservation_id: Ulid) -> usize {
        let before = self.ledger.len();
        self.ledger.retain(|e| e.reservation_id != reservation_id);
        before - self.ledger.len()
    }

    pub fn entries_for(&self, reservation_id: Ulid) -> impl Iterator<Item = &OccupancyEntry> {
        self.ledger
            .iter()
            .filter(move |e| e.reservation_id == reservation_id)
    }

    /// Entries on `unit` sharing at least one night with `dates`, ignoring `exclude`'s own.
    pub fn conflicts<'a>(
        &'a self,
        unit: &'a Unit,
        dates: &'a DateSet,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &'a OccupancyEntry> {
        self.ledger.iter().filter(move |e| {
            e.unit == *unit
                && exclude != Some(e.reservation_id)
                && crate::dates::intersects(&e.dates, dates)
        })
    }

    /// Whether a reservation other than `reservation_id` is checked in on `unit`.
    pub fn occupied_by_other(&self, unit: &Unit, reservation_id: Ulid) -> bool {
        self.occupants
            .iter()
            .any(|(u, r)| u == unit && *r != reservation_id)
    }

    /// Mark `unit` OCCUPIED on behalf of `reservation_id`.
    pub fn occupy(&mut self, unit: Unit, reservation_id: Ulid) {
        if !self.occupants.contains(&(unit, reservation_id)) {
            self.occupants.push((unit, reservation_id));
        }
        self.set_unit_status(&unit, RoomStatus::Occupied, BedStatus::Occupied);
    }

    /// Drop `reservation_id` from `unit`. The unit goes VACANT only once nobody else
    /// is checked in on it.
    pub fn vacate(&mut self, unit: Unit, reservation_id: Ulid) {
        self.occupants
            .retain(|(u, r)| !(*u == unit && *r == reservation_id));
        if !self.occupants.iter().any(|(u, _)| *u == unit) {
            self.set_unit_status(&unit, RoomStatus::Vacant, BedStatus::Vacant);
        }
    }

    fn set_unit_status(&mut self, unit: &Unit, room: RoomStatus, bed: BedStatus) {
        match unit {
            Unit::Room { .. } => self.room.status = room,
            Unit::Bed { bed_id, .. } => {
                if let Some(b) = self.bed_mut(bed_id) {
                    b.status = bed;
                }
            }
        }
    }

    pub fn has_entries_on_bed(&self, bed_id: Ulid) -> bool {
        self.ledger.iter().any(|e| e.unit.bed_id() == Some(bed_id))
    }

    pub fn occupancy(&self) -> RoomOccupancy {
        match self.strategy() {
            AllocationStrategy::WholeRoom => match self.room.status {
                RoomStatus::Vacant => RoomOccupancy::Vacant,
                RoomStatus::Occupied => RoomOccupancy::Occupied,
            },
            AllocationStrategy::PerBed => {
                let occupied = self
                    .beds
                    .iter()
                    .filter(|b| b.status == BedStatus::Occupied)
                    .count();
                if occupied == 0 {
                    RoomOccupancy::Vacant
                } else if occupied == self.beds.len() {
                    RoomOccupancy::Occupied
                } else {
                    RoomOccupancy::Partial
                }
            }
        }
    }

    /// Two-valued status: a dorm only reads OCCUPIED once every bed is.
    pub fn status(&self) -> RoomStatus {
        match self.occupancy() {
            RoomOccupancy::Occupied => RoomStatus::Occupied,
            RoomOccupancy::Vacant | RoomOccupancy::Partial => RoomStatus::Vacant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: Ulid,
    pub name: String,
    pub document: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub reservations: BTreeSet<Ulid>,
}

/// Guest details as supplied by a caller; only `name` is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestInfo {
    pub name: String,
    pub document: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl GuestInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Price inputs captured on the reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    /// Nightly room price captured when the first room was attached.
    pub base_price: Decimal,
    pub custom_value: Option<Decimal>,
    pub use_custom_value: bool,
    /// Charged per extra guest per night.
    pub extra_guest_fee: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub status: ReservationStatus,
    pub reserved_days: DateSet,
    pub check_ins: Vec<DateTime<Utc>>,
    pub check_outs: Vec<DateTime<Utc>>,
    pub pricing: Pricing,
    pub financial_processed: bool,
    pub guests: Vec<Ulid>,
    pub rooms: Vec<Ulid>,
    pub occupancy: Vec<OccupancyRef>,
    /// Units the current stay set OCCUPIED; emptied at check-out.
    pub stay_units: Vec<Unit>,
}

impl Reservation {
    pub fn is_cancelled(&self) -> bool {
        self.status == ReservationStatus::Cancelled
    }

    pub fn has_checked_in(&self) -> bool {
        !self.check_ins.is_empty()
    }

    pub fn stay_phase(&self) -> StayPhase {
        if self.check_ins.is_empty() {
            StayPhase::NotArrived
        } else if self.check_outs.len() >= self.check_ins.len() {
            StayPhase::CheckedOut
        } else {
            StayPhase::CheckedIn
        }
    }

    pub fn nights(&self) -> usize {
        self.reserved_days.len()
    }

    pub fn first_night(&self) -> Option<NaiveDate> {
        self.reserved_days.first().copied()
    }

    pub fn last_night(&self) -> Option<NaiveDate> {
        self.reserved_days.last().copied()
    }

    /// Rooms the reservation touches: attached rooms, rooms holding its ledger entries,
    /// and rooms it is checked in to.
    pub fn touched_rooms(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .rooms
            .iter()
            .copied()
            .chain(self.occupancy.iter().map(|o| o.unit.room_id()))
            .chain(self.stay_units.iter().map(Unit::room_id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// The room allocation targets: where ledger entries are already held, else the first attached room.
    pub fn primary_room(&self) -> Option<Ulid> {
        self.occupancy
            .first()
            .map(|o| o.unit.room_id())
            .or_else(|| self.rooms.first().copied())
    }

    /// Authoritative monetary value.
    pub fn total_value(&self) -> Decimal {
        crate::engine::pricing::compute_value(&self.pricing, self.nights(), self.guests.len())
    }
}

/// One new night placed on a unit by an incremental date add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub entry_id: Ulid,
    pub unit: Unit,
    pub date: NaiveDate,
}

/// The event types. Each committed operation is exactly one event; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomPriceChanged {
        room_id: Ulid,
        price: Decimal,
    },
    BedAdded {
        bed: Bed,
    },
    BedRemoved {
        id: Ulid,
        room_id: Ulid,
    },
    BedStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BedStatus,
    },
    GuestRegistered {
        id: Ulid,
        name: String,
        document: Option<String>,
        phone: Option<String>,
        email: Option<String>,
    },
    GuestUpdated {
        id: Ulid,
        document: Option<String>,
        phone: Option<String>,
        email: Option<String>,
    },
    /// Also emitted by compaction to restore a reservation as-is.
    ReservationCreated {
        reservation: Reservation,
        entries: Vec<OccupancyEntry>,
    },
    DatesAdded {
        reservation_id: Ulid,
        placements: Vec<Placement>,
    },
    DatesRemoved {
        reservation_id: Ulid,
        dates: DateSet,
        dropped_entries: Vec<Ulid>,
    },
    /// `vacated` lists checked-in units the new entries no longer cover.
    DatesReplaced {
        reservation_id: Ulid,
        dates: DateSet,
        entries: Vec<OccupancyEntry>,
        vacated: Vec<Unit>,
    },
    RoomAttached {
        reservation_id: Ulid,
        room_id: Ulid,
        base_price: Decimal,
    },
    RoomDetached {
        reservation_id: Ulid,
        room_id: Ulid,
        base_price: Decimal,
        vacated: Vec<Unit>,
    },
    GuestAttached {
        reservation_id: Ulid,
        guest_id: Ulid,
    },
    GuestDetached {
        reservation_id: Ulid,
        guest_id: Ulid,
    },
    /// `units` flip to OCCUPIED: a whole room's status, or one bed's.
    CheckedIn {
        reservation_id: Ulid,
        at: DateTime<Utc>,
        units: Vec<Unit>,
    },
    /// `units` are the ones the stay's check-in occupied; each goes VACANT unless
    /// another checked-in reservation is on it.
    CheckedOut {
        reservation_id: Ulid,
        at: DateTime<Utc>,
        units: Vec<Unit>,
    },
    ReservationCancelled {
        reservation_id: Ulid,
    },
    /// `vacated` lists units a guest still occupied when the row was hard-deleted.
    ReservationDeleted {
        reservation_id: Ulid,
        vacated: Vec<Unit>,
    },
    PricingUpdated {
        reservation_id: Ulid,
        pricing: Pricing,
    },
    FinancialMarked {
        reservation_ids: Vec<Ulid>,
        processed: bool,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub number: u32,
    pub category: RoomCategory,
    pub status: RoomStatus,
    pub occupancy: RoomOccupancy,
    pub price: Decimal,
    pub beds: Vec<Bed>,
}

impl From<&RoomState> for RoomInfo {
    fn from(rs: &RoomState) -> Self {
        Self {
            id: rs.room.id,
            number: rs.room.number,
            category: rs.room.category,
            status: rs.status(),
            occupancy: rs.occupancy(),
            price: rs.room.price,
            beds: rs.beds.clone(),
        }
    }
}

/// Advisory answer to "could this room be booked for these nights right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityReport {
    pub room_number: u32,
    pub category: RoomCategory,
    pub available: bool,
    pub unit_description: String,
    /// Free beds for dorms; `None` for whole rooms.
    pub remaining_capacity: Option<u32>,
    pub price: Decimal,
    pub requested_dates: DateSet,
    pub nights: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BedAvailabilityInfo {
    pub room_number: u32,
    pub total_beds: u32,
    pub available_beds: u32,
}

impl BedAvailabilityInfo {
    pub fn is_available(&self) -> bool {
        self.available_beds > 0
    }
}
