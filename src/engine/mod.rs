mod availability;
mod catalog;
mod conflict;
mod error;
mod mutations;
pub mod pricing;
mod queries;

pub use availability::Allocation;
pub use error::{EngineError, ErrorKind, Missing};
pub use pricing::{PricingPatch, ValueBreakdown};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::EnginePolicy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub type SharedReservation = Arc<RwLock<Reservation>>;

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

/// Owns the WAL. Appends that arrive while a batch is being collected share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(batch = batch.len(), "WAL flush failed: {e}");
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so the partial batch doesn't leak into the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Event application ────────────────────────────────────

/// Apply the part of `event` that concerns this room (no locking; caller holds the lock).
fn apply_to_room(rs: &mut RoomState, event: &Event) {
    let room_id = rs.room.id;
    match event {
        Event::RoomPriceChanged { price, .. } => rs.room.price = *price,
        Event::BedAdded { bed } if bed.room_id == room_id => rs.beds.push(bed.clone()),
        Event::BedRemoved { id, .. } => rs.beds.retain(|b| b.id != *id),
        Event::BedStatusChanged { id, status, .. } => {
            if let Some(bed) = rs.bed_mut(id) {
                bed.status = *status;
            }
        }
        Event::ReservationCreated { reservation, entries } => {
            for entry in entries.iter().filter(|e| e.unit.room_id() == room_id) {
                rs.insert_entry(entry.clone());
            }
            // compaction restores a stay in progress; unit statuses come with the room
            for unit in reservation.stay_units.iter().filter(|u| u.room_id() == room_id) {
                rs.occupants.push((*unit, reservation.id));
            }
        }
        Event::DatesAdded {
            reservation_id,
            placements,
        } => {
            for p in placements.iter().filter(|p| p.unit.room_id() == room_id) {
                match rs.entry_mut(&p.entry_id) {
                    Some(entry) => {
                        entry.dates.insert(p.date);
                    }
                    None => rs.insert_entry(OccupancyEntry {
                        id: p.entry_id,
                        unit: p.unit,
                        reservation_id: *reservation_id,
                        dates: [p.date].into(),
                    }),
                }
            }
        }
        Event::DatesRemoved {
            reservation_id,
            dates,
            dropped_entries,
        } => {
            rs.ledger.retain(|e| !dropped_entries.contains(&e.id));
            for entry in rs.ledger.iter_mut().filter(|e| e.reservation_id == *reservation_id) {
                entry.dates.retain(|d| !dates.contains(d));
            }
        }
        Event::DatesReplaced {
            reservation_id,
            entries,
            vacated,
            ..
        } => {
            rs.release_reservation(*reservation_id);
            for entry in entries.iter().filter(|e| e.unit.room_id() == room_id) {
                rs.insert_entry(entry.clone());
            }
            vacate_units(rs, vacated, *reservation_id);
        }
        Event::RoomDetached {
            reservation_id,
            room_id: detached,
            vacated,
            ..
        } if *detached == room_id => {
            rs.release_reservation(*reservation_id);
            vacate_units(rs, vacated, *reservation_id);
        }
        Event::CheckedIn {
            reservation_id,
            units,
            ..
        } => {
            for unit in units.iter().filter(|u| u.room_id() == room_id) {
                rs.occupy(*unit, *reservation_id);
            }
        }
        Event::CheckedOut {
            reservation_id,
            units,
            ..
        } => vacate_units(rs, units, *reservation_id),
        Event::ReservationCancelled { reservation_id } => {
            rs.release_reservation(*reservation_id);
        }
        Event::ReservationDeleted {
            reservation_id,
            vacated,
        } => {
            rs.release_reservation(*reservation_id);
            vacate_units(rs, vacated, *reservation_id);
        }
        _ => {}
    }
}

fn vacate_units(rs: &mut RoomState, units: &[Unit], reservation_id: Ulid) {
    let room_id = rs.room.id;
    for unit in units.iter().filter(|u| u.room_id() == room_id) {
        rs.vacate(*unit, reservation_id);
    }
}

/// Apply the part of `event` that concerns one existing reservation.
fn apply_to_reservation(r: &mut Reservation, event: &Event) {
    match event {
        Event::DatesAdded { placements, .. } => {
            for p in placements {
                r.reserved_days.insert(p.date);
                if !r.occupancy.iter().any(|o| o.entry_id == p.entry_id) {
                    r.occupancy.push(OccupancyRef {
                        entry_id: p.entry_id,
                        unit: p.unit,
                    });
                }
            }
        }
        Event::DatesRemoved {
            dates,
            dropped_entries,
            ..
        } => {
            r.reserved_days.retain(|d| !dates.contains(d));
            r.occupancy.retain(|o| !dropped_entries.contains(&o.entry_id));
        }
        Event::DatesReplaced {
            dates,
            entries,
            vacated,
            ..
        } => {
            r.stay_units.retain(|u| !vacated.contains(u));
            r.reserved_days = dates.clone();
            r.occupancy = entries
                .iter()
                .map(|e| OccupancyRef {
                    entry_id: e.id,
                    unit: e.unit,
                })
                .collect();
        }
        Event::RoomAttached {
            room_id,
            base_price,
            ..
        } => {
            r.rooms.push(*room_id);
            r.pricing.base_price = *base_price;
        }
        Event::RoomDetached {
            room_id,
            base_price,
            vacated,
            ..
        } => {
            r.stay_units.retain(|u| !vacated.contains(u));
            r.rooms.retain(|id| id != room_id);
            r.occupancy.retain(|o| o.unit.room_id() != *room_id);
            r.pricing.base_price = *base_price;
        }
        Event::GuestAttached { guest_id, .. } => r.guests.push(*guest_id),
        Event::GuestDetached { guest_id, .. } => r.guests.retain(|id| id != guest_id),
        Event::CheckedIn { at, units, .. } => {
            r.check_ins.push(*at);
            for unit in units {
                if !r.stay_units.contains(unit) {
                    r.stay_units.push(*unit);
                }
            }
        }
        Event::CheckedOut { at, units, .. } => {
            r.check_outs.push(*at);
            r.stay_units.retain(|u| !units.contains(u));
        }
        Event::ReservationCancelled { .. } => {
            r.status = ReservationStatus::Cancelled;
            r.occupancy.clear();
        }
        Event::ReservationDeleted { .. } => {
            r.occupancy.clear();
            r.reserved_days.clear();
            r.guests.clear();
            r.rooms.clear();
            r.stay_units.clear();
        }
        Event::PricingUpdated { pricing, .. } => r.pricing = pricing.clone(),
        Event::FinancialMarked { processed, .. } => r.financial_processed = *processed,
        _ => {}
    }
}

/// Reservations an event mutates in place (not creation, which brings its own row).
fn event_reservations(event: &Event) -> Vec<Ulid> {
    match event {
        Event::DatesAdded { reservation_id, .. }
        | Event::DatesRemoved { reservation_id, .. }
        | Event::DatesReplaced { reservation_id, .. }
        | Event::RoomAttached { reservation_id, .. }
        | Event::RoomDetached { reservation_id, .. }
        | Event::GuestAttached { reservation_id, .. }
        | Event::GuestDetached { reservation_id, .. }
        | Event::CheckedIn { reservation_id, .. }
        | Event::CheckedOut { reservation_id, .. }
        | Event::ReservationCancelled { reservation_id }
        | Event::ReservationDeleted { reservation_id, .. }
        | Event::PricingUpdated { reservation_id, .. } => vec![*reservation_id],
        Event::FinancialMarked { reservation_ids, .. } => reservation_ids.clone(),
        _ => Vec::new(),
    }
}

/// Rooms named by the event itself. Replay adds the reservation's touched rooms.
fn event_rooms(event: &Event) -> Vec<Ulid> {
    match event {
        Event::RoomPriceChanged { room_id, .. }
        | Event::BedRemoved { room_id, .. }
        | Event::BedStatusChanged { room_id, .. }
        | Event::RoomAttached { room_id, .. }
        | Event::RoomDetached { room_id, .. } => vec![*room_id],
        Event::BedAdded { bed } => vec![bed.room_id],
        Event::ReservationCreated { reservation, entries } => entries
            .iter()
            .map(|e| e.unit.room_id())
            .chain(reservation.stay_units.iter().map(Unit::room_id))
            .collect(),
        Event::DatesReplaced { entries, vacated, .. } => entries
            .iter()
            .map(|e| e.unit.room_id())
            .chain(vacated.iter().map(Unit::room_id))
            .collect(),
        Event::DatesAdded { placements, .. } => placements.iter().map(|p| p.unit.room_id()).collect(),
        Event::CheckedIn { units, .. }
        | Event::CheckedOut { units, .. }
        | Event::ReservationDeleted { vacated: units, .. } => {
            units.iter().map(Unit::room_id).collect()
        }
        _ => Vec::new(),
    }
}

fn sorted_unique(mut ids: Vec<Ulid>) -> Vec<Ulid> {
    ids.sort();
    ids.dedup();
    ids
}

pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) room_numbers: DashMap<u32, Ulid>,
    /// Reverse lookup: bed id → room id
    pub(super) bed_to_room: DashMap<Ulid, Ulid>,
    pub(super) reservations: DashMap<Ulid, SharedReservation>,
    pub(super) guests: DashMap<Ulid, Guest>,
    pub(super) guest_names: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: EnginePolicy,
    /// Mutations hold it shared; compaction holds it exclusively so no append slips
    /// between the snapshot and the file swap.
    pub(super) gate: RwLock<()>,
    /// Serializes uniqueness checks on room numbers and guest names.
    pub(super) catalog_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        policy: EnginePolicy,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            room_numbers: DashMap::new(),
            bed_to_room: DashMap::new(),
            reservations: DashMap::new(),
            guests: DashMap::new(),
            guest_names: DashMap::new(),
            wal_tx,
            notify,
            clock,
            policy,
            gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
        };

        for event in &events {
            engine.replay_event(event);
        }

        let active = engine
            .reservations
            .iter()
            .filter(|e| e.value().try_read().is_ok_and(|r| !r.is_cancelled()))
            .count();
        metrics::gauge!(crate::observability::RESERVATIONS_ACTIVE).set(active as f64);
        tracing::debug!(events = events.len(), "replayed WAL");

        Ok(engine)
    }

    /// Replay owns every Arc, so try_write always succeeds instantly. Never block here:
    /// this may run inside an async context.
    fn replay_event(&self, event: &Event) {
        let mut reservation_guards: Vec<OwnedRwLockWriteGuard<Reservation>> = event_reservations(event)
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|e| e.value().clone()))
            .map(|shared| shared.try_write_owned().expect("replay: uncontended write"))
            .collect();

        let mut room_ids = event_rooms(event);
        for r in &reservation_guards {
            room_ids.extend(r.touched_rooms());
        }
        let mut room_guards: Vec<OwnedRwLockWriteGuard<RoomState>> = sorted_unique(room_ids)
            .iter()
            .filter_map(|id| self.rooms.get(id).map(|e| e.value().clone()))
            .map(|shared| shared.try_write_owned().expect("replay: uncontended write"))
            .collect();

        let mut reservations: Vec<&mut Reservation> =
            reservation_guards.iter_mut().map(|g| &mut **g).collect();
        self.apply(event, &mut reservations, &mut room_guards);
    }

    fn apply(
        &self,
        event: &Event,
        reservations: &mut [&mut Reservation],
        rooms: &mut [OwnedRwLockWriteGuard<RoomState>],
    ) {
        for rs in rooms.iter_mut() {
            apply_to_room(rs, event);
        }
        self.apply_index(event, reservations);
        for r in reservations.iter_mut() {
            apply_to_reservation(r, event);
        }
    }

    /// Map-level bookkeeping: insert/remove rows, reverse lookups, guest back-references.
    /// Runs before the rows themselves change.
    fn apply_index(&self, event: &Event, reservations: &[&mut Reservation]) {
        match event {
            Event::RoomCreated { room } => {
                self.room_numbers.insert(room.number, room.id);
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
            }
            Event::BedAdded { bed } => {
                self.bed_to_room.insert(bed.id, bed.room_id);
            }
            Event::BedRemoved { id, .. } => {
                self.bed_to_room.remove(id);
            }
            Event::GuestRegistered {
                id,
                name,
                document,
                phone,
                email,
            } => {
                self.guest_names.insert(name.clone(), *id);
                self.guests.insert(
                    *id,
                    Guest {
                        id: *id,
                        name: name.clone(),
                        document: document.clone(),
                        phone: phone.clone(),
                        email: email.clone(),
                        reservations: Default::default(),
                    },
                );
            }
            Event::GuestUpdated {
                id,
                document,
                phone,
                email,
            } => {
                if let Some(mut guest) = self.guests.get_mut(id) {
                    guest.document = document.clone();
                    guest.phone = phone.clone();
                    guest.email = email.clone();
                }
            }
            Event::ReservationCreated { reservation, .. } => {
                for guest_id in &reservation.guests {
                    if let Some(mut guest) = self.guests.get_mut(guest_id) {
                        guest.reservations.insert(reservation.id);
                    }
                }
                self.reservations
                    .insert(reservation.id, Arc::new(RwLock::new(reservation.clone())));
            }
            Event::GuestAttached {
                reservation_id,
                guest_id,
            } => {
                if let Some(mut guest) = self.guests.get_mut(guest_id) {
                    guest.reservations.insert(*reservation_id);
                }
            }
            Event::GuestDetached {
                reservation_id,
                guest_id,
            } => {
                if let Some(mut guest) = self.guests.get_mut(guest_id) {
                    guest.reservations.remove(reservation_id);
                }
            }
            Event::ReservationDeleted { reservation_id, .. } => {
                self.reservations.remove(reservation_id);
                for guest_id in reservations.iter().flat_map(|r| r.guests.iter()) {
                    if let Some(mut guest) = self.guests.get_mut(guest_id) {
                        guest.reservations.remove(reservation_id);
                    }
                }
            }
            _ => {}
        }
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

    /// WAL-append + apply + notify. Nothing is applied when the append fails.
    pub(super) async fn commit(
        &self,
        event: &Event,
        reservations: &mut [&mut Reservation],
        rooms: &mut [OwnedRwLockWriteGuard<RoomState>],
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(event, reservations, rooms);
        for rs in rooms.iter() {
            self.notify.send(rs.room.id, event);
        }
        Ok(())
    }

    pub(super) fn room_id(&self, number: u32) -> Result<Ulid, EngineError> {
        self.room_numbers
            .get(&number)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Missing::Room(number)))
    }

    pub(super) fn shared_room(&self, id: &Ulid) -> Result<SharedRoomState, EngineError> {
        self.rooms
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(Missing::RoomId(*id)))
    }

    pub(super) fn guest_id(&self, name: &str) -> Result<Ulid, EngineError> {
        self.guest_names
            .get(name.trim())
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::NotFound(Missing::Guest(name.trim().to_string())))
    }

    /// Lock a reservation row. Fails if it was deleted while we waited.
    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Reservation>, EngineError> {
        let shared = self
            .reservations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(Missing::Reservation(id)))?;
        let guard = shared.write_owned().await;
        if !self.reservations.contains_key(&id) {
            return Err(EngineError::NotFound(Missing::Reservation(id)));
        }
        Ok(guard)
    }

    /// Write-lock rooms in ascending id order to prevent deadlocks.
    pub(super) async fn lock_rooms(
        &self,
        ids: Vec<Ulid>,
    ) -> Result<Vec<OwnedRwLockWriteGuard<RoomState>>, EngineError> {
        let ids = sorted_unique(ids);
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.shared_room(id)?.write_owned().await);
        }
        Ok(guards)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL as the minimal event list that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "compacted WAL");
        Ok(())
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut rooms: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(rooms.len());
        for shared in rooms.drain(..) {
            snapshots.push(shared.read().await.clone());
        }
        snapshots.sort_by_key(|rs| rs.room.number);

        let mut events = Vec::new();
        for rs in &snapshots {
            events.push(Event::RoomCreated {
                room: rs.room.clone(),
            });
            for bed in &rs.beds {
                events.push(Event::BedAdded { bed: bed.clone() });
            }
        }

        let mut guests: Vec<Guest> = self.guests.iter().map(|e| e.value().clone()).collect();
        guests.sort_by_key(|g| g.id);
        for g in guests {
            events.push(Event::GuestRegistered {
                id: g.id,
                name: g.name,
                document: g.document,
                phone: g.phone,
                email: g.email,
            });
        }

        let shared: Vec<SharedReservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        let mut reservations = Vec::with_capacity(shared.len());
        for r in shared {
            reservations.push(r.read().await.clone());
        }
        reservations.sort_by_key(|r| r.id);
        for reservation in reservations {
            let entries = snapshots
                .iter()
                .flat_map(|rs| rs.entries_for(reservation.id).cloned())
                .collect();
            events.push(Event::ReservationCreated {
                reservation,
                entries,
            });
        }

        events
    }
}
