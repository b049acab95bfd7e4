use rust_decimal::Decimal;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{timed, ALLOCATION_CONFLICTS_TOTAL, RESERVATIONS_ACTIVE};

use super::availability::{allocate, bed_for_stay, place_dates};
use super::conflict::validate_booking_dates;
use super::pricing::PricingPatch;
use super::{sorted_unique, Engine, EngineError, Missing};

/// Who a new reservation is for.
#[derive(Clone, Copy)]
enum Roster<'a> {
    /// A single guest that must already exist.
    Existing(&'a str),
    /// Guests looked up by name and created when absent.
    FindOrCreate(&'a [GuestInfo]),
}

fn strategy_label(rs: &RoomState) -> &'static str {
    match rs.strategy() {
        AllocationStrategy::WholeRoom => "whole_room",
        AllocationStrategy::PerBed => "per_bed",
    }
}

fn check_amount(what: &str, amount: Decimal) -> Result<(), EngineError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(EngineError::invalid_argument(format!("{what} cannot be negative: {amount}")));
    }
    Ok(())
}

impl Engine {
    fn note_conflict(&self, rs: &RoomState, err: &EngineError) {
        if let EngineError::Unavailable { dates, .. } = err {
            metrics::counter!(ALLOCATION_CONFLICTS_TOTAL, "strategy" => strategy_label(rs)).increment(1);
            warn!(room = rs.room.number, nights = dates.len(), "allocation conflict: {err}");
        }
    }

    /// Date and room changes are refused on cancelled reservations, and on checked-in
    /// ones when the policy freezes them.
    fn check_mutable(&self, r: &Reservation, operation: &'static str) -> Result<(), EngineError> {
        if r.is_cancelled() {
            return Err(EngineError::invalid_state(format!(
                "reservation {} is cancelled",
                r.id
            )));
        }
        if r.has_checked_in() {
            if self.policy.freeze_after_check_in {
                return Err(EngineError::invalid_state(format!(
                    "reservation {} has checked in; {operation} is not allowed",
                    r.id
                )));
            }
            warn!(reservation_id = %r.id, operation, "changing a reservation after check-in");
        }
        Ok(())
    }

    // ── Creation ─────────────────────────────────────────────

    /// Book `dates` in a room for one existing guest.
    pub async fn create_reservation(
        &self,
        room_number: u32,
        guest_name: &str,
        dates: DateSet,
    ) -> Result<Reservation, EngineError> {
        timed("create_reservation", async {
            let _gate = self.gate.read().await;
            self.create_inner(room_number, Roster::Existing(guest_name), dates)
                .await
        })
        .await
    }

    /// Book `dates` for a roster, registering guests that don't exist yet.
    pub async fn create_reservation_with_guests(
        &self,
        room_number: u32,
        roster: &[GuestInfo],
        dates: DateSet,
    ) -> Result<Reservation, EngineError> {
        timed("create_reservation_with_guests", async {
            if roster.is_empty() {
                return Err(EngineError::invalid_argument("guest roster is empty"));
            }
            if roster.len() > MAX_GUESTS_PER_RESERVATION {
                return Err(EngineError::LimitExceeded("too many guests on reservation"));
            }
            if roster.iter().any(|g| g.name.trim().is_empty()) {
                return Err(EngineError::invalid_argument("guest name is empty"));
            }
            let _gate = self.gate.read().await;
            self.create_inner(room_number, Roster::FindOrCreate(roster), dates)
                .await
        })
        .await
    }

    /// Entry point for calendar feeds: the guest is created on first sight.
    pub async fn create_reservation_for_import(
        &self,
        room_number: u32,
        guest_name: &str,
        dates: DateSet,
    ) -> Result<Reservation, EngineError> {
        timed("create_reservation_for_import", async {
            if guest_name.trim().is_empty() {
                return Err(EngineError::invalid_argument("guest name is empty"));
            }
            self.room_id(room_number)?;
            let _gate = self.gate.read().await;
            let guest = self.imported_guest_inner(guest_name).await?;
            self.create_inner(room_number, Roster::Existing(&guest.name), dates)
                .await
        })
        .await
    }

    /// Caller holds the gate.
    async fn create_inner(
        &self,
        room_number: u32,
        roster: Roster<'_>,
        dates: DateSet,
    ) -> Result<Reservation, EngineError> {
        validate_booking_dates(&dates, self.clock.today(), self.policy.booking_horizon_months)?;
        let room_id = self.room_id(room_number)?;
        let known_guest = match roster {
            Roster::Existing(name) => Some(self.guest_id(name)?),
            Roster::FindOrCreate(_) => None,
        };

        let mut rooms = self.lock_rooms(vec![room_id]).await?;
        let allocation = allocate(&rooms[0], &dates, None).inspect_err(|e| self.note_conflict(&rooms[0], e))?;

        // Only register guests once the booking is known to fit.
        let guests = match (known_guest, roster) {
            (Some(id), _) => vec![id],
            (None, Roster::FindOrCreate(infos)) => {
                let mut ids = Vec::with_capacity(infos.len());
                for info in infos {
                    let guest = self.find_or_create_guest_inner(info).await?;
                    if !ids.contains(&guest.id) {
                        ids.push(guest.id);
                    }
                }
                ids
            }
            (None, Roster::Existing(name)) => {
                return Err(EngineError::NotFound(Missing::Guest(name.to_string())));
            }
        };

        let id = Ulid::new();
        let entry = OccupancyEntry {
            id: Ulid::new(),
            unit: allocation.unit,
            reservation_id: id,
            dates: dates.clone(),
        };
        let reservation = Reservation {
            id,
            status: ReservationStatus::Confirmed,
            reserved_days: dates,
            check_ins: Vec::new(),
            check_outs: Vec::new(),
            pricing: Pricing {
                base_price: rooms[0].room.price,
                custom_value: None,
                use_custom_value: false,
                extra_guest_fee: self.policy.default_extra_guest_fee,
            },
            financial_processed: false,
            guests,
            rooms: vec![room_id],
            occupancy: vec![OccupancyRef {
                entry_id: entry.id,
                unit: entry.unit,
            }],
            stay_units: Vec::new(),
        };

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
            entries: vec![entry],
        };
        self.commit(&event, &mut [], &mut rooms).await?;
        metrics::gauge!(RESERVATIONS_ACTIVE).increment(1.0);
        info!(
            reservation_id = %id,
            room = room_number,
            nights = reservation.nights(),
            guests = reservation.guests.len(),
            value = %reservation.total_value(),
            "reservation created: {}",
            allocation.reason
        );
        Ok(reservation)
    }

    // ── Dates ────────────────────────────────────────────────

    pub async fn add_date(&self, id: Ulid, date: chrono::NaiveDate) -> Result<Reservation, EngineError> {
        self.add_dates(id, [date].into()).await
    }

    /// Add nights without moving the ones already held.
    pub async fn add_dates(&self, id: Ulid, dates: DateSet) -> Result<Reservation, EngineError> {
        timed("add_dates", async {
            validate_booking_dates(&dates, self.clock.today(), self.policy.booking_horizon_months)?;
            let _gate = self.gate.read().await;
            let mut r = self.lock_reservation(id).await?;
            self.check_mutable(&r, "add_dates")?;
            if let Some(dup) = dates.iter().find(|d| r.reserved_days.contains(d)) {
                return Err(EngineError::invalid_state(format!(
                    "{dup} is already reserved on {id}"
                )));
            }
            if r.nights() + dates.len() > MAX_DATES_PER_REQUEST {
                return Err(EngineError::LimitExceeded("too many nights on reservation"));
            }
            let room_id = r
                .primary_room()
                .ok_or_else(|| EngineError::invalid_state(format!("reservation {id} holds no room")))?;

            let mut rooms = self.lock_rooms(vec![room_id]).await?;
            let placements =
                place_dates(&rooms[0], id, &dates).inspect_err(|e| self.note_conflict(&rooms[0], e))?;
            let event = Event::DatesAdded {
                reservation_id: id,
                placements,
            };
            self.commit(&event, &mut [&mut *r], &mut rooms).await?;
            info!(reservation_id = %id, added = dates.len(), nights = r.nights(), value = %r.total_value(), "dates added");
            Ok(r.clone())
        })
        .await
    }

    pub async fn remove_date(&self, id: Ulid, date: chrono::NaiveDate) -> Result<Reservation, EngineError> {
        self.remove_dates(id, [date].into()).await
    }

    /// Drop nights from the reservation and its ledger entries. An emptied reservation
    /// stays CONFIRMED; cancelling is a separate action.
    pub async fn remove_dates(&self, id: Ulid, dates: DateSet) -> Result<Reservation, EngineError> {
        timed("remove_dates", async {
            if dates.is_empty() {
                return Err(EngineError::invalid_argument("no dates given"));
            }
            let _gate = self.gate.read().await;
            let mut r = self.lock_reservation(id).await?;
            self.check_mutable(&r, "remove_dates")?;
            if let Some(missing) = dates.iter().find(|d| !r.reserved_days.contains(d)) {
                return Err(EngineError::invalid_argument(format!(
                    "{missing} is not reserved on {id}"
                )));
            }

            let mut rooms = self.lock_rooms(r.touched_rooms()).await?;
            let dropped_entries = rooms
                .iter()
                .flat_map(|rs| rs.entries_for(id))
                .filter(|e| e.dates.iter().all(|d| dates.contains(d)))
                .map(|e| e.id)
                .collect();
            let event = Event::DatesRemoved {
                reservation_id: id,
                dates: dates.clone(),
                dropped_entries,
            };
            self.commit(&event, &mut [&mut *r], &mut rooms).await?;
            if r.reserved_days.is_empty() {
                info!(reservation_id = %id, "last night removed; reservation stays confirmed");
            } else {
                info!(reservation_id = %id, removed = dates.len(), nights = r.nights(), "dates removed");
            }
            Ok(r.clone())
        })
        .await
    }

    /// Replace the whole date set, reallocating in the reservation's room.
    pub async fn update_dates(&self, id: Ulid, dates: DateSet) -> Result<Reservation, EngineError> {
        timed("update_dates", async {
            validate_booking_dates(&dates, self.clock.today(), self.policy.booking_horizon_months)?;
            let _gate = self.gate.read().await;
            let mut r = self.lock_reservation(id).await?;
            self.check_mutable(&r, "update_dates")?;
            let room_id = r
                .primary_room()
                .ok_or_else(|| EngineError::invalid_state(format!("reservation {id} holds no room")))?;

            let mut rooms = self.lock_rooms(r.touched_rooms()).await?;
            let target = rooms
                .iter()
                .find(|rs| rs.room.id == room_id)
                .ok_or(EngineError::NotFound(Missing::RoomId(room_id)))?;
            let allocation =
                allocate(target, &dates, Some(id)).inspect_err(|e| self.note_conflict(target, e))?;
            let vacated: Vec<Unit> = r
                .stay_units
                .iter()
                .filter(|u| **u != allocation.unit)
                .copied()
                .collect();

            let event = Event::DatesReplaced {
                reservation_id: id,
                dates: dates.clone(),
                entries: vec![OccupancyEntry {
                    id: Ulid::new(),
                    unit: allocation.unit,
                    reservation_id: id,
                    dates,
                }],
                vacated,
            };
            self.commit(&event, &mut [&mut *r], &mut rooms).await?;
            info!(reservation_id = %id, nights = r.nights(), "dates replaced: {}", allocation.reason);
            Ok(r.clone())
        })
        .await
    }

    // ── Rooms and guests ─────────────────────────────────────

    /// Attach a room. No ledger entries are written; the first room seeds the base price.
    pub async fn add_room(&self, id: Ulid, room_number: u32) -> Result<Reservation, EngineError> {
        timed("add_room", async {
            let _gate = self.gate.read().await;
            let room_id = self.room_id(room_number)?;
            let mut r = self.lock_reservation(id).await?;
            self.check_mutable(&r, "add_room")?;
            if r.rooms.contains(&room_id) {
                return Err(EngineError::invalid_state(format!(
                    "room {room_number} is already on reservation {id}"
                )));
            }

            let mut rooms = self.lock_rooms(vec![room_id]).await?;
            let base_price = if r.rooms.is_empty() {
                rooms[0].room.price
            } else {
                r.pricing.base_price
            };
            let event = Event::RoomAttached {
                reservation_id: id,
                room_id,
                base_price,
            };
            self.commit(&event, &mut [&mut *r], &mut rooms).await?;
            info!(reservation_id = %id, room = room_number, %base_price, "room attached");
            Ok(r.clone())
        })
        .await
    }

    /// Detach a room and purge the reservation's ledger entries there.
    pub async fn remove_room(&self, id: Ulid, room_number: u32) -> Result<Reservation, EngineError> {
        timed("remove_room", async {
            let _gate = self.gate.read().await;
            let room_id = self.room_id(room_number)?;
            let mut r = self.lock_reservation(id).await?;
            self.check_mutable(&r, "remove_room")?;
            if !r.rooms.contains(&room_id) {
                return Err(EngineError::invalid_state(format!(
                    "room {room_number} is not on reservation {id}"
                )));
            }

            let mut rooms = self.lock_rooms(vec![room_id]).await?;
            let base_price = if r.rooms.len() == 1 {
                Decimal::ZERO
            } else {
                r.pricing.base_price
            };
            let vacated = r
                .stay_units
                .iter()
                .filter(|u| u.room_id() == room_id)
                .copied()
                .collect();
            let event = Event::RoomDetached {
                reservation_id: id,
                room_id,
                base_price,
                vacated,
            };
            self.commit(&event, &mut [&mut *r], &mut rooms).await?;
            info!(reservation_id = %id, room = room_number, %base_price, "room detached");
            Ok(r.clone())
        })
        .await
    }

    /// Attaching a guest already on the reservation is a no-op.
    pub async fn add_guest(&self, id: Ulid, guest_name: &str) -> Result<Reservation, EngineError> {
        timed("add_guest", async {
            let _gate = self.gate.read().await;
            let guest_id = self.guest_id(guest_name)?;
            let mut r = self.lock_reservation(id).await?;
            if r.guests.contains(&guest_id) {
                return Ok(r.clone());
            }
            if r.guests.len() >= MAX_GUESTS_PER_RESERVATION {
                return Err(EngineError::LimitExceeded("too many guests on reservation"));
            }
            let event = Event::GuestAttached {
                reservation_id: id,
                guest_id,
            };
            self.commit(&event, &mut [&mut *r], &mut []).await?;
            info!(reservation_id = %id, guest = guest_name, guests = r.guests.len(), value = %r.total_value(), "guest added");
            Ok(r.clone())
        })
        .await
    }

    /// Detaching a guest not on the reservation is a no-op.
    pub async fn remove_guest(&self, id: Ulid, guest_name: &str) -> Result<Reservation, EngineError> {
        timed("remove_guest", async {
            let _gate = self.gate.read().await;
            let guest_id = self.guest_id(guest_name)?;
            let mut r = self.lock_reservation(id).await?;
            if !r.guests.contains(&guest_id) {
                return Ok(r.clone());
            }
            let event = Event::GuestDetached {
                reservation_id: id,
                guest_id,
            };
            self.commit(&event, &mut [&mut *r], &mut []).await?;
            info!(reservation_id = %id, guest = guest_name, guests = r.guests.len(), value = %r.total_value(), "guest removed");
            Ok(r.clone())
        })
        .await
    }

    // ── Stay ─────────────────────────────────────────────────

    /// Whole rooms go OCCUPIED. In a dorm only the reservation's bed does; the room reads
    /// OCCUPIED once every bed is.
    pub async fn check_in(&self, id: Ulid) -> Result<Reservation, EngineError> {
        timed("check_in", async {
            let _gate = self.gate.read().await;
            let mut r = self.lock_reservation(id).await?;
            if r.is_cancelled() {
                return Err(EngineError::invalid_state(format!(
                    "reservation {id} is cancelled"
                )));
            }

            let mut rooms = self.lock_rooms(r.touched_rooms()).await?;
            let today = self.clock.today();
            let mut units = Vec::with_capacity(rooms.len());
            for rs in &rooms {
                match rs.strategy() {
                    AllocationStrategy::WholeRoom => units.push(Unit::Room {
                        room_id: rs.room.id,
                    }),
                    AllocationStrategy::PerBed => {
                        let bed = bed_for_stay(rs, id, today).ok_or_else(|| {
                            EngineError::invalid_state(format!(
                                "reservation {id} holds no bed in room {}",
                                rs.room.number
                            ))
                        })?;
                        units.push(bed);
                    }
                }
            }

            let event = Event::CheckedIn {
                reservation_id: id,
                at: self.clock.now(),
                units,
            };
            self.commit(&event, &mut [&mut *r], &mut rooms).await?;
            let numbers: Vec<u32> = rooms.iter().map(|rs| rs.room.number).collect();
            info!(reservation_id = %id, rooms = ?numbers, check_ins = r.check_ins.len(), "checked in");
            Ok(r.clone())
        })
        .await
    }

    /// Frees the units this stay occupied, never one another guest is checked in on.
    /// A dorm falls back to PARTIAL or VACANT.
    pub async fn check_out(&self, id: Ulid) -> Result<Reservation, EngineError> {
        timed("check_out", async {
            let _gate = self.gate.read().await;
            let mut r = self.lock_reservation(id).await?;
            if r.is_cancelled() {
                return Err(EngineError::invalid_state(format!(
                    "reservation {id} is cancelled"
                )));
            }

            let mut rooms = self.lock_rooms(r.touched_rooms()).await?;
            let event = Event::CheckedOut {
                reservation_id: id,
                at: self.clock.now(),
                units: r.stay_units.clone(),
            };
            self.commit(&event, &mut [&mut *r], &mut rooms).await?;
            let states: Vec<(u32, RoomOccupancy)> =
                rooms.iter().map(|rs| (rs.room.number, rs.occupancy())).collect();
            info!(reservation_id = %id, rooms = ?states, "checked out");
            Ok(r.clone())
        })
        .await
    }

    // ── Cancel / delete ──────────────────────────────────────

    /// One-way: refused once any check-in has been recorded.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        timed("cancel", self.cancel_inner(id)).await
    }

    async fn cancel_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.gate.read().await;
        let mut r = self.lock_reservation(id).await?;
        if r.is_cancelled() {
            return Err(EngineError::invalid_state(format!(
                "reservation {id} is already cancelled"
            )));
        }
        if r.has_checked_in() {
            return Err(EngineError::invalid_state(format!(
                "reservation {id} has checked in and can no longer be cancelled"
            )));
        }

        let mut rooms = self.lock_rooms(r.touched_rooms()).await?;
        let event = Event::ReservationCancelled { reservation_id: id };
        self.commit(&event, &mut [&mut *r], &mut rooms).await?;
        metrics::gauge!(RESERVATIONS_ACTIVE).decrement(1.0);
        info!(reservation_id = %id, "reservation cancelled");
        Ok(r.clone())
    }

    /// Cancel the guest's confirmed reservation whose nights are exactly `dates`.
    pub async fn cancel_by_guest_and_dates(
        &self,
        guest_name: &str,
        dates: &DateSet,
    ) -> Result<Reservation, EngineError> {
        timed("cancel_by_guest_and_dates", async {
            let guest = self.guest_by_name(guest_name)?;
            let mut target = None;
            for rid in &guest.reservations {
                let Some(shared) = self.reservations.get(rid).map(|e| e.value().clone()) else {
                    continue;
                };
                let r = shared.read().await;
                if !r.is_cancelled() && r.reserved_days == *dates {
                    target = Some(r.id);
                    break;
                }
            }
            let id = target.ok_or_else(|| {
                EngineError::NotFound(Missing::ReservationFor {
                    guest: guest.name.clone(),
                    dates: dates.clone(),
                })
            })?;
            self.cancel_inner(id).await
        })
        .await
    }

    /// Administrative hard delete, whatever the status.
    pub async fn delete(&self, id: Ulid) -> Result<(), EngineError> {
        timed("delete", async {
            let _gate = self.gate.read().await;
            let mut r = self.lock_reservation(id).await?;
            let mut rooms = self.lock_rooms(r.touched_rooms()).await?;
            let was_active = !r.is_cancelled();
            let event = Event::ReservationDeleted {
                reservation_id: id,
                vacated: r.stay_units.clone(),
            };
            self.commit(&event, &mut [&mut *r], &mut rooms).await?;
            if was_active {
                metrics::gauge!(RESERVATIONS_ACTIVE).decrement(1.0);
            }
            info!(reservation_id = %id, "reservation deleted");
            Ok(())
        })
        .await
    }

    // ── Pricing and finance ──────────────────────────────────

    /// Pin the value to `value`, ignoring nights and guests.
    pub async fn set_custom_value(&self, id: Ulid, value: Decimal) -> Result<Reservation, EngineError> {
        self.update_pricing(
            id,
            PricingPatch {
                custom_value: Some(value),
                use_custom_value: Some(true),
                ..PricingPatch::default()
            },
        )
        .await
    }

    /// Go back to the computed value. The custom amount is kept but ignored.
    pub async fn set_auto_value(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.update_pricing(
            id,
            PricingPatch {
                use_custom_value: Some(false),
                ..PricingPatch::default()
            },
        )
        .await
    }

    pub async fn update_extra_guest_fee(&self, id: Ulid, fee: Decimal) -> Result<Reservation, EngineError> {
        self.update_pricing(
            id,
            PricingPatch {
                extra_guest_fee: Some(fee),
                ..PricingPatch::default()
            },
        )
        .await
    }

    pub async fn update_pricing(&self, id: Ulid, patch: PricingPatch) -> Result<Reservation, EngineError> {
        timed("update_pricing", async {
            for (what, amount) in patch.amounts() {
                check_amount(what, amount)?;
            }
            let _gate = self.gate.read().await;
            let mut r = self.lock_reservation(id).await?;
            let pricing = patch.apply(&r.pricing);
            if pricing == r.pricing {
                return Ok(r.clone());
            }
            let event = Event::PricingUpdated {
                reservation_id: id,
                pricing,
            };
            self.commit(&event, &mut [&mut *r], &mut []).await?;
            info!(reservation_id = %id, value = %r.total_value(), custom = r.pricing.use_custom_value, "pricing updated");
            Ok(r.clone())
        })
        .await
    }

    /// Set or reset the downstream-financial flag. Returns how many reservations changed.
    pub async fn mark_financial_processed(&self, ids: Vec<Ulid>, processed: bool) -> Result<usize, EngineError> {
        timed("mark_financial_processed", async {
            if ids.len() > MAX_FINANCIAL_BATCH {
                return Err(EngineError::LimitExceeded("financial batch too large"));
            }
            let ids = sorted_unique(ids);
            let _gate = self.gate.read().await;
            // Reservation locks in ascending id order, like room locks.
            let mut guards = Vec::with_capacity(ids.len());
            for id in &ids {
                guards.push(self.lock_reservation(*id).await?);
            }

            let mut changed: Vec<&mut Reservation> = guards
                .iter_mut()
                .filter(|r| r.financial_processed != processed)
                .map(|r| &mut **r)
                .collect();
            if changed.is_empty() {
                return Ok(0);
            }
            let event = Event::FinancialMarked {
                reservation_ids: changed.iter().map(|r| r.id).collect(),
                processed,
            };
            self.commit(&event, &mut changed, &mut []).await?;
            info!(count = changed.len(), processed, "financial flag updated");
            Ok(changed.len())
        })
        .await
    }
}
