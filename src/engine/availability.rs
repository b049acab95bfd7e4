use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::check_no_conflict;
use super::EngineError;

/// The unit chosen for a booking and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub unit: Unit,
    pub reason: String,
}

/// True when no other reservation holds `unit` on any of `dates`.
/// The read side and the allocating side both go through here.
fn unit_is_free(rs: &RoomState, unit: &Unit, dates: &DateSet, exclude: Option<Ulid>) -> bool {
    rs.conflicts(unit, dates, exclude).next().is_none()
}

fn bed_unit(rs: &RoomState, bed: &Bed) -> Unit {
    Unit::Bed {
        room_id: rs.room.id,
        bed_id: bed.id,
    }
}

/// Beds free for every one of `dates`, in bed order.
pub(crate) fn free_beds<'a>(
    rs: &'a RoomState,
    dates: &'a DateSet,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Bed> {
    rs.beds
        .iter()
        .filter(move |bed| unit_is_free(rs, &bed_unit(rs, bed), dates, exclude))
}

/// Pick the unit that will hold `dates` in this room.
///
/// Whole rooms are taken as one unit. Dorms get the first bed (insertion order) with no
/// conflicting night; a dorm without beds never allocates.
pub(crate) fn allocate(
    rs: &RoomState,
    dates: &DateSet,
    exclude: Option<Ulid>,
) -> Result<Allocation, EngineError> {
    match rs.strategy() {
        AllocationStrategy::WholeRoom => {
            let unit = Unit::Room {
                room_id: rs.room.id,
            };
            check_no_conflict(rs, &unit, dates, exclude)?;
            Ok(Allocation {
                unit,
                reason: format!("{} {} is free", rs.room.category.describe(), rs.room.number),
            })
        }
        AllocationStrategy::PerBed => {
            let (position, bed) = rs
                .beds
                .iter()
                .enumerate()
                .find(|(_, bed)| unit_is_free(rs, &bed_unit(rs, bed), dates, exclude))
                .ok_or_else(|| EngineError::Unavailable {
                    room_number: rs.room.number,
                    dates: dates.clone(),
                })?;
            tracing::debug!(room = rs.room.number, bed = %bed.id, position, "picked bed");
            Ok(Allocation {
                unit: bed_unit(rs, bed),
                reason: format!("bed {} of {} in room {}", position + 1, rs.beds.len(), rs.room.number),
            })
        }
    }
}

/// Place extra nights for a reservation already holding units in this room.
///
/// Each night stays on the unit the reservation already holds when that unit is free.
/// In a dorm, a night whose held bed is taken goes to the first free bed instead, as a
/// separate entry; nights already held are never moved.
pub(crate) fn place_dates(
    rs: &RoomState,
    reservation_id: Ulid,
    dates: &DateSet,
) -> Result<Vec<Placement>, EngineError> {
    let held: Vec<&OccupancyEntry> = rs.entries_for(reservation_id).collect();

    match rs.strategy() {
        AllocationStrategy::WholeRoom => {
            let unit = Unit::Room {
                room_id: rs.room.id,
            };
            check_no_conflict(rs, &unit, dates, Some(reservation_id))?;
            let entry_id = held
                .iter()
                .find(|e| e.unit == unit)
                .map_or_else(Ulid::new, |e| e.id);
            Ok(dates
                .iter()
                .map(|date| Placement {
                    entry_id,
                    unit,
                    date: *date,
                })
                .collect())
        }
        AllocationStrategy::PerBed => {
            let preferred = held.first().map(|e| e.unit);
            let mut entry_for: HashMap<Unit, Ulid> = held.iter().map(|e| (e.unit, e.id)).collect();
            let mut placements = Vec::with_capacity(dates.len());
            let mut unplaced = DateSet::new();

            for date in dates {
                let night: DateSet = [*date].into();
                let unit = preferred
                    .filter(|u| unit_is_free(rs, u, &night, Some(reservation_id)))
                    .or_else(|| {
                        free_beds(rs, &night, Some(reservation_id))
                            .next()
                            .map(|bed| bed_unit(rs, bed))
                    });
                let Some(unit) = unit else {
                    unplaced.insert(*date);
                    continue;
                };
                if preferred.is_some_and(|p| p != unit) {
                    tracing::debug!(room = rs.room.number, %date, "held bed taken, moving night");
                }
                let entry_id = *entry_for.entry(unit).or_insert_with(Ulid::new);
                placements.push(Placement {
                    entry_id,
                    unit,
                    date: *date,
                });
            }

            if unplaced.is_empty() {
                Ok(placements)
            } else {
                Err(EngineError::Unavailable {
                    room_number: rs.room.number,
                    dates: unplaced,
                })
            }
        }
    }
}

/// Advisory availability of one room for `dates`, using the allocation predicate.
pub(crate) fn probe(rs: &RoomState, dates: &DateSet) -> AvailabilityReport {
    let (available, unit_description, remaining_capacity) = match rs.strategy() {
        AllocationStrategy::WholeRoom => {
            let unit = Unit::Room {
                room_id: rs.room.id,
            };
            (
                unit_is_free(rs, &unit, dates, None),
                format!("{} {}", rs.room.category.describe(), rs.room.number),
                None,
            )
        }
        AllocationStrategy::PerBed => {
            let free = free_beds(rs, dates, None).count() as u32;
            (
                free > 0,
                format!("{free} of {} beds free in room {}", rs.beds.len(), rs.room.number),
                Some(free),
            )
        }
    };

    AvailabilityReport {
        room_number: rs.room.number,
        category: rs.room.category,
        available,
        unit_description,
        remaining_capacity,
        price: rs.room.price,
        requested_dates: dates.clone(),
        nights: dates.len(),
    }
}

/// The dorm bed a reservation sleeps in on `today`, else its first held bed. Beds
/// another checked-in guest is on are skipped.
pub(crate) fn bed_for_stay(rs: &RoomState, reservation_id: Ulid, today: NaiveDate) -> Option<Unit> {
    let held: Vec<&OccupancyEntry> = rs
        .entries_for(reservation_id)
        .filter(|e| matches!(e.unit, Unit::Bed { .. }))
        .filter(|e| !rs.occupied_by_other(&e.unit, reservation_id))
        .collect();
    held.iter()
        .find(|e| e.dates.contains(&today))
        .or(held.first())
        .map(|e| e.unit)
}
