use chrono::NaiveDate;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;

use super::availability::{free_beds, probe};
use super::conflict::validate_stay_window;
use super::pricing::{breakdown, ValueBreakdown};
use super::{Engine, EngineError, Missing, SharedReservation};

impl Engine {
    async fn snapshot_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let shared: Vec<SharedReservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for r in shared {
            let r = r.read().await;
            if keep(&*r) {
                out.push(r.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let shared = self
            .reservations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(Missing::Reservation(id)))?;
        let r = shared.read().await;
        Ok(r.clone())
    }

    /// Every reservation, cancelled ones included, oldest first.
    pub async fn reservations(&self) -> Vec<Reservation> {
        self.snapshot_reservations(|_| true).await
    }

    /// CONFIRMED reservations holding `date`.
    pub async fn reservations_on(&self, date: NaiveDate) -> Vec<Reservation> {
        self.snapshot_reservations(|r| !r.is_cancelled() && r.reserved_days.contains(&date))
            .await
    }

    /// Advisory: a concurrent booking may take the unit before the caller does.
    pub async fn check_availability(
        &self,
        room_number: u32,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<AvailabilityReport, EngineError> {
        let dates = validate_stay_window(
            check_in,
            check_out,
            self.clock.today(),
            self.policy.booking_horizon_months,
        )?;
        let shared = self.shared_room(&self.room_id(room_number)?)?;
        let rs = shared.read().await;
        Ok(probe(&rs, &dates))
    }

    /// Free beds per dorm for `dates`, ordered by room number.
    pub async fn bed_availability(&self, dates: &DateSet) -> Result<Vec<BedAvailabilityInfo>, EngineError> {
        if dates.is_empty() {
            return Err(EngineError::invalid_argument("no dates given"));
        }
        let shared: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for room in shared {
            let rs = room.read().await;
            if rs.strategy() != AllocationStrategy::PerBed {
                continue;
            }
            out.push(BedAvailabilityInfo {
                room_number: rs.room.number,
                total_beds: rs.beds.len() as u32,
                available_beds: free_beds(&rs, dates, None).count() as u32,
            });
        }
        out.sort_by_key(|b| b.room_number);
        Ok(out)
    }

    pub async fn value_details(&self, id: Ulid) -> Result<ValueBreakdown, EngineError> {
        Ok(breakdown(&self.reservation(id).await?))
    }

    /// CONFIRMED, not yet processed reservations with a night in `[start, end]`.
    pub async fn pending_financial(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Reservation>, EngineError> {
        if end < start {
            return Err(EngineError::invalid_argument(format!(
                "period end {end} is before start {start}"
            )));
        }
        Ok(self
            .snapshot_reservations(|r| {
                !r.is_cancelled()
                    && !r.financial_processed
                    && r.reserved_days.range(start..=end).next().is_some()
            })
            .await)
    }

    /// Ledger entries for a room and its beds, earliest night first.
    pub async fn room_occupancy(&self, room_number: u32) -> Result<Vec<OccupancyEntry>, EngineError> {
        let shared = self.shared_room(&self.room_id(room_number)?)?;
        let rs = shared.read().await;
        let mut entries = rs.ledger.clone();
        entries.sort_by_key(|e| (e.dates.first().copied(), e.id));
        Ok(entries)
    }

    pub async fn room_status(&self, room_number: u32) -> Result<RoomOccupancy, EngineError> {
        let shared = self.shared_room(&self.room_id(room_number)?)?;
        let rs = shared.read().await;
        Ok(rs.occupancy())
    }

    /// Committed events touching `room_id`, from now on.
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(room_id)
    }
}
