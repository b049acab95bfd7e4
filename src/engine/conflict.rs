use chrono::{Months, NaiveDate};
use ulid::Ulid;

use crate::dates::{expand_range, overlap};
use crate::limits::MAX_DATES_PER_REQUEST;
use crate::model::*;

use super::EngineError;

/// Fail with `Unavailable` if any other reservation holds `unit` on one of `dates`.
pub(crate) fn check_no_conflict(
    rs: &RoomState,
    unit: &Unit,
    dates: &DateSet,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let clashing: DateSet = rs
        .conflicts(unit, dates, exclude)
        .flat_map(|e| overlap(&e.dates, dates))
        .collect();
    if clashing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Unavailable {
            room_number: rs.room.number,
            dates: clashing,
        })
    }
}

/// Last bookable night.
pub(crate) fn horizon_end(today: NaiveDate, months: u32) -> Result<NaiveDate, EngineError> {
    today
        .checked_add_months(Months::new(months))
        .ok_or(EngineError::LimitExceeded("booking horizon out of calendar range"))
}

/// Every night must lie in `[today, today + horizon]`.
pub(crate) fn validate_booking_dates(
    dates: &DateSet,
    today: NaiveDate,
    horizon_months: u32,
) -> Result<(), EngineError> {
    if dates.is_empty() {
        return Err(EngineError::invalid_argument("no dates given"));
    }
    if dates.len() > MAX_DATES_PER_REQUEST {
        return Err(EngineError::LimitExceeded("too many dates in one request"));
    }
    let last_allowed = horizon_end(today, horizon_months)?;
    if let Some(first) = dates.first()
        && *first < today
    {
        return Err(EngineError::invalid_argument(format!(
            "{first} is in the past"
        )));
    }
    if let Some(last) = dates.last()
        && *last > last_allowed
    {
        return Err(EngineError::invalid_argument(format!(
            "{last} is beyond the booking horizon ({last_allowed})"
        )));
    }
    Ok(())
}

/// Check a check-in/check-out pair and expand it into the nights it covers.
pub(crate) fn validate_stay_window(
    check_in: NaiveDate,
    check_out: NaiveDate,
    today: NaiveDate,
    horizon_months: u32,
) -> Result<DateSet, EngineError> {
    if check_out <= check_in {
        return Err(EngineError::invalid_argument(format!(
            "check-out {check_out} must be after check-in {check_in}"
        )));
    }
    if check_in < today {
        return Err(EngineError::invalid_argument(format!(
            "check-in {check_in} is in the past"
        )));
    }
    let last_allowed = horizon_end(today, horizon_months)?;
    if check_out > last_allowed {
        return Err(EngineError::invalid_argument(format!(
            "check-out {check_out} is beyond the booking horizon ({last_allowed})"
        )));
    }
    Ok(expand_range(check_in, check_out))
}
