use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::DateSet;

/// What a `NotFound` failed to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Room(u32),
    RoomId(Ulid),
    Bed(Ulid),
    Guest(String),
    Reservation(Ulid),
    ReservationFor { guest: String, dates: DateSet },
}

impl std::fmt::Display for Missing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Missing::Room(number) => write!(f, "room {number}"),
            Missing::RoomId(id) => write!(f, "room {id}"),
            Missing::Bed(id) => write!(f, "bed {id}"),
            Missing::Guest(name) => write!(f, "guest {name:?}"),
            Missing::Reservation(id) => write!(f, "reservation {id}"),
            Missing::ReservationFor { guest, dates } => {
                write!(f, "reservation for guest {guest:?} on {}", fmt_dates(dates))
            }
        }
    }
}

/// Coarse classification for callers that map errors onto a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    InvalidState,
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Missing),
    /// No free whole room or bed for the requested nights.
    Unavailable {
        room_number: u32,
        dates: DateSet,
    },
    InvalidArgument(String),
    InvalidState(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Unavailable { .. } => ErrorKind::Conflict,
            EngineError::InvalidArgument(_) | EngineError::LimitExceeded(_) => {
                ErrorKind::InvalidArgument
            }
            EngineError::InvalidState(_) => ErrorKind::InvalidState,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Unavailable { .. } => "unavailable",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::Unavailable { room_number, dates } => write!(
                f,
                "room {room_number} unavailable on {}",
                fmt_dates(dates)
            ),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

fn fmt_dates(dates: &DateSet) -> String {
    let shown: Vec<String> = dates.iter().take(5).map(NaiveDate::to_string).collect();
    if dates.len() > shown.len() {
        format!("{} (+{} more)", shown.join(", "), dates.len() - shown.len())
    } else {
        shown.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_conflict_class() {
        let err = EngineError::Unavailable {
            room_number: 101,
            dates: ["2024-06-01".parse().unwrap()].into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "room 101 unavailable on 2024-06-01");
    }

    #[test]
    fn long_date_lists_are_elided() {
        let start: NaiveDate = "2024-06-01".parse().unwrap();
        let dates: DateSet = start.iter_days().take(8).collect();
        let err = EngineError::Unavailable {
            room_number: 3,
            dates,
        };
        assert!(err.to_string().ends_with("(+3 more)"));
    }

    #[test]
    fn not_found_names_the_missing_thing() {
        let err = EngineError::NotFound(Missing::Guest("Ana".into()));
        assert_eq!(err.to_string(), "not found: guest \"Ana\"");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
