use chrono::{DateTime, Local, NaiveDate, NaiveTime, Utc};

/// Source of "now" for date validation and check-in/out timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// The hostel's calendar day.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Pinned clock for tests and replays.
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Noon UTC on `date`.
    pub fn on(date: NaiveDate) -> Self {
        Self(date.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default()).and_utc())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
