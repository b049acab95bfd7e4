pub const MAX_ROOMS: usize = 10_000;
pub const MAX_BEDS_PER_ROOM: usize = 64;
pub const MAX_GUESTS: usize = 1_000_000;
pub const MAX_GUESTS_PER_RESERVATION: usize = 32;
/// One booking horizon's worth of nights plus slack for leap years.
pub const MAX_DATES_PER_REQUEST: usize = 400;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_FINANCIAL_BATCH: usize = 10_000;
pub const MAX_HORIZON_MONTHS: u32 = 60;
