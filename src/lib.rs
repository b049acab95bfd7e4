pub mod clock;
pub mod compactor;
pub mod config;
pub mod dates;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
