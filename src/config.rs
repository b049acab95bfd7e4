//! Environment-driven configuration for the daemon.

use std::path::PathBuf;
use std::str::FromStr;

use rust_decimal::Decimal;
use tracing::warn;

use crate::limits::MAX_HORIZON_MONTHS;

pub const WAL_FILE_NAME: &str = "bunkbook.wal";

/// Business rules the engine enforces that a deployment may tune.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePolicy {
    /// Per-night fee for every guest beyond the first, captured on new reservations.
    pub default_extra_guest_fee: Decimal,
    /// How far ahead of today a night may be booked.
    pub booking_horizon_months: u32,
    /// Reject date/room changes once a reservation has a check-in on record.
    pub freeze_after_check_in: bool,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            default_extra_guest_fee: Decimal::new(2000, 2),
            booking_horizon_months: 12,
            freeze_after_check_in: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub policy: EnginePolicy,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = EnginePolicy::default();
        let mut horizon = parse_or(
            &lookup,
            "BUNKBOOK_BOOKING_HORIZON_MONTHS",
            defaults.booking_horizon_months,
        );
        if horizon == 0 || horizon > MAX_HORIZON_MONTHS {
            warn!(
                horizon,
                "BUNKBOOK_BOOKING_HORIZON_MONTHS out of range, using {}",
                defaults.booking_horizon_months
            );
            horizon = defaults.booking_horizon_months;
        }
        let mut fee = parse_or(
            &lookup,
            "BUNKBOOK_EXTRA_GUEST_FEE",
            defaults.default_extra_guest_fee,
        );
        if fee.is_sign_negative() {
            warn!(%fee, "negative BUNKBOOK_EXTRA_GUEST_FEE, using default");
            fee = defaults.default_extra_guest_fee;
        }

        Self {
            data_dir: lookup("BUNKBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: lookup("BUNKBOOK_METRICS_PORT").and_then(|raw| match raw.parse() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!(value = %raw, "ignoring malformed BUNKBOOK_METRICS_PORT");
                    None
                }
            }),
            compact_threshold: parse_or(&lookup, "BUNKBOOK_COMPACT_THRESHOLD", 1000),
            policy: EnginePolicy {
                default_extra_guest_fee: fee,
                booking_horizon_months: horizon,
                freeze_after_check_in: parse_or(
                    &lookup,
                    "BUNKBOOK_FREEZE_AFTER_CHECK_IN",
                    defaults.freeze_after_check_in,
                ),
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(value = %raw, "malformed {key}, using default {default}");
            default
        }),
    }
}
