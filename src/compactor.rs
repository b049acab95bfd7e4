use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("compaction skipped: {e}");
        }
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await?;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "WAL compacted in background");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EnginePolicy;
    use crate::model::RoomCategory;
    use crate::notify::NotifyHub;
    use rust_decimal_macros::dec;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bunkbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(
            path,
            Arc::new(NotifyHub::new()),
            EnginePolicy::default(),
            Arc::new(FixedClock::on("2024-05-01".parse().unwrap())),
        )
        .unwrap();

        engine
            .create_room(1, RoomCategory::Exclusive, dec!(80.00))
            .await
            .unwrap();
        for price in [dec!(81.00), dec!(82.00), dec!(83.00)] {
            engine.set_room_price(1, price).await.unwrap();
        }

        assert!(!compact_if_due(&engine, 10).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await.unwrap(), 4);

        assert!(compact_if_due(&engine, 4).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await.unwrap(), 0);
        assert_eq!(engine.room_by_number(1).await.unwrap().price, dec!(83.00));
    }
}
