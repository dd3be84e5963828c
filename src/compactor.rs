use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts a site's WAL once enough appends pile up.
/// Runs until the engine is the last `Arc` holder left.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if Arc::strong_count(&engine) == 1 {
            debug!("compactor: engine dropped, stopping");
            return;
        }
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns true if a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Principal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("makerlab_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path).unwrap();
        let op = Principal::operator();

        let uid = Ulid::new();
        let mid = Ulid::new();
        engine.register_user(&op, uid, "Ada".into(), false).await.unwrap();
        engine.create_machine(&op, mid, "Lathe".into(), "lathe".into(), true).await.unwrap();

        assert!(!compact_if_needed(&engine, 10).await);

        for _ in 0..5 {
            engine.grant_certification(&op, uid, mid).await.unwrap();
            engine.revoke_certification(&op, uid, mid).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 12);

        assert!(compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
