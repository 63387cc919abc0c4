use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Clock;

/// Background task that periodically releases expired holds. Pure storage
/// hygiene: every reader already ignores expired holds, so nothing is
/// allowed to depend on this loop having run.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let expired = engine.collect_expired_holds(Clock::system().now_ms);
        for (hold_id, _provider_id) in expired {
            match engine.release_hold(hold_id).await {
                Ok(_) => info!("reaped expired hold {hold_id}"),
                Err(e) => {
                    // May already have been released or consumed
                    tracing::debug!("reaper skip {hold_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal(Clock::system().now_ms).await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Collaborators;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("cadence_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_collects_expired_holds() {
        let path = test_wal_path("reaper_collect.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify, Collaborators::disabled()).unwrap());

        let pid = Ulid::new();
        engine.register_provider(pid, "Ada".into(), true).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 8, 10).unwrap();
        let clock = Clock::fixed(date, 9 * 60);
        let hold_id = Ulid::new();
        engine
            .place_hold(hold_id, pid, date, 540, 60_000, &clock)
            .await
            .unwrap();

        // Not expired yet
        assert!(engine.collect_expired_holds(clock.now_ms).is_empty());

        // One minute later it is
        let expired = engine.collect_expired_holds(clock.now_ms + 60_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, hold_id);

        engine.release_hold(hold_id).await.unwrap();
        assert!(engine.collect_expired_holds(clock.now_ms + 60_000).is_empty());
    }
}
