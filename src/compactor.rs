use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::observability;

const COMPACT_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor tick. Returns whether a compaction ran successfully.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(observability::COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            metrics::counter!(observability::COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn details(name: &str) -> SpotDetails {
        SpotDetails {
            address: "123 Disney Lane".into(),
            city: "San Francisco".into(),
            state: "California".into(),
            country: "United States of America".into(),
            lat: 37.7645358,
            lng: -122.4730327,
            name: name.into(),
            description: "Place where web developers are created".into(),
            price: 123.0,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();

        let user = Ulid::new();
        engine
            .create_user(
                user,
                "demo-lition".into(),
                "demo@user.io".into(),
                "Demo".into(),
                "Lition".into(),
                "password".into(),
            )
            .await
            .unwrap();
        let spot = Ulid::new();
        engine.create_spot(Some(user), spot, details("First")).await.unwrap();
        engine.delete_spot(Some(user), spot).await.unwrap();
        engine.create_spot(Some(user), Ulid::new(), details("Second")).await.unwrap();

        assert!(!compact_if_due(&engine, 100).await);
        assert_eq!(engine.wal_appends_since_compact().await, 4);

        assert!(compact_if_due(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let engine = Engine::new(path).unwrap();
        let spots = engine.list_spots(&SpotFilter::default()).await.unwrap();
        assert_eq!(spots.len(), 1);
        assert_eq!(spots[0].details.name, "Second");
    }
}
