// Durable persistence integration tests: buffering, flush loop, retry, sled durability

use orbitgate_core::{
    AdmissionDecision, AssetRecord, AssetStage, EmotionRecord, MetricRecord, ObjectRecord,
    ObjectStatus, PersistenceConfig, QualityMetrics, RecordKind,
};
use orbitgate_storage::{DurableStore, MemoryDurableStore, ObjectPersistence, SledStore};
use std::sync::Arc;
use std::time::Duration;

fn object(id: &str, status: ObjectStatus, ts: f64) -> ObjectRecord {
    ObjectRecord {
        id: id.to_string(),
        class: "cup".to_string(),
        status,
        notes: Vec::new(),
        updated_at: ts,
    }
}

fn metric(id: &str, ts: f64, decision: Option<AdmissionDecision>) -> MetricRecord {
    MetricRecord {
        obj_id: id.to_string(),
        timestamp: ts,
        metrics: QualityMetrics::conservative(),
        decision,
    }
}

fn config(buffer_size: usize, flush_interval_secs: u64) -> PersistenceConfig {
    PersistenceConfig {
        buffer_size,
        flush_interval_secs,
        ..Default::default()
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..300 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_size_triggered_flush_runs_once() {
    let durable = Arc::new(MemoryDurableStore::new());
    let persistence = Arc::new(ObjectPersistence::new(durable.clone(), &config(100, 3600)));
    persistence.connect().await.unwrap();
    persistence.start_flush_loop();

    for i in 0..100 {
        persistence
            .sync_object(object(&format!("obj-{}", i), ObjectStatus::Pending, i as f64), false)
            .await
            .unwrap();
    }
    wait_until(|| persistence.buffered_len(RecordKind::Object) == 0).await;
    // Let a spurious second flush show up if there were one
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(persistence.buffered_len(RecordKind::Object), 0);
    assert_eq!(durable.committed_batches(), 1);
    assert_eq!(durable.record_count(RecordKind::Object), 100);
    persistence.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_flush_retains_records_for_next_tick() {
    let durable = Arc::new(MemoryDurableStore::new());
    let persistence = Arc::new(ObjectPersistence::new(durable.clone(), &config(1000, 1)));
    persistence.connect().await.unwrap();

    for i in 0..5 {
        persistence.sync_metrics(metric("obj-1", i as f64, None)).unwrap();
    }
    durable.fail_next_writes(1);
    assert!(persistence.flush_all().await.is_err());
    assert_eq!(persistence.buffered_len(RecordKind::Metric), 5);

    // The periodic loop retries on its own
    persistence.start_flush_loop();
    wait_until(|| persistence.buffered_len(RecordKind::Metric) == 0).await;
    assert_eq!(durable.record_count(RecordKind::Metric), 5);

    let history = persistence.get_object_metrics("obj-1", 3).await.unwrap();
    assert_eq!(
        history.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
        vec![4.0, 3.0, 2.0]
    );
    persistence.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_every_kind() {
    let durable = Arc::new(MemoryDurableStore::new());
    let persistence = Arc::new(ObjectPersistence::new(durable.clone(), &config(100, 3600)));
    persistence.connect().await.unwrap();
    persistence.start_flush_loop();

    persistence
        .sync_object(object("obj-1", ObjectStatus::Observing, 1.0), false)
        .await
        .unwrap();
    persistence.sync_metrics(metric("obj-1", 1.0, Some(AdmissionDecision::Observe))).unwrap();
    persistence.sync_asset(AssetRecord {
        obj_id: "obj-1".to_string(),
        stage: AssetStage::Proxy,
        path: "/assets/obj-1/proxy.ply".to_string(),
        quality_score: Some(0.4),
        timestamp: 2.0,
    })
    .unwrap();
    persistence.sync_emotion(EmotionRecord {
        obj_id: "obj-1".to_string(),
        timestamp: 3.0,
        tags: vec!["calm".to_string()],
        valence: 0.2,
        arousal: -0.1,
        confidence: 0.8,
    })
    .unwrap();

    let report = persistence.shutdown().await.unwrap();
    assert_eq!(report.total(), 4);
    for kind in [RecordKind::Object, RecordKind::Metric, RecordKind::Asset, RecordKind::Emotion] {
        assert_eq!(report.count(kind), 1);
        assert_eq!(persistence.buffered_len(kind), 0);
    }
    assert!(!persistence.is_flush_loop_running());
    assert_eq!(persistence.get_object_assets("obj-1").await.unwrap().len(), 1);
    assert_eq!(persistence.get_object_emotions("obj-1", 10).await.unwrap()[0].tags, vec!["calm"]);
}

#[tokio::test]
async fn test_forced_sync_is_visible_immediately() {
    let durable = Arc::new(MemoryDurableStore::new());
    let persistence = ObjectPersistence::new(durable, &config(100, 3600));
    persistence
        .sync_object(object("obj-9", ObjectStatus::Pending, 1.0), true)
        .await
        .unwrap();
    assert!(persistence.get_object("obj-9").await.unwrap().is_some());

    persistence
        .sync_object(object("obj-9", ObjectStatus::Observing, 2.0), false)
        .await
        .unwrap();
    // Buffered writes are not read back
    let row = persistence.get_object("obj-9").await.unwrap().unwrap();
    assert_eq!(row.status, ObjectStatus::Pending);
}

#[tokio::test]
async fn test_sled_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orbitgate-db");

    {
        let durable = Arc::new(SledStore::open(&path).unwrap());
        let persistence = ObjectPersistence::new(durable, &config(100, 3600));
        persistence.connect().await.unwrap();
        persistence
            .sync_object(object("obj-1", ObjectStatus::Pending, 1.0), false)
            .await
            .unwrap();
        persistence
            .sync_object(object("obj-1", ObjectStatus::Ready, 9.0), false)
            .await
            .unwrap();
        for ts in [1.0, 2.0, 3.0] {
            persistence.sync_metrics(metric("obj-1", ts, None)).unwrap();
        }
        persistence.sync_metrics(metric("obj-10", 5.0, None)).unwrap();
        persistence.shutdown().await.unwrap();
        persistence.disconnect().await.unwrap();
    }

    let reopened = SledStore::open(&path).unwrap();
    let row = reopened.get_object("obj-1").await.unwrap().unwrap();
    assert_eq!(row.status, ObjectStatus::Ready);
    assert_eq!(row.created_at, 1.0);
    assert_eq!(row.updated_at, 9.0);

    let metrics = reopened.get_object_metrics("obj-1", 10).await.unwrap();
    assert_eq!(
        metrics.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
        vec![3.0, 2.0, 1.0]
    );
    assert_eq!(reopened.get_object_metrics("obj-10", 10).await.unwrap().len(), 1);
    assert!(reopened.get_object("missing").await.unwrap().is_none());
}
