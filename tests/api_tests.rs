// HTTP API integration tests against fully wired services

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use orbitgate_core::{BBox, PipelineConfig};
use orbitgate_eye::Detection;
use orbitgate_server::{create_router, ApiState, Services};
use orbitgate_storage::WorkQueue;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn create_services() -> Services {
    let services = Services::build(PipelineConfig::default()).await.unwrap();
    services.start();
    services
}

fn router(services: &Services) -> axum::Router {
    create_router(ApiState::new(
        services.brain.clone(),
        services.config.detector.clone(),
    ))
}

async fn send(services: &Services, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router(services).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn seed_object(services: &Services, frames: usize) -> String {
    let det = Detection::new(BBox::new(0.0, 0.0, 10.0, 10.0), 41, "cup", 0.9);
    let mut id = String::new();
    for i in 0..frames {
        id = services
            .brain
            .process_detections(&format!("f{}", i), &[det.clone()], Some(i as f64))
            .await
            .unwrap()
            .remove(0);
    }
    id
}

#[tokio::test]
async fn test_health_reports_durable_connection() {
    let services = create_services().await;
    let (status, body) = send(&services, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], true);
    assert_eq!(body["durable"], true);
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_list_objects_with_status_filter() {
    let services = create_services().await;
    let observing = seed_object(&services, 3).await;
    services
        .brain
        .process_detections(
            "other",
            &[Detection::new(BBox::new(300.0, 300.0, 320.0, 320.0), 0, "person", 0.8)],
            Some(3.0),
        )
        .await
        .unwrap();

    let (status, body) = send(&services, "GET", "/objects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let (_, body) = send(&services, "GET", "/objects?status=observing", None).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["objects"][0]["id"], observing.as_str());

    let (status, body) = send(&services, "GET", "/objects?status=flying", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_operator_quarantine_then_admit() {
    let services = create_services().await;
    let id = seed_object(&services, 3).await;

    let (status, body) = send(
        &services,
        "POST",
        &format!("/objects/{}/quarantine", id),
        Some(json!({"reason": "blurry"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    // Second call is a no-op
    let (_, body) = send(&services, "POST", &format!("/objects/{}/quarantine", id), None).await;
    assert_eq!(body["success"], true);
    assert!(body["message"].as_str().unwrap().contains("already"));

    let (_, body) = send(&services, "GET", &format!("/objects/{}", id), None).await;
    assert_eq!(body["status"], "quarantine");

    let (status, body) = send(&services, "POST", &format!("/objects/{}/admit", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = send(&services, "GET", &format!("/objects/{}", id), None).await;
    assert_eq!(body["status"], "observing");
    let notes = body["notes"].as_array().unwrap();
    assert_eq!(notes.last().unwrap()["reason"], "manual admit: operator admit");

    assert_eq!(
        services.store.pop(WorkQueue::Recon, None).await.unwrap(),
        Some(id.clone())
    );
    let entry = services.store.pop_quarantine(None).await.unwrap().unwrap();
    assert_eq!(entry.reason, "blurry");
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_history_after_flush() {
    let services = create_services().await;
    let id = seed_object(&services, 3).await;
    services
        .brain
        .record_metrics(&id, &orbitgate_core::QualityMetrics::conservative(), Some(10.0))
        .await
        .unwrap();
    services.brain.evaluate_admission(&id).await.unwrap();

    // Buffered rows are not visible until flushed
    let (_, body) = send(&services, "GET", &format!("/objects/{}/history", id), None).await;
    assert_eq!(body["metrics"].as_array().unwrap().len(), 0);

    services.persistence.flush_all().await.unwrap();
    let (status, body) = send(&services, "GET", &format!("/objects/{}/history?limit=1", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let metrics = body["metrics"].as_array().unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0]["decision"], "observe");
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_config_round_trip() {
    let services = create_services().await;

    let (status, body) = send(&services, "GET", "/objects/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["brain"]["thresholds"]["orbit_deg_min"], 240.0);
    assert_eq!(body["tracker"]["iou_threshold"], 0.5);

    let mut brain = body["brain"].clone();
    brain["observation_min_views"] = json!(5);
    let (status, body) = send(
        &services,
        "POST",
        "/objects/config",
        Some(json!({"brain": brain, "tracker": {"iou_threshold": 0.25}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["brain"]["observation_min_views"], 5);
    assert_eq!(body["tracker"]["iou_threshold"], 0.25);
    assert_eq!(services.tracker.config().iou_threshold, 0.25);

    // An invalid tracker rejects the whole request
    let (status, _) = send(
        &services,
        "POST",
        "/objects/config",
        Some(json!({"brain": {"observation_min_views": 7}, "tracker": {"iou_threshold": 4.0}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(services.brain.config().observation_min_views, 5);
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_per_class_thresholds_change_quality_report() {
    let services = create_services().await;
    let id = seed_object(&services, 3).await;

    let (status, _) = send(
        &services,
        "POST",
        "/objects/config/per-class-thresholds",
        Some(json!({
            "class": "cup",
            "thresholds": {
                "orbit_deg_min": 0.0,
                "mvs_consistency_max": 1.0,
                "silhouette_iou_min": 0.0,
                "texture_cov_min": 0.0,
                "scale_conf_min": 0.0
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&services, "GET", &format!("/objects/{}/quality", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meets_thresholds"], true);
    assert_eq!(body["thresholds"]["orbit_deg_min"], 0.0);

    let (status, _) = send(
        &services,
        "POST",
        "/objects/config/per-class-thresholds",
        Some(json!({"class": " ", "thresholds": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    services.shutdown().await.unwrap();
}
