// Remote detector tests against a mock inference endpoint

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use image::DynamicImage;
use orbitgate_core::{BBox, DetectorBackend, DetectorConfig};
use orbitgate_eye::{Detector, DetectorFactory, EyeError, Frame};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct MockInference {
    requests: Arc<Mutex<Vec<(HashMap<String, String>, usize)>>>,
}

async fn detect_handler(
    State(mock): State<MockInference>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Json<Value> {
    mock.requests.lock().unwrap().push((params, body.len()));
    Json(json!([
        {"bbox": [10, 20, 50, 80], "class_id": 41, "class_name": "cup", "confidence": 0.92},
        {"bbox": [0, 0, 5, 5], "class_name": "speck", "confidence": 0.1},
        {"bbox": [60, 60, 70, 70], "class_name": "mug", "confidence": 0.55,
         "mask": [[true, true], [false, true]]}
    ]))
}

async fn failing_handler() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

/// Serve `app` on an ephemeral port and return its base URL
async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn frame() -> Frame {
    Frame::new("frame-1", DynamicImage::new_rgb8(16, 16)).with_camera("cam-0")
}

fn remote_config(endpoint: String) -> DetectorConfig {
    DetectorConfig {
        backend: DetectorBackend::Yolov8,
        endpoint: Some(endpoint),
        model: Some("yolov8n-seg".to_string()),
        device: Some("cpu".to_string()),
        conf_threshold: 0.5,
        timeout_ms: 2_000,
    }
}

#[tokio::test]
async fn test_remote_detector_filters_by_confidence() {
    let mock = MockInference::default();
    let app = Router::new()
        .route("/detect", post(detect_handler))
        .with_state(mock.clone());
    let base = spawn_server(app).await;

    let detector = DetectorFactory::new()
        .create(&remote_config(format!("{}/detect", base)))
        .unwrap();
    assert_eq!(detector.backend(), DetectorBackend::Yolov8);

    let detections = detector.detect(&frame()).await.unwrap();
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0].class_name, "cup");
    assert_eq!(detections[0].class_id, 41);
    assert_eq!(detections[0].bbox, BBox::new(10.0, 20.0, 50.0, 80.0));
    assert!(detections[0].mask.is_none());
    assert_eq!(detections[1].class_name, "mug");
    assert_eq!(detections[1].mask.as_ref().unwrap().dim(), (2, 2));

    let requests = mock.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (params, body_len) = &requests[0];
    assert_eq!(params["backend"], "yolov8");
    assert_eq!(params["model"], "yolov8n-seg");
    assert_eq!(params["device"], "cpu");
    assert_eq!(params["conf"], "0.5");
    assert!(*body_len > 0);
}

#[tokio::test]
async fn test_remote_detector_surfaces_http_errors() {
    let app = Router::new().route("/detect", post(failing_handler));
    let base = spawn_server(app).await;

    let detector = DetectorFactory::new()
        .create(&remote_config(format!("{}/detect", base)))
        .unwrap();
    let err = detector.detect(&frame()).await.unwrap_err();
    assert!(matches!(err, EyeError::Network(_)));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_an_error() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let detector = DetectorFactory::new()
        .create(&remote_config(format!("http://{}/detect", addr)))
        .unwrap();
    assert!(detector.detect(&frame()).await.is_err());
}
