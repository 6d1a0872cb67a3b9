use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use crate::integration::common::{setup_test_app, TEST_SECRET};

fn job_body(case_file_id: Uuid, tenant_id: Uuid) -> serde_json::Value {
    serde_json::json!({
        "caseFileId": case_file_id,
        "caseNumber": "00123-2025-0-1801-JR-CI-01",
        "tenantId": tenant_id,
    })
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("authorization", format!("Bearer {TEST_SECRET}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn health_returns_200() {
    let (app, _pool, _container) = setup_test_app().await;

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert!(json["uptime"].is_u64());
    assert_eq!(json["checks"]["database"], "ok");
    assert_eq!(json["checks"]["queueStore"], "ok");
    assert_eq!(json["checks"]["browserPool"], "disabled");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let (app, _pool, _container) = setup_test_app().await;

    let response = app
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_secret_returns_401() {
    let (app, _pool, _container) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::post("/jobs/initial")
                .header("authorization", "Bearer wrong-key")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn initial_job_is_accepted_and_deduplicated() {
    let (app, _pool, _container) = setup_test_app().await;
    let case_file_id = Uuid::new_v4();
    let tenant_id = Uuid::new_v4();
    let body = job_body(case_file_id, tenant_id);

    let response = app
        .clone()
        .oneshot(post_json("/jobs/initial", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let first: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(first["lane"], "initial");
    let first_id = first["jobId"].as_str().unwrap().to_string();

    // Same case file, same calendar day: the existing job comes back.
    let response = app
        .oneshot(post_json("/jobs/initial", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let second: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(second["jobId"].as_str().unwrap(), first_id);
}

#[tokio::test]
async fn priority_jobs_never_deduplicate() {
    let (app, _pool, _container) = setup_test_app().await;
    let body = job_body(Uuid::new_v4(), Uuid::new_v4());

    let mut ids = Vec::new();
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json("/jobs/priority", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        ids.push(json["jobId"].as_str().unwrap().to_string());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert_ne!(ids[0], ids[1]);
}

#[tokio::test]
async fn status_reports_lane_counts() {
    let (app, _pool, _container) = setup_test_app().await;
    let body = job_body(Uuid::new_v4(), Uuid::new_v4());

    app.clone()
        .oneshot(post_json("/jobs/initial", &body))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::get("/status")
                .header("authorization", format!("Bearer {TEST_SECRET}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    let lanes = json["lanes"].as_array().unwrap();
    assert_eq!(lanes.len(), 3);
    let initial = lanes.iter().find(|l| l["lane"] == "initial").unwrap();
    assert_eq!(initial["pending"], 1);
    assert!(json["browserPool"].is_null());
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let (app, _pool, _container) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::post("/jobs/initial")
                .header("authorization", format!("Bearer {TEST_SECRET}"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"caseNumber": "only-this"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(
        response.status().is_client_error(),
        "missing fields must be a 4xx, got {}",
        response.status()
    );
}
