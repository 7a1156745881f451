
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use test_harness::*;
use workqueue::api::{router, ApiState};
use workqueue::config::QueueConfig;
use workqueue::scheduler::ElementStatus;

fn app(test: &TestQueue) -> Router {
    router(ApiState {
        queue: test.queue.clone(),
    })
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_queue_work_and_list_elements() {
    let test = build_queue(QueueConfig::default());
    let specs = TempDir::new().unwrap();
    let path = specs.path().join("mc.json");
    std::fs::write(
        &path,
        serde_json::to_string(&monte_carlo_workload("mc", 2000, 1000)).unwrap(),
    )
    .unwrap();

    let (status, body) = send(
        app(&test),
        post(
            "/workqueue/queuework",
            json!({ "url": path.to_string_lossy() }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["units"], 1);

    let (status, body) = send(app(&test), get("/workqueue/elements?status=Available")).await;
    assert_eq!(status, StatusCode::OK);
    let elements = body.as_array().unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0]["workload_name"], "mc");
    assert_eq!(elements[0]["status"], "Available");
    assert_eq!(elements[0]["jobs"], 2);
}

#[tokio::test]
async fn test_get_work_over_http() {
    let test = build_queue(QueueConfig::default());
    test.queue
        .queue_workload(monte_carlo_workload("mc", 1000, 1000), None)
        .await
        .unwrap();

    let (status, body) = send(
        app(&test),
        post(
            "/workqueue/getwork",
            json!({
                "site_capacity": { "siteA": 4 },
                "caller_url": "http://child.example:8240"
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let work = body.as_array().unwrap();
    assert_eq!(work.len(), 1);
    assert_eq!(work[0]["site"], "siteA");
    assert_eq!(work[0]["workload"]["name"], "mc");

    let id = work[0]["element_id"].as_u64().unwrap();
    assert_eq!(
        test.queue.get(id).await.unwrap().status,
        ElementStatus::Negotiating
    );
}

#[tokio::test]
async fn test_synchronize_over_http_returns_forced_status() {
    let test = build_queue(QueueConfig::default());
    test.queue
        .queue_workload(monte_carlo_workload("mc", 1000, 1000), None)
        .await
        .unwrap();
    let id = test
        .queue
        .get_work(
            &[("siteA".to_string(), 1)].into_iter().collect(),
            Some("http://child.example:8240"),
        )
        .await
        .unwrap()[0]
        .element_id;
    test.queue
        .fail_work(&workqueue::scheduler::ElementSelector::id(id))
        .await
        .unwrap();

    let (status, body) = send(
        app(&test),
        post(
            "/workqueue/synchronize",
            json!({
                "child_url": "http://child.example:8240",
                "reports": [{ "parent_queue_id": id, "status": "Acquired" }]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "Failed": [id] }));
}

#[tokio::test]
async fn test_set_status_no_match_is_not_found() {
    let test = build_queue(QueueConfig::default());

    let (status, body) = send(
        app(&test),
        post(
            "/workqueue/status",
            json!({
                "status": "Done",
                "selector": { "type": "ids", "values": [12345] }
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Status not changed: no matching elements");
}

#[tokio::test]
async fn test_set_status_and_priority() {
    let test = build_queue(QueueConfig::default());
    test.queue
        .queue_workload(monte_carlo_workload("mc", 1000, 1000), None)
        .await
        .unwrap();

    let (status, body) = send(
        app(&test),
        post(
            "/workqueue/priority",
            json!({ "priority": 9, "workflows": ["mc"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 1);

    let (status, body) = send(
        app(&test),
        post(
            "/workqueue/status",
            json!({
                "status": "Canceled",
                "selector": { "type": "workflows", "values": ["mc"] }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 1);
    assert!(test.queue.is_empty().await);
}

#[tokio::test]
async fn test_bad_status_filter_is_bad_request() {
    let test = build_queue(QueueConfig::default());

    let (status, _) = send(app(&test), get("/workqueue/elements?status=Sleeping")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_spec_is_bad_request() {
    let test = build_queue(QueueConfig::default());

    let (status, body) = send(
        app(&test),
        post(
            "/workqueue/queuework",
            json!({ "url": "/does/not/exist.json" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cannot read spec"));
}
