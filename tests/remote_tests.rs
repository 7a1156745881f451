
use std::time::Duration;

use axum::{http::StatusCode, routing::post, Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use test_harness::*;
use workqueue::api::{router, ApiState};
use workqueue::config::QueueConfig;
use workqueue::error::WorkQueueError;
use workqueue::remote::http::endpoints;
use workqueue::remote::{ErrorBody, HttpQueueClient, RemoteQueue};
use workqueue::scheduler::{ElementFilter, ElementSelector, ElementStatus, SiteCapacity};
use workqueue::service::{CycleReport, MaintenanceService};

const CHILD_URL: &str = "http://child.example:8240";

fn capacity(entries: &[(&str, u64)]) -> SiteCapacity {
    entries
        .iter()
        .map(|(site, slots)| (site.to_string(), *slots))
        .collect()
}

/// Serve `app` on an ephemeral local port and return its base URL.
async fn serve(app: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

/// A root queue served over HTTP plus a child that reaches it through
/// `HttpQueueClient`.
async fn http_parent_and_child(
    child_config: QueueConfig,
) -> (TestQueue, TestQueue, JoinHandle<()>) {
    let parent = build_queue(QueueConfig::default());
    let (url, handle) = serve(router(ApiState {
        queue: parent.queue.clone(),
    }))
    .await;
    let child = build_queue(child_config.with_parent(url, CHILD_URL));
    (parent, child, handle)
}

#[tokio::test]
async fn test_pull_work_over_http() {
    let (parent, child, server) = http_parent_and_child(QueueConfig::default()).await;
    parent
        .queue
        .queue_workload(monte_carlo_workload("mc", 3000, 1000), None)
        .await
        .unwrap();

    let pulled = child.queue.pull_work(&capacity(&[("siteA", 3)])).await.unwrap();

    assert_eq!(pulled, 1);
    let local = child.queue.status(&ElementFilter::default()).await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].status, ElementStatus::Available);
    assert_eq!(local[0].jobs, 3);
    assert_eq!(local[0].workload_name, "mc");

    let upstream = parent
        .queue
        .get(local[0].parent_queue_id.unwrap())
        .await
        .unwrap();
    assert_eq!(upstream.status, ElementStatus::Negotiating);
    assert_eq!(upstream.child_queue_url.as_deref(), Some(CHILD_URL));

    server.abort();
}

#[tokio::test]
async fn test_update_parent_over_http_applies_forced_cancel() {
    let (parent, child, server) = http_parent_and_child(QueueConfig::default()).await;
    parent
        .queue
        .queue_workload(monte_carlo_workload("mc", 1000, 1000), None)
        .await
        .unwrap();
    child.queue.pull_work(&capacity(&[("siteA", 1)])).await.unwrap();
    let local = child.queue.status(&ElementFilter::default()).await;
    let parent_id = local[0].parent_queue_id.unwrap();

    assert_eq!(child.queue.update_parent().await.unwrap(), 1);
    assert_eq!(
        parent.queue.get(parent_id).await.unwrap().status,
        ElementStatus::Acquired
    );

    parent
        .queue
        .cancel_work(&ElementSelector::id(parent_id))
        .await
        .unwrap();
    child
        .queue
        .got_work(&ElementSelector::id(local[0].id))
        .await
        .unwrap();
    child.queue.update_parent().await.unwrap();

    let element = child.queue.get(local[0].id).await.unwrap();
    assert_eq!(element.status, ElementStatus::Canceled);
    assert_eq!(
        parent.queue.get(parent_id).await.unwrap().status,
        ElementStatus::Canceled
    );

    server.abort();
}

#[tokio::test]
async fn test_dead_parent_port_fails_soft() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut config = QueueConfig::default().with_parent(dead.clone(), CHILD_URL);
    config.remote_timeout = 2;
    let child = build_queue(config);
    child
        .queue
        .queue_workload(monte_carlo_workload("local", 1000, 1000), Some(3))
        .await
        .unwrap();

    assert_eq!(child.queue.pull_work(&capacity(&[("siteA", 2)])).await.unwrap(), 0);
    assert_eq!(child.queue.update_parent().await.unwrap(), 0);

    let client = HttpQueueClient::new(dead, Duration::from_secs(2)).unwrap();
    let err = client
        .get_work(&capacity(&[("siteA", 1)]), CHILD_URL)
        .await
        .unwrap_err();
    assert!(err.is_remote());
}

#[tokio::test]
async fn test_server_error_maps_to_remote_unavailable() {
    let failing = Router::new().route(
        endpoints::GET_WORK,
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "database down".to_string(),
                }),
            )
        }),
    );
    let (url, server) = serve(failing).await;
    let client = HttpQueueClient::new(url.clone(), Duration::from_secs(2)).unwrap();

    let err = client
        .get_work(&capacity(&[("siteA", 1)]), CHILD_URL)
        .await
        .unwrap_err();
    match err {
        WorkQueueError::RemoteUnavailable(message) => assert!(message.contains("database down")),
        other => panic!("unexpected error: {other}"),
    }

    // a child behind the failing parent still answers from local work
    let child = build_queue(QueueConfig::default().with_parent(url, CHILD_URL));
    assert_eq!(child.queue.pull_work(&capacity(&[("siteA", 2)])).await.unwrap(), 0);

    server.abort();
}

#[tokio::test]
async fn test_client_operator_calls() {
    let parent = build_queue(QueueConfig::default());
    let (url, server) = serve(router(ApiState {
        queue: parent.queue.clone(),
    }))
    .await;
    let client = HttpQueueClient::new(url, Duration::from_secs(2)).unwrap();
    parent
        .queue
        .queue_workload(monte_carlo_workload("mc", 1000, 1000), None)
        .await
        .unwrap();

    assert_eq!(client.set_priority(7, vec!["mc".to_string()]).await.unwrap(), 1);
    let available = client.elements(Some(ElementStatus::Available)).await.unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].priority, 7);

    let missing = client
        .set_status(ElementStatus::Done, ElementSelector::id(9999))
        .await;
    assert!(matches!(missing, Err(WorkQueueError::NoMatch { .. })));

    server.abort();
}

#[tokio::test]
async fn test_maintenance_cycle_pulls_and_reports() {
    let child_config = QueueConfig::default().with_resource("siteA", 1);
    let (parent, child, server) = http_parent_and_child(child_config).await;
    parent
        .queue
        .queue_workload(monte_carlo_workload("mc", 1000, 1000), None)
        .await
        .unwrap();

    let report = MaintenanceService::new(child.queue.clone()).run_cycle().await;

    assert_eq!(
        report,
        CycleReport {
            locations_updated: 0,
            negotiations_released: 0,
            elements_pulled: 1,
            reports_sent: 1,
        }
    );
    let local = child.queue.status(&ElementFilter::default()).await;
    assert_eq!(
        parent
            .queue
            .get(local[0].parent_queue_id.unwrap())
            .await
            .unwrap()
            .status,
        ElementStatus::Acquired
    );

    // nothing new to pull or report
    let idle = MaintenanceService::new(child.queue.clone()).run_cycle().await;
    assert_eq!(idle, CycleReport::default());

    server.abort();
}

#[tokio::test]
async fn test_maintenance_cycle_releases_stale_negotiations() {
    let mut config = QueueConfig::default();
    config.negotiation_timeout = 0;
    let root = build_queue(config);
    root.queue
        .queue_workload(monte_carlo_workload("mc", 1000, 1000), None)
        .await
        .unwrap();
    let work = root
        .queue
        .get_work(&capacity(&[("siteA", 1)]), Some(CHILD_URL))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = MaintenanceService::new(root.queue.clone()).run_cycle().await;

    assert_eq!(report.negotiations_released, 1);
    assert_eq!(report.elements_pulled, 0);
    assert_eq!(report.reports_sent, 0);
    assert_eq!(
        root.queue.get(work[0].element_id).await.unwrap().status,
        ElementStatus::Available
    );
}
