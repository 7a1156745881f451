
use std::sync::Arc;

use chrono::{Duration, Utc};

use test_harness::*;
use workqueue::config::QueueConfig;
use workqueue::location::{
    BlockSubscriptions, DatasetSubscriptions, LocationResolver, StaticReplicaCatalog,
    Subscription,
};
use workqueue::scheduler::SiteCapacity;

fn suspended(node: &str) -> Subscription {
    Subscription {
        node: node.to_string(),
        suspended: Some("y".to_string()),
    }
}

fn block_subscriptions(name: &str, nodes: &[&str]) -> BlockSubscriptions {
    BlockSubscriptions {
        name: name.to_string(),
        subscriptions: nodes.iter().map(|n| Subscription::active(*n)).collect(),
    }
}

fn sorted(mut sites: Vec<String>) -> Vec<String> {
    sites.sort();
    sites
}

#[tokio::test]
async fn test_location_mode_requires_complete_blocks() {
    let catalog = Arc::new(StaticReplicaCatalog::new());
    catalog.add_replica(&block_name("b1"), "T2_X", true, true);
    catalog.add_replica(&block_name("b2"), "T2_Y", false, true);
    let mut resolver = LocationResolver::new(&QueueConfig::local(), catalog.clone());

    let locations = resolver
        .locations(&[block_name("b1"), block_name("b2")], true)
        .await
        .unwrap();

    assert_eq!(locations[&block_name("b1")], vec!["T2_X".to_string()]);
    assert!(locations[&block_name("b2")].is_empty());

    let query = &catalog.replica_queries()[0];
    assert!(query.complete_only);
    assert!(query.subscribed_only);
    assert!(query.update_since.is_none());
}

#[tokio::test]
async fn test_release_incomplete_blocks() {
    let catalog = Arc::new(StaticReplicaCatalog::new());
    catalog.add_replica(&block_name("b2"), "T2_Y", false, false);
    let mut config = QueueConfig::local();
    config.release_incomplete_blocks = true;
    config.release_require_subscribed = false;
    let mut resolver = LocationResolver::new(&config, catalog);

    let locations = resolver.locations(&[block_name("b2")], true).await.unwrap();

    assert_eq!(locations[&block_name("b2")], vec!["T2_Y".to_string()]);
}

#[tokio::test]
async fn test_incremental_refresh_uses_watermark() {
    let catalog = Arc::new(StaticReplicaCatalog::new());
    catalog.add_replica(&block_name("b1"), "T2_X", true, true);
    let mut resolver = LocationResolver::new(&QueueConfig::local(), catalog.clone());

    resolver.locations(&[block_name("b1")], true).await.unwrap();
    let watermark = resolver.last_update();
    resolver.locations(&[block_name("b1")], false).await.unwrap();
    resolver.locations(&[block_name("b1")], true).await.unwrap();

    let queries = catalog.replica_queries();
    assert_eq!(queries.len(), 3);
    assert!(watermark.is_some());
    assert_eq!(queries[1].update_since, watermark);
    assert!(queries[2].update_since.is_none());
}

#[tokio::test]
async fn test_full_refresh_interval() {
    let catalog = Arc::new(StaticReplicaCatalog::new());
    let mut resolver = LocationResolver::new(&QueueConfig::default(), catalog);
    let now = Utc::now();

    assert!(resolver.full_refresh_due(now));
    resolver.mark_full_refresh(now);
    assert!(!resolver.full_refresh_due(now + Duration::seconds(60)));
    assert!(resolver.full_refresh_due(now + Duration::seconds(3601)));
}

#[tokio::test]
async fn test_dataset_subscription_skips_suspended() {
    let catalog = Arc::new(StaticReplicaCatalog::new());
    catalog.set_dataset_subscriptions(DatasetSubscriptions {
        name: DATASET.to_string(),
        subscriptions: vec![Subscription::active("T1_A"), suspended("T1_B")],
        blocks: Vec::new(),
    });
    let mut resolver = LocationResolver::new(&QueueConfig::default(), catalog);

    let locations = resolver
        .locations(&[DATASET.to_string()], true)
        .await
        .unwrap();

    assert_eq!(locations[DATASET], vec!["T1_A".to_string()]);
}

#[tokio::test]
async fn test_dataset_falls_back_to_common_block_subscriptions() {
    let catalog = Arc::new(StaticReplicaCatalog::new());
    catalog.set_dataset_subscriptions(DatasetSubscriptions {
        name: DATASET.to_string(),
        subscriptions: Vec::new(),
        blocks: vec![
            block_subscriptions(&block_name("b1"), &["T1_A", "T2_B"]),
            block_subscriptions(&block_name("b2"), &["T2_B", "T2_C"]),
        ],
    });
    let mut resolver = LocationResolver::new(&QueueConfig::default(), catalog);

    let locations = resolver
        .locations(&[DATASET.to_string()], true)
        .await
        .unwrap();

    assert_eq!(locations[DATASET], vec!["T2_B".to_string()]);
}

#[tokio::test]
async fn test_block_location_includes_dataset_subscriptions() {
    let catalog = Arc::new(StaticReplicaCatalog::new());
    catalog.set_dataset_subscriptions(DatasetSubscriptions {
        name: DATASET.to_string(),
        subscriptions: vec![Subscription::active("T1_D")],
        blocks: vec![block_subscriptions(&block_name("b1"), &["T2_A"])],
    });
    let mut resolver = LocationResolver::new(&QueueConfig::default(), catalog.clone());

    let locations = resolver
        .locations(&[block_name("b1"), block_name("b2")], true)
        .await
        .unwrap();

    assert_eq!(
        sorted(locations[&block_name("b1")].clone()),
        vec!["T1_D".to_string(), "T2_A".to_string()]
    );
    assert_eq!(locations[&block_name("b2")], vec!["T1_D".to_string()]);

    let query = &catalog.subscription_queries()[0];
    assert_eq!(query.blocks.len(), 2);
    assert!(query.datasets.is_empty());
}

#[tokio::test]
async fn test_queue_location_refresh_enables_matching() {
    let test = build_queue(QueueConfig::local());
    test.queue
        .queue_workload(processing_workload("proc"), None)
        .await
        .unwrap();
    test.replicas.add_replica(&block_name("b1"), "T2_X", true, true);

    assert_eq!(test.queue.update_location_info().await.unwrap(), 1);
    assert!(test.queue.sites().await.contains("T2_X"));
    assert!(test
        .queue
        .data_locations(&block_name("b1"))
        .await
        .contains("T2_X"));

    let capacity: SiteCapacity = [("T2_X".to_string(), 10)].into_iter().collect();
    let work = test.queue.get_work(&capacity, None).await.unwrap();
    assert_eq!(work.len(), 1);
    assert_eq!(work[0].site, "T2_X");
}
