
use std::sync::Arc;

use test_harness::*;
use workqueue::catalog::{CatalogRegistry, InMemoryCatalog};
use workqueue::config::{PolicyChoice, QueueConfig, SplitParams};
use workqueue::error::WorkQueueError;
use workqueue::policy::{PolicyRegistry, StartPolicy};

fn registry() -> CatalogRegistry {
    let mut catalogs = CatalogRegistry::new();
    catalogs.set_default(two_block_catalog());
    catalogs
}

#[test]
fn test_block_policy_one_unit_per_block() {
    let workload = processing_workload("proc");
    let units = StartPolicy::Block(SplitParams::default())
        .split(&workload, &workload.tasks[0], &registry())
        .unwrap();

    assert_eq!(units.len(), 2);
    assert_eq!(units[0].data.as_deref(), Some(block_name("b1").as_str()));
    assert_eq!(units[0].jobs, 3);
    assert_eq!(units[1].jobs, 2);
    assert_eq!(
        units[1].task().input.as_ref().unwrap().blocks,
        vec![block_name("b2")]
    );
}

#[test]
fn test_block_policy_slice_size() {
    let workload = processing_workload("proc");
    let params = SplitParams {
        slice_size: Some(2),
        max_jobs_per_element: None,
    };
    let units = StartPolicy::Block(params)
        .split(&workload, &workload.tasks[0], &registry())
        .unwrap();

    // 3 files -> 2 jobs, 2 files -> 1 job
    assert_eq!(units.iter().map(|u| u.jobs).collect::<Vec<_>>(), vec![2, 1]);
}

#[test]
fn test_block_policy_honours_block_selection() {
    let mut workload = processing_workload("proc");
    workload.tasks[0].input.as_mut().unwrap().blocks = vec![block_name("b2")];

    let units = StartPolicy::Block(SplitParams::default())
        .split(&workload, &workload.tasks[0], &registry())
        .unwrap();

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].data, Some(block_name("b2")));
}

#[test]
fn test_block_parents_set_parent_flag() {
    let catalog = InMemoryCatalog::new();
    let mut block = file_block(&block_name("b1"), 1, "se.site-a");
    block.parents = vec!["/Primary/Parent/RAW#p1".to_string()];
    catalog.add_block(DATASET, block);
    let mut catalogs = CatalogRegistry::new();
    catalogs.insert("https://dbs.example/reader", Arc::new(catalog));

    let mut workload = processing_workload("proc");
    workload.tasks[0].catalog_url = Some("https://dbs.example/reader".to_string());
    workload.tasks[0].input.as_mut().unwrap().include_parents = true;

    let units = StartPolicy::Block(SplitParams::default())
        .split(&workload, &workload.tasks[0], &catalogs)
        .unwrap();

    assert!(units[0].parent_flag);
    assert_eq!(units[0].parent_data, vec!["/Primary/Parent/RAW#p1".to_string()]);
}

#[test]
fn test_dataset_policy_single_unit() {
    let workload = processing_workload("proc");
    let units = StartPolicy::Dataset(SplitParams::default())
        .split(&workload, &workload.tasks[0], &registry())
        .unwrap();

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].data.as_deref(), Some(DATASET));
    assert_eq!(units[0].jobs, 5);
    assert!(!units[0].parent_flag);
}

#[test]
fn test_monte_carlo_chunks() {
    let workload = monte_carlo_workload("mc", 25_000, 1000);
    let params = SplitParams {
        slice_size: None,
        max_jobs_per_element: Some(10),
    };
    let units = StartPolicy::MonteCarlo(params)
        .split(&workload, &workload.tasks[0], &registry())
        .unwrap();

    assert_eq!(units.iter().map(|u| u.jobs).collect::<Vec<_>>(), vec![10, 10, 5]);
    assert!(units.iter().all(|u| u.data.is_none()));
    let events: Vec<_> = units.iter().map(|u| u.task().total_events).collect();
    assert_eq!(events, vec![Some(10_000), Some(10_000), Some(5000)]);
}

#[test]
fn test_monte_carlo_without_events_is_one_empty_unit() {
    let workload = monte_carlo_workload("mc", 0, 1000);
    let units = StartPolicy::MonteCarlo(SplitParams::default())
        .split(&workload, &workload.tasks[0], &registry())
        .unwrap();

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].jobs, 0);
}

#[test]
fn test_data_policy_without_input_is_spec_error() {
    let workload = monte_carlo_workload("mc", 1000, 1000);
    let result = StartPolicy::Block(SplitParams::default()).split(
        &workload,
        &workload.tasks[0],
        &registry(),
    );

    assert!(matches!(result, Err(WorkQueueError::Spec(_))));
}

#[test]
fn test_unknown_catalog_url_is_catalog_error() {
    let mut workload = processing_workload("proc");
    workload.tasks[0].catalog_url = Some("https://nowhere.example".to_string());

    let result = StartPolicy::Block(SplitParams::default()).split(
        &workload,
        &workload.tasks[0],
        &CatalogRegistry::new(),
    );

    assert!(matches!(result, Err(WorkQueueError::Catalog(_))));
}

#[test]
fn test_registry_resolves_configured_mapping() {
    let config = QueueConfig::default();
    let policies = PolicyRegistry::from_mapping(&config.effective_splitting_mapping()).unwrap();

    assert_eq!(policies.get("DatasetBlock").unwrap().name(), "Block");
    assert_eq!(policies.get("MonteCarlo").unwrap().name(), "MonteCarlo");
    assert!(matches!(
        policies.get("ReReco"),
        Err(WorkQueueError::Configuration(_))
    ));

    let mut bad = config.splitting_mapping.clone();
    bad.insert("ReReco".to_string(), PolicyChoice::new("Bogus"));
    assert!(matches!(
        PolicyRegistry::from_mapping(&bad),
        Err(WorkQueueError::Configuration(_))
    ));
}
