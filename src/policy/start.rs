use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::{CatalogRegistry, FileBlock};
use crate::config::{PolicyChoice, SplitParams};
use crate::error::{Result, WorkQueueError};
use crate::workload::{InputDataset, Task, Workload};

const DEFAULT_FILES_PER_JOB: u64 = 1;
const DEFAULT_EVENTS_PER_JOB: u64 = 1000;

/// One schedulable unit produced by a start policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Primary input block or dataset; `None` for input-less work.
    pub data: Option<String>,
    pub parent_data: Vec<String>,
    pub jobs: u64,
    /// The workload reduced to exactly the work of this unit.
    pub workload: Workload,
    pub parent_flag: bool,
}

impl WorkUnit {
    pub fn task(&self) -> &Task {
        // for_task always leaves exactly one task
        &self.workload.tasks[0]
    }
}

/// Start policies, selected by implementation name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPolicy {
    /// One element per input block.
    Block(SplitParams),
    /// One element per input dataset.
    Dataset(SplitParams),
    /// Input-less production, chunked by job count.
    MonteCarlo(SplitParams),
}

impl StartPolicy {
    pub const KNOWN: [&'static str; 3] = ["Block", "Dataset", "MonteCarlo"];

    pub fn is_known(implementation: &str) -> bool {
        Self::KNOWN.contains(&implementation)
    }

    pub fn from_choice(choice: &PolicyChoice) -> Result<Self> {
        let params = choice.params.clone();
        match choice.implementation.as_str() {
            "Block" => Ok(StartPolicy::Block(params)),
            "Dataset" => Ok(StartPolicy::Dataset(params)),
            "MonteCarlo" => Ok(StartPolicy::MonteCarlo(params)),
            other => Err(WorkQueueError::Configuration(format!(
                "unknown start policy {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StartPolicy::Block(_) => "Block",
            StartPolicy::Dataset(_) => "Dataset",
            StartPolicy::MonteCarlo(_) => "MonteCarlo",
        }
    }

    /// Split one top-level task of `workload` into work units.
    pub fn split(
        &self,
        workload: &Workload,
        task: &Task,
        catalogs: &CatalogRegistry,
    ) -> Result<Vec<WorkUnit>> {
        match self {
            StartPolicy::Block(params) => split_blocks(workload, task, params, catalogs),
            StartPolicy::Dataset(params) => split_dataset(workload, task, params, catalogs),
            StartPolicy::MonteCarlo(params) => Ok(split_monte_carlo(workload, task, params)),
        }
    }
}

fn required_input<'a>(policy: &str, task: &'a Task) -> Result<&'a InputDataset> {
    task.input.as_ref().ok_or_else(|| {
        WorkQueueError::Spec(format!(
            "{} policy needs an input dataset, task {} has none",
            policy, task.name
        ))
    })
}

fn selected_blocks(
    input: &InputDataset,
    task: &Task,
    catalogs: &CatalogRegistry,
) -> Result<Vec<FileBlock>> {
    let catalog = catalogs.get(task.catalog_url.as_deref())?;
    let blocks = catalog.list_blocks(&input.dataset)?;
    Ok(blocks
        .into_iter()
        .filter(|b| input.blocks.is_empty() || input.blocks.contains(&b.name))
        .filter(|b| b.num_files() > 0)
        .collect())
}

fn jobs_for(units: u64, per_job: u64) -> u64 {
    units.div_ceil(per_job.max(1))
}

fn dataset_of(block: &str) -> &str {
    block.split('#').next().unwrap_or(block)
}

fn split_blocks(
    workload: &Workload,
    task: &Task,
    params: &SplitParams,
    catalogs: &CatalogRegistry,
) -> Result<Vec<WorkUnit>> {
    let input = required_input("Block", task)?;
    let files_per_job = params
        .slice_size
        .or(task.files_per_job)
        .unwrap_or(DEFAULT_FILES_PER_JOB);

    let units = selected_blocks(input, task, catalogs)?
        .into_iter()
        .map(|block| {
            let parent_data = if input.include_parents {
                block.parents.clone()
            } else {
                Vec::new()
            };
            let mut narrowed = task.clone();
            if let Some(ref mut narrowed_input) = narrowed.input {
                narrowed_input.blocks = vec![block.name.clone()];
            }
            WorkUnit {
                data: Some(block.name.clone()),
                parent_flag: !parent_data.is_empty(),
                parent_data,
                jobs: jobs_for(block.num_files(), files_per_job),
                workload: workload.for_task(narrowed),
            }
        })
        .collect();
    Ok(units)
}

fn split_dataset(
    workload: &Workload,
    task: &Task,
    params: &SplitParams,
    catalogs: &CatalogRegistry,
) -> Result<Vec<WorkUnit>> {
    let input = required_input("Dataset", task)?;
    let files_per_job = params
        .slice_size
        .or(task.files_per_job)
        .unwrap_or(DEFAULT_FILES_PER_JOB);

    let blocks = selected_blocks(input, task, catalogs)?;
    if blocks.is_empty() {
        return Ok(Vec::new());
    }

    let jobs: u64 = blocks
        .iter()
        .map(|b| jobs_for(b.num_files(), files_per_job))
        .sum();
    let parent_data: Vec<String> = if input.include_parents {
        blocks
            .iter()
            .flat_map(|b| b.parents.iter())
            .map(|p| dataset_of(p).to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        Vec::new()
    };

    Ok(vec![WorkUnit {
        data: Some(input.dataset.clone()),
        parent_flag: !parent_data.is_empty(),
        parent_data,
        jobs,
        workload: workload.for_task(task.clone()),
    }])
}

fn split_monte_carlo(workload: &Workload, task: &Task, params: &SplitParams) -> Vec<WorkUnit> {
    let events_per_job = params
        .slice_size
        .or(task.events_per_job)
        .unwrap_or(DEFAULT_EVENTS_PER_JOB)
        .max(1);
    let total_events = task.total_events.unwrap_or(0);
    let total_jobs = jobs_for(total_events, events_per_job);
    let max_jobs = params.max_jobs_per_element.unwrap_or(total_jobs).max(1);

    // (first job, jobs in chunk)
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < total_jobs {
        let jobs = max_jobs.min(total_jobs - start);
        chunks.push((start, jobs));
        start += jobs;
    }
    if chunks.is_empty() {
        chunks.push((0, 0));
    }

    chunks
        .into_iter()
        .map(|(first_job, jobs)| {
            let first_event = first_job * events_per_job;
            let events = (jobs * events_per_job).min(total_events.saturating_sub(first_event));
            let mut narrowed = task.clone();
            narrowed.input = None;
            narrowed.events_per_job = Some(events_per_job);
            narrowed.total_events = Some(events);
            WorkUnit {
                data: None,
                parent_data: Vec::new(),
                jobs,
                workload: workload.for_task(narrowed),
                parent_flag: false,
            }
        })
        .collect()
}

/// Start policies resolved from a queue's splitting mapping, keyed by the
/// policy name workloads declare.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, StartPolicy>,
}

impl PolicyRegistry {
    /// Resolve every mapping entry up front so a bad name fails at startup.
    pub fn from_mapping(mapping: &BTreeMap<String, PolicyChoice>) -> Result<Self> {
        let policies = mapping
            .iter()
            .map(|(name, choice)| Ok((name.clone(), StartPolicy::from_choice(choice)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { policies })
    }

    pub fn get(&self, name: &str) -> Result<&StartPolicy> {
        self.policies.get(name).ok_or_else(|| {
            WorkQueueError::Configuration(format!("no splitting policy mapped for {}", name))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}
