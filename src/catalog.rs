//! Data catalog collaborator: block and file metadata for input datasets.
//!
//! Start policies size elements from it and downstream preparation reads the
//! files of a block from it. Block names follow the `<dataset>#<suffix>`
//! convention.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkQueueError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFile {
    pub lfn: String,
    pub size: u64,
    pub events: u64,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub adler32: Option<String>,
    /// Parent LFNs.
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    pub name: String,
    pub files: Vec<CatalogFile>,
    #[serde(default)]
    pub storage_elements: Vec<String>,
    /// Parent block names.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl FileBlock {
    pub fn num_files(&self) -> u64 {
        self.files.len() as u64
    }

    pub fn num_events(&self) -> u64 {
        self.files.iter().map(|f| f.events).sum()
    }
}

/// Returns true for block names, false for dataset names.
pub fn is_block_name(name: &str) -> bool {
    name.contains('#')
}

pub trait DataCatalog: Send + Sync {
    /// All blocks of a dataset, files included.
    fn list_blocks(&self, dataset: &str) -> Result<Vec<FileBlock>>;

    /// One block; file parentage is only filled in when `with_parents` is set.
    fn file_block(&self, block: &str, with_parents: bool) -> Result<FileBlock>;
}

/// Catalog served from memory, optionally loaded from a JSON dump of
/// `{dataset: [block, ...]}`.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    datasets: RwLock<BTreeMap<String, Vec<FileBlock>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorkQueueError::Catalog(format!("cannot read {}: {}", path.display(), e))
        })?;
        let datasets: BTreeMap<String, Vec<FileBlock>> = serde_json::from_str(&raw)
            .map_err(|e| WorkQueueError::Catalog(format!("invalid catalog dump: {}", e)))?;
        Ok(Self {
            datasets: RwLock::new(datasets),
        })
    }

    pub fn add_block(&self, dataset: &str, block: FileBlock) {
        if let Ok(mut datasets) = self.datasets.write() {
            datasets.entry(dataset.to_string()).or_default().push(block);
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<FileBlock>>>> {
        self.datasets
            .read()
            .map_err(|_| WorkQueueError::Internal("catalog lock poisoned".to_string()))
    }
}

impl DataCatalog for InMemoryCatalog {
    fn list_blocks(&self, dataset: &str) -> Result<Vec<FileBlock>> {
        self.read()?
            .get(dataset)
            .cloned()
            .ok_or_else(|| WorkQueueError::Catalog(format!("unknown dataset {}", dataset)))
    }

    fn file_block(&self, block: &str, with_parents: bool) -> Result<FileBlock> {
        let datasets = self.read()?;
        let mut found = datasets
            .values()
            .flat_map(|blocks| blocks.iter())
            .find(|b| b.name == block)
            .cloned()
            .ok_or_else(|| WorkQueueError::Catalog(format!("unknown block {}", block)))?;
        if !with_parents {
            for file in &mut found.files {
                file.parents.clear();
            }
        }
        Ok(found)
    }
}

/// Catalogs keyed by URL, as named on each task.
#[derive(Clone, Default)]
pub struct CatalogRegistry {
    catalogs: HashMap<String, Arc<dyn DataCatalog>>,
    default: Option<Arc<dyn DataCatalog>>,
}

impl std::fmt::Debug for CatalogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogRegistry")
            .field("urls", &self.catalogs.keys().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl CatalogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, url: impl Into<String>, catalog: Arc<dyn DataCatalog>) {
        self.catalogs.insert(url.into(), catalog);
    }

    /// Catalog used for tasks that name no URL, or a URL not registered.
    pub fn set_default(&mut self, catalog: Arc<dyn DataCatalog>) {
        self.default = Some(catalog);
    }

    pub fn get(&self, url: Option<&str>) -> Result<Arc<dyn DataCatalog>> {
        url.and_then(|u| self.catalogs.get(u))
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| {
                WorkQueueError::Catalog(format!(
                    "no data catalog registered for {}",
                    url.unwrap_or("<unset>")
                ))
            })
    }
}
