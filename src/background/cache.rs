//! On-disk copy of the background snapshot.
//!
//! The host may stop and restart the background context at any time, so the last task
//! snapshot and whether periodic checks were requested are kept on disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NotifyResult;
use crate::persist::{load_json, store_json};
use crate::types::{Task, tasks_from_json};

const CACHE_FILE_NAME: &str = "task-data-cache.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedState {
    pub tasks: Vec<Task>,
    pub background_check: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCachedState {
    #[serde(default)]
    tasks: Value,
    #[serde(default)]
    background_check: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    path: Option<PathBuf>,
}

impl SnapshotCache {
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::data_local_dir()?;
        path.push("due-notify");
        path.push(CACHE_FILE_NAME);
        Some(path)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> CachedState {
        let Some(path) = self.path.as_deref() else {
            return CachedState::default();
        };
        match load_json::<RawCachedState>(path, "task cache") {
            Some(raw) => CachedState {
                tasks: if raw.tasks.is_null() {
                    Vec::new()
                } else {
                    tasks_from_json(raw.tasks)
                },
                background_check: raw.background_check,
            },
            None => CachedState::default(),
        }
    }

    pub fn store(&self, state: &CachedState) -> NotifyResult<()> {
        match self.path.as_deref() {
            Some(path) => store_json(path, state, "task cache"),
            None => Ok(()),
        }
    }
}
