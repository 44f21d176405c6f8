//! Small JSON state files written with a temp file and rename.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{NotifyError, NotifyResult};

/// Read a JSON file, treating a missing or unreadable file as absent.
pub fn load_json<T: DeserializeOwned>(path: &Path, what: &str) -> Option<T> {
    if !path.exists() {
        return None;
    }

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) => {
            warn!("failed to read {} '{}': {}", what, path.display(), error);
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!("failed to parse {} '{}': {}", what, path.display(), error);
            None
        }
    }
}

pub fn store_json<T: Serialize>(path: &Path, value: &T, what: &str) -> NotifyResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| NotifyError::Storage(format!("invalid {what} path")))?;
    fs::create_dir_all(parent).map_err(|err| {
        NotifyError::Storage(format!(
            "failed to create {what} directory '{}': {err}",
            parent.display()
        ))
    })?;

    let contents = serde_json::to_string_pretty(value)
        .map_err(|err| NotifyError::Storage(format!("failed to encode {what}: {err}")))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state.json");
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp_path, contents).map_err(|err| {
        NotifyError::Storage(format!(
            "failed to write temporary {what} file '{}': {err}",
            tmp_path.display()
        ))
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        NotifyError::Storage(format!(
            "failed to move {what} file into place '{}': {err}",
            path.display()
        ))
    })
}
