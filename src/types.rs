use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub type TaskId = String;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            completed: false,
            due_date: None,
            created_at,
            updated_at: None,
        }
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }

    /// Due date of a task that can still raise an alert.
    pub fn pending_due_date(&self) -> Option<DateTime<Utc>> {
        if self.completed { None } else { self.due_date }
    }
}

/// Decode a task list one entry at a time, skipping entries that do not parse.
///
/// Snapshots arrive from outside the process, so a single malformed due date must
/// not take the whole list down with it.
pub fn tasks_from_json(value: Value) -> Vec<Task> {
    let Value::Array(entries) = value else {
        warn!("task snapshot is not a JSON array; treating as empty");
        return Vec::new();
    };

    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value::<Task>(entry) {
            Ok(task) => Some(task),
            Err(err) => {
                warn!(index, error = %err, "skipping malformed task in snapshot");
                None
            }
        })
        .collect()
}

pub fn tasks_from_str(raw: &str) -> Result<Vec<Task>, serde_json::Error> {
    let value = serde_json::from_str::<Value>(raw)?;
    Ok(tasks_from_json(value))
}
