//! The task store seam and an in-memory implementation.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::types::{Task, tasks_from_str};

/// Fields to change on a task. `due_date: Some(None)` clears the due date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub text: Option<String>,
    pub completed: Option<bool>,
    pub due_date: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn complete() -> Self {
        Self {
            completed: Some(true),
            ..Self::default()
        }
    }
}

/// Authoritative task list with change subscription.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn add(&self, text: &str, due_date: Option<DateTime<Utc>>) -> Result<Task>;
    async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task>;
    async fn remove(&self, id: &str) -> Result<()>;
    /// Current list, newest first, followed by every later change.
    fn subscribe(&self) -> watch::Receiver<Vec<Task>>;
}

pub struct MemoryTaskStore {
    tasks: watch::Sender<Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new(mut tasks: Vec<Task>) -> Self {
        sort_newest_first(&mut tasks);
        let (tasks, _) = watch::channel(tasks);
        Self { tasks }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tasks from {}", path.display()))?;
        let tasks = tasks_from_str(&raw)
            .with_context(|| format!("failed to parse tasks from {}", path.display()))?;
        Ok(Self::new(tasks))
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.borrow().iter().find(|task| task.id == id).cloned()
    }
}

fn sort_newest_first(tasks: &mut [Task]) {
    tasks.sort_by(|left, right| right.created_at.cmp(&left.created_at));
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn add(&self, text: &str, due_date: Option<DateTime<Utc>>) -> Result<Task> {
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("task text cannot be empty"));
        }
        let mut task = Task::new(Uuid::new_v4().to_string(), text, Utc::now());
        task.due_date = due_date;

        let created = task.clone();
        self.tasks.send_modify(|tasks| {
            tasks.push(task);
            sort_newest_first(tasks);
        });
        Ok(created)
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let mut updated = None;
        self.tasks.send_if_modified(|tasks| {
            let Some(task) = tasks.iter_mut().find(|task| task.id == id) else {
                return false;
            };
            if let Some(text) = patch.text.clone() {
                task.text = text;
            }
            if let Some(completed) = patch.completed {
                task.completed = completed;
            }
            if let Some(due_date) = patch.due_date {
                task.due_date = due_date;
            }
            task.updated_at = Some(Utc::now());
            updated = Some(task.clone());
            true
        });
        updated.ok_or_else(|| anyhow!("task not found: {id}"))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let removed = self.tasks.send_if_modified(|tasks| {
            let before = tasks.len();
            tasks.retain(|task| task.id != id);
            tasks.len() != before
        });
        if removed {
            Ok(())
        } else {
            Err(anyhow!("task not found: {id}"))
        }
    }

    fn subscribe(&self) -> watch::Receiver<Vec<Task>> {
        self.tasks.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_add_update_remove_notify_subscribers() {
        let store = MemoryTaskStore::new(Vec::new());
        let mut changes = store.subscribe();

        let task = store
            .add("  water plants ", Some(Utc::now() + TimeDelta::hours(1)))
            .await
            .unwrap();
        assert!(changes.has_changed().unwrap());
        assert_eq!(changes.borrow_and_update()[0].text, "water plants");

        let updated = store.update(&task.id, TaskPatch::complete()).await.unwrap();
        assert!(updated.completed);
        assert!(updated.updated_at.is_some());
        assert!(changes.has_changed().unwrap());

        store.remove(&task.id).await.unwrap();
        assert!(changes.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn test_missing_task_is_an_error() {
        let store = MemoryTaskStore::new(Vec::new());
        let changes = store.subscribe();
        assert!(store.update("nope", TaskPatch::complete()).await.is_err());
        assert!(store.remove("nope").await.is_err());
        assert!(store.add("   ", None).await.is_err());
        assert!(!changes.has_changed().unwrap());
    }

    #[test]
    fn test_tasks_are_kept_newest_first() {
        let now = Utc::now();
        let store = MemoryTaskStore::new(vec![
            Task::new("old", "old", now - TimeDelta::days(2)),
            Task::new("new", "new", now),
        ]);
        let ids = store
            .snapshot()
            .into_iter()
            .map(|task| task.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["new", "old"]);
        assert!(store.get("old").is_some());
    }

    #[test]
    fn test_from_file_skips_malformed_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","text":"ok","createdAt":"2026-01-01T00:00:00Z"},{"id":"b"}]"#,
        )
        .unwrap();

        let store = MemoryTaskStore::from_file(&path).unwrap();
        assert_eq!(store.snapshot().len(), 1);
        assert!(MemoryTaskStore::from_file(&temp.path().join("missing.json")).is_err());
    }
}
