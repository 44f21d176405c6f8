//! Per-task one-shot alarms.
//!
//! The scheduler keeps at most one live alarm per task id. Registering a new alarm for an
//! id cancels the previous one, and a firing alarm only delivers if it is still the
//! registered alarm for its id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{Task, TaskId};

/// Receiver of fired alarms.
#[async_trait]
pub trait AlarmHandler: Send + Sync {
    async fn on_alarm(&self, task: Task);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmInfo {
    pub task_id: TaskId,
    pub fire_at: DateTime<Utc>,
}

struct ScheduledAlarm {
    task: Task,
    fire_at: DateTime<Utc>,
    generation: u64,
    cancel_handle: JoinHandle<()>,
}

struct SchedulerInner {
    alarms: Mutex<HashMap<TaskId, ScheduledAlarm>>,
    next_generation: AtomicU64,
    handler: Arc<dyn AlarmHandler>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(handler: Arc<dyn AlarmHandler>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                alarms: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                handler,
            }),
        }
    }

    /// Schedule an alarm at the task's due date.
    ///
    /// Returns `true` when an alarm is live for the task afterwards.
    pub fn schedule(&self, task: &Task) -> bool {
        let Some(due) = task.pending_due_date() else {
            debug!(task_id = %task.id, "not scheduling: no pending due date");
            return false;
        };
        self.schedule_at(task, due)
    }

    /// Schedule an alarm for the task at an explicit instant, e.g. a snooze.
    pub fn schedule_at(&self, task: &Task, fire_at: DateTime<Utc>) -> bool {
        if task.completed {
            return false;
        }

        let now = Utc::now();
        if fire_at <= now {
            debug!(task_id = %task.id, %fire_at, "not scheduling: fire time already passed");
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(task_id = %task.id, "cannot schedule alarm outside of a tokio runtime");
            return false;
        };

        let mut alarms = self.inner.alarms();
        if let Some(existing) = alarms.get_mut(&task.id)
            && existing.fire_at == fire_at
            && !existing.cancel_handle.is_finished()
        {
            // Same instant: keep the timer, deliver whatever the task says by then.
            existing.task = task.clone();
            return true;
        }

        if let Some(previous) = alarms.remove(&task.id) {
            previous.cancel_handle.abort();
            debug!(task_id = %task.id, previous = %previous.fire_at, "superseded alarm");
        }

        let delay = (fire_at - now).to_std().unwrap_or_default();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let task_id = task.id.clone();

        // The registry lock is held until the entry is inserted, so the fire path
        // cannot observe the registry before its own alarm is present.
        let cancel_handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(&task_id, generation).await;
            }
        });

        alarms.insert(
            task.id.clone(),
            ScheduledAlarm {
                task: task.clone(),
                fire_at,
                generation,
                cancel_handle,
            },
        );

        debug!(
            task_id = %task.id,
            %fire_at,
            delay_ms = delay.as_millis() as u64,
            "alarm scheduled"
        );
        true
    }

    /// Schedule every eligible task; returns how many alarms are live for them afterwards.
    pub fn schedule_all(&self, tasks: &[Task]) -> usize {
        tasks.iter().filter(|task| self.schedule(task)).count()
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        let removed = self.inner.alarms().remove(task_id);
        match removed {
            Some(alarm) => {
                alarm.cancel_handle.abort();
                debug!(task_id, fire_at = %alarm.fire_at, "alarm cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let drained = self.inner.alarms().drain().collect::<Vec<_>>();
        for (_, alarm) in drained {
            alarm.cancel_handle.abort();
        }
    }

    pub fn is_scheduled(&self, task_id: &str) -> bool {
        self.inner.alarms().contains_key(task_id)
    }

    pub fn fire_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.inner.alarms().get(task_id).map(|alarm| alarm.fire_at)
    }

    pub fn len(&self) -> usize {
        self.inner.alarms().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> Vec<AlarmInfo> {
        let mut pending = self
            .inner
            .alarms()
            .iter()
            .map(|(task_id, alarm)| AlarmInfo {
                task_id: task_id.clone(),
                fire_at: alarm.fire_at,
            })
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.task_id.cmp(&b.task_id)));
        pending
    }
}

impl SchedulerInner {
    fn alarms(&self) -> MutexGuard<'_, HashMap<TaskId, ScheduledAlarm>> {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fire(&self, task_id: &str, generation: u64) {
        let task = {
            let mut alarms = self.alarms();
            let current = alarms
                .get(task_id)
                .is_some_and(|alarm| alarm.generation == generation);
            if current {
                alarms.remove(task_id).map(|alarm| alarm.task)
            } else {
                None
            }
        };

        let Some(task) = task else {
            debug!(task_id, "dropping stale alarm");
            return;
        };

        debug!(task_id, "alarm firing");
        self.handler.on_alarm(task).await;
    }
}
