//! Foreground wiring between the task store, the scheduler and the background context.
//!
//! Besides per-task alarms the center owns the daily morning summary, the due check that
//! runs while the app's view is hidden, and pushes that arrive while the foreground is up.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::background::{BackgroundEvent, BackgroundHandle, BackgroundMessage};
use crate::delivery::sensory::{PopupAction, PopupResolution};
use crate::delivery::{DeliveryReport, DeliveryRequest, Dispatcher};
use crate::error::NotifyError;
use crate::monitor::{DueClassification, classify};
use crate::notification::{NotificationKind, PushPayload, RenderedNotification};
use crate::scheduler::Scheduler;
use crate::store::{TaskPatch, TaskStore};
use crate::types::{Task, TaskId};

pub const DEFAULT_SNOOZE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FOREGROUND_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const MORNING_SUMMARY_TITLE: &str = "Good morning!";

/// The next instant strictly after `now` at `hour:00` local time in `now`'s zone.
pub fn next_morning<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Tz> {
    let zone = now.timezone();
    let mut day = now.date_naive();
    // A DST gap can swallow the hour on one day, never on two in a row.
    for _ in 0..3 {
        if let Some(at) = day
            .and_hms_opt(hour, 0, 0)
            .and_then(|naive| zone.from_local_datetime(&naive).earliest())
            && at > *now
        {
            return at;
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    now.clone() + TimeDelta::days(1)
}

/// Title and body of the morning summary, or `None` when nothing is due.
pub fn morning_summary(classification: &DueClassification) -> Option<(String, String)> {
    if classification.is_empty() {
        return None;
    }
    Some((
        MORNING_SUMMARY_TITLE.to_string(),
        format!(
            "Today: {} overdue, {} due today",
            classification.overdue.len(),
            classification.due_today.len()
        ),
    ))
}

fn default_snooze() -> TimeDelta {
    TimeDelta::seconds(DEFAULT_SNOOZE.as_secs() as i64)
}

pub struct NotificationCenter {
    scheduler: Scheduler,
    store: Arc<dyn TaskStore>,
    background: Option<BackgroundHandle>,
    dispatcher: Option<Arc<Dispatcher>>,
    snooze: TimeDelta,
    check_interval: Duration,
    /// Snoozed tasks and the due date they had when snoozed.
    snoozed: Mutex<HashMap<TaskId, Option<DateTime<Utc>>>>,
    visible: AtomicBool,
    periodic: Mutex<Option<JoinHandle<()>>>,
    morning: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationCenter {
    pub fn new(scheduler: Scheduler, store: Arc<dyn TaskStore>) -> Self {
        Self {
            scheduler,
            store,
            background: None,
            dispatcher: None,
            snooze: default_snooze(),
            check_interval: DEFAULT_FOREGROUND_CHECK_INTERVAL,
            snoozed: Mutex::new(HashMap::new()),
            visible: AtomicBool::new(true),
            periodic: Mutex::new(None),
            morning: Mutex::new(None),
        }
    }

    /// Deliver summaries and foreground pushes through this dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_background(mut self, background: BackgroundHandle) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_snooze(mut self, snooze: Duration) -> Self {
        self.snooze = TimeDelta::from_std(snooze).unwrap_or_else(|_| default_snooze());
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn snoozed(&self) -> MutexGuard<'_, HashMap<TaskId, Option<DateTime<Utc>>>> {
        self.snoozed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> Vec<Task> {
        self.store.subscribe().borrow().clone()
    }

    async fn deliver(&self, request: DeliveryRequest) -> Option<DeliveryReport> {
        match self.dispatcher.as_ref() {
            Some(dispatcher) => Some(dispatcher.deliver(request).await),
            None => {
                debug!("no dispatcher; dropping foreground notification");
                None
            }
        }
    }

    fn url(&self) -> &str {
        self.dispatcher
            .as_ref()
            .map_or(crate::notification::DEFAULT_URL, |dispatcher| dispatcher.url())
    }

    /// Ask for periodic background checks and schedule the current task list.
    pub fn start(&self) -> usize {
        if let Some(background) = self.background.as_ref()
            && let Err(err) = background.start_background_check()
        {
            warn!(error = %err, "failed to start background check");
        }
        self.apply_snapshot(&self.tasks(), Utc::now())
    }

    /// Reconcile alarms with a fresh task list. Returns the number of live alarms.
    pub fn apply_snapshot(&self, tasks: &[Task], now: DateTime<Utc>) -> usize {
        if let Some(background) = self.background.as_ref()
            && let Err(err) = background.update_tasks(tasks.to_vec())
        {
            warn!(error = %err, "failed to forward task snapshot");
        }

        let present = tasks
            .iter()
            .map(|task| task.id.as_str())
            .collect::<HashSet<_>>();
        for alarm in self.scheduler.pending() {
            if !present.contains(alarm.task_id.as_str()) {
                self.scheduler.cancel(&alarm.task_id);
            }
        }

        let mut snoozed = self.snoozed();
        snoozed.retain(|id, _| present.contains(id.as_str()));
        for task in tasks {
            match task.pending_due_date() {
                Some(due) if due > now => {
                    snoozed.remove(&task.id);
                    self.scheduler.schedule(task);
                }
                Some(due) if snoozed.get(&task.id) == Some(&Some(due)) => {}
                _ => {
                    snoozed.remove(&task.id);
                    self.scheduler.cancel(&task.id);
                }
            }
        }

        let live = self.scheduler.len();
        debug!(task_count = tasks.len(), live_alarms = live, "alarms reconciled");
        live
    }

    /// Send the morning summary for `now`. Returns `false` when nothing is due.
    pub async fn send_morning_summary(&self, now: DateTime<Utc>) -> bool {
        let classification = classify(now, &self.tasks());
        let Some((title, body)) = morning_summary(&classification) else {
            debug!("nothing due; skipping morning summary");
            return false;
        };
        info!(
            overdue = classification.overdue.len(),
            due_today = classification.due_today.len(),
            "sending morning summary"
        );
        self.deliver(DeliveryRequest::Adhoc { title, body }).await;
        true
    }

    /// Arm the daily summary at `hour:00` local time; it re-arms itself after each run.
    pub fn start_morning_summary(self: &Arc<Self>, hour: u32) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut after = Local::now();
            loop {
                let at = next_morning(&after, hour);
                let wait = (at - Local::now()).to_std().unwrap_or_default();
                debug!(%at, wait_secs = wait.as_secs(), "morning summary armed");
                tokio::time::sleep(wait).await;
                let Some(center) = weak.upgrade() else { break };
                center.send_morning_summary(Utc::now()).await;
                after = Local::now().max(at);
            }
        });
        let previous = self
            .morning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn is_morning_summary_armed(&self) -> bool {
        self.morning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// One foreground due pass: an overdue summary and a due-today summary when non-empty.
    pub async fn check_now(&self, now: DateTime<Utc>) -> DueClassification {
        let classification = classify(now, &self.tasks());
        for (kind, tasks) in [
            (NotificationKind::Overdue, &classification.overdue),
            (NotificationKind::DueToday, &classification.due_today),
        ] {
            if tasks.is_empty() {
                continue;
            }
            let single = (tasks.len() == 1).then(|| &tasks[0]);
            let notification =
                RenderedNotification::summary(kind, tasks.len(), single, self.url());
            self.deliver(DeliveryRequest::Notification(notification)).await;
        }
        debug!(
            overdue = classification.overdue.len(),
            due_today = classification.due_today.len(),
            "foreground due check completed"
        );
        classification
    }

    /// Run [`check_now`](Self::check_now) every check interval until stopped.
    pub fn start_periodic_check(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.check_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(center) = weak.upgrade() else { break };
                center.check_now(Utc::now()).await;
            }
        });
        let previous = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(interval_secs = period.as_secs(), "foreground due check started");
    }

    pub fn stop_periodic_check(&self) -> bool {
        let stopped = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match stopped {
            Some(task) => {
                task.abort();
                info!("foreground due check stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_periodic_check_active(&self) -> bool {
        self.periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// A hidden view runs the foreground due check; a visible one stops it.
    pub fn set_visible(self: &Arc<Self>, visible: bool) {
        let was_visible = self.visible.swap(visible, Ordering::Relaxed);
        if was_visible == visible {
            return;
        }
        if visible {
            self.stop_periodic_check();
        } else {
            self.start_periodic_check();
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    /// A push that reached this process. Rendered here while the view is visible,
    /// otherwise handed to the background context.
    pub async fn receive_push(&self, payload: PushPayload) -> Result<()> {
        if self.is_visible() && self.dispatcher.is_some() {
            let notification = payload.render(self.url());
            debug!(tag = %notification.tag, "rendering push in the foreground");
            self.deliver(DeliveryRequest::Notification(notification)).await;
            return Ok(());
        }
        let background = self
            .background
            .as_ref()
            .ok_or_else(|| NotifyError::ChannelUnsupported("no background context".into()))?;
        background
            .post(BackgroundMessage::PushReceived { payload })
            .context("failed to hand push to the background context")
    }

    /// Stop the morning summary and the foreground check.
    pub fn stop(&self) {
        self.stop_periodic_check();
        if let Some(task) = self
            .morning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    pub async fn handle_popup_action(&self, action: PopupAction, task: Option<Task>) -> Result<()> {
        let Some(task) = task else {
            return Ok(());
        };

        match action {
            PopupAction::Dismiss => {}
            PopupAction::Complete => {
                self.store
                    .update(&task.id, TaskPatch::complete())
                    .await
                    .with_context(|| format!("failed to complete task {}", task.id))?;
                self.snoozed().remove(&task.id);
                self.scheduler.cancel(&task.id);
                info!(task_id = %task.id, "task completed from notification");
            }
            PopupAction::Snooze => {
                let fire_at = Utc::now() + self.snooze;
                if self.scheduler.schedule_at(&task, fire_at) {
                    self.snoozed().insert(task.id.clone(), task.due_date);
                    info!(task_id = %task.id, %fire_at, "task snoozed");
                }
            }
        }
        Ok(())
    }

    pub async fn handle_event(&self, event: BackgroundEvent) -> Result<()> {
        match event {
            BackgroundEvent::Clicked {
                action,
                task_id: Some(task_id),
            } => {
                let Ok(action) = PopupAction::from_str(&action) else {
                    return Ok(());
                };
                let task = self
                    .store
                    .subscribe()
                    .borrow()
                    .iter()
                    .find(|task| task.id == task_id)
                    .cloned();
                if task.is_none() {
                    debug!(task_id = %task_id, "clicked task no longer exists");
                }
                self.handle_popup_action(action, task).await
            }
            event => {
                debug!(?event, "background event");
                Ok(())
            }
        }
    }

    /// Follow the store and both action channels until the store goes away.
    pub async fn run(
        &self,
        mut resolutions: mpsc::UnboundedReceiver<PopupResolution>,
        mut events: mpsc::UnboundedReceiver<BackgroundEvent>,
    ) {
        let mut tasks = self.store.subscribe();
        loop {
            tokio::select! {
                changed = tasks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = tasks.borrow_and_update().clone();
                    self.apply_snapshot(&snapshot, Utc::now());
                }
                Some(resolution) = resolutions.recv() => {
                    if let Err(err) = self
                        .handle_popup_action(resolution.action, resolution.task)
                        .await
                    {
                        warn!(error = %err, "popup action failed");
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(err) = self.handle_event(event).await {
                        warn!(error = %err, "background event failed");
                    }
                }
            }
        }
        debug!("notification center stopped");
    }
}
