//! The background context.
//!
//! Runs as its own tokio task, independent of the foreground. It owns the cached task
//! snapshot, answers due checks, renders notifications and routes clicks. The only way
//! in is the [`BackgroundHandle`]; events flow back on an unbounded channel.

pub mod cache;
pub mod clients;
pub mod protocol;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capability::{BackgroundPresence, PermissionBroker};
use crate::delivery::local::DEFAULT_RENDER_TIMEOUT;
use crate::delivery::sensory::{PopupOptions, PopupStyle};
use crate::delivery::{BackgroundRoute, SensoryDeliverer};
use crate::error::{NotifyError, NotifyResult};
use crate::monitor::{DueClassification, classify};
use crate::notification::{
    ACTION_OPEN, DEFAULT_URL, NotificationData, NotificationKind, NotificationSurface,
    PushPayload, RenderedNotification,
};
use crate::types::{Task, TaskId};

pub use cache::{CachedState, SnapshotCache};
pub use clients::{ClickRoute, ClientView, MemoryViewHost, SystemViewHost, ViewHost, route_click};
pub use protocol::{BackgroundEvent, BackgroundMessage};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundConfig {
    pub check_interval: Duration,
    pub url: String,
    pub ready_timeout: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            url: DEFAULT_URL.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// A task that was already announced in a given state for a given due date.
type Announced = (TaskId, NotificationKind, DateTime<Utc>);

struct Envelope {
    message: BackgroundMessage,
    reply: Option<oneshot::Sender<NotifyResult<()>>>,
}

pub struct BackgroundContext {
    config: BackgroundConfig,
    cache: SnapshotCache,
    surface: Arc<dyn NotificationSurface>,
    views: Arc<dyn ViewHost>,
    permission: Option<Arc<dyn PermissionBroker>>,
    sensory: Option<Arc<SensoryDeliverer>>,
    events: Option<mpsc::UnboundedSender<BackgroundEvent>>,
    snapshot: Vec<Task>,
    check_requested: bool,
    announced: HashSet<Announced>,
}

impl BackgroundContext {
    /// Build a context, restoring whatever the cache holds from a previous run.
    pub fn new(
        surface: Arc<dyn NotificationSurface>,
        views: Arc<dyn ViewHost>,
        cache: SnapshotCache,
    ) -> Self {
        let restored = cache.load();
        if !restored.tasks.is_empty() || restored.background_check {
            debug!(
                task_count = restored.tasks.len(),
                background_check = restored.background_check,
                "restored background snapshot"
            );
        }
        Self {
            config: BackgroundConfig::default(),
            cache,
            surface,
            views,
            permission: None,
            sensory: None,
            events: None,
            snapshot: restored.tasks,
            check_requested: restored.background_check,
            announced: HashSet::new(),
        }
    }

    pub fn with_config(mut self, config: BackgroundConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<BackgroundEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Gate system renders on this permission. Without a broker every render is allowed.
    pub fn with_permission(mut self, permission: Arc<dyn PermissionBroker>) -> Self {
        self.permission = Some(permission);
        self
    }

    /// Where due summaries and pushes go while system notifications are not permitted.
    pub fn with_sensory(mut self, sensory: Arc<SensoryDeliverer>) -> Self {
        self.sensory = Some(sensory);
        self
    }

    pub fn snapshot(&self) -> &[Task] {
        &self.snapshot
    }

    pub fn check_requested(&self) -> bool {
        self.check_requested
    }

    pub async fn handle(&mut self, message: BackgroundMessage) -> NotifyResult<()> {
        debug!(message_type = message.type_name(), "background message received");
        match message {
            BackgroundMessage::StartBackgroundCheck => {
                if !self.check_requested {
                    self.check_requested = true;
                    self.persist();
                    info!(
                        interval_secs = self.config.check_interval.as_secs(),
                        "periodic due check started"
                    );
                }
                Ok(())
            }
            BackgroundMessage::UpdateTasksCache { tasks } => {
                debug!(task_count = tasks.len(), "task snapshot replaced");
                self.snapshot = tasks;
                self.persist();
                Ok(())
            }
            BackgroundMessage::ImmediateTaskCheck => {
                self.run_check(Utc::now()).await;
                Ok(())
            }
            BackgroundMessage::ShowNotification { notification } => {
                self.render(&notification).await
            }
            BackgroundMessage::PushReceived { payload } => self.handle_push(&payload).await,
            BackgroundMessage::NotificationClick { action, tag, data } => self
                .handle_click(action.as_deref(), tag.as_deref(), &data)
                .await
                .map(|_| ()),
        }
    }

    /// One due pass over the snapshot. Only tasks that entered a state since the last
    /// pass are announced; the returned classification covers every due task.
    pub async fn run_check(&mut self, now: DateTime<Utc>) -> DueClassification {
        let classification = classify(now, &self.snapshot);

        let mut current = HashSet::new();
        let mut fresh_overdue = Vec::new();
        let mut fresh_today = Vec::new();
        for (kind, tasks, fresh) in [
            (
                NotificationKind::Overdue,
                &classification.overdue,
                &mut fresh_overdue,
            ),
            (
                NotificationKind::DueToday,
                &classification.due_today,
                &mut fresh_today,
            ),
        ] {
            for task in tasks {
                let Some(due) = task.due_date else { continue };
                let key = (task.id.clone(), kind, due);
                if !self.announced.contains(&key) {
                    fresh.push(task);
                }
                current.insert(key);
            }
        }

        for (kind, fresh) in [
            (NotificationKind::Overdue, &fresh_overdue),
            (NotificationKind::DueToday, &fresh_today),
        ] {
            if fresh.is_empty() {
                continue;
            }
            let single = if fresh.len() == 1 {
                Some(fresh[0])
            } else {
                None
            };
            let notification =
                RenderedNotification::summary(kind, fresh.len(), single, &self.config.url);
            if let Err(err) = self.announce(&notification).await {
                warn!(error = %err, kind = kind.as_str(), "failed to render due summary");
            }
        }

        self.announced = current;
        debug!(
            overdue = classification.overdue.len(),
            due_today = classification.due_today.len(),
            "due check completed"
        );
        self.emit(BackgroundEvent::CheckCompleted {
            overdue: ids(&classification.overdue),
            due_today: ids(&classification.due_today),
        });
        classification
    }

    pub async fn handle_push(&self, payload: &PushPayload) -> NotifyResult<()> {
        let notification = payload.render(&self.config.url);
        debug!(tag = %notification.tag, "rendering push payload");
        self.announce(&notification).await
    }

    /// Close the clicked notification, report the click and route it onto a view.
    pub async fn handle_click(
        &self,
        action: Option<&str>,
        tag: Option<&str>,
        data: &NotificationData,
    ) -> NotifyResult<ClickRoute> {
        if let Some(tag) = tag {
            self.surface.close(tag).await;
        }
        self.emit(BackgroundEvent::Clicked {
            action: action.unwrap_or(ACTION_OPEN).to_string(),
            task_id: data.task_id.clone(),
        });
        route_click(self.views.as_ref(), action, Some(&data.url)).await
    }

    fn permitted(&self) -> bool {
        self.permission
            .as_ref()
            .is_none_or(|permission| permission.query().is_granted())
    }

    async fn render(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        if !self.permitted() {
            return Err(NotifyError::PermissionDenied(
                "notification permission not granted".into(),
            ));
        }
        self.surface.show(notification).await?;
        self.emit(BackgroundEvent::Rendered {
            tag: notification.tag.clone(),
        });
        Ok(())
    }

    /// Render, or fall back to the sensory tier when system notifications are not permitted.
    async fn announce(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        if self.permitted() {
            return self.render(notification).await;
        }
        let Some(sensory) = self.sensory.as_ref() else {
            return Err(NotifyError::PermissionDenied(
                "notification permission not granted".into(),
            ));
        };
        let options = PopupOptions {
            style: PopupStyle::Warning,
            ..PopupOptions::default()
        };
        if sensory.show_full(&notification.title, &notification.body, options) {
            debug!(tag = %notification.tag, "announced through sensory tier");
            Ok(())
        } else {
            Err(NotifyError::RenderFailure(
                "sensory tier could not announce".into(),
            ))
        }
    }

    fn persist(&self) {
        let state = CachedState {
            tasks: self.snapshot.clone(),
            background_check: self.check_requested,
        };
        if let Err(err) = self.cache.store(&state) {
            warn!(error = %err, "failed to persist background snapshot");
        }
    }

    fn emit(&self, event: BackgroundEvent) {
        if let Some(events) = self.events.as_ref() {
            let _ = events.send(event);
        }
    }

    fn reconcile_ticker(&self, ticker: &mut Option<Interval>) {
        match (self.check_requested, ticker.is_some()) {
            (true, false) => {
                let period = self.config.check_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *ticker = Some(interval);
            }
            (false, true) => *ticker = None,
            _ => {}
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        ready: watch::Sender<bool>,
    ) {
        let mut ticker = None;
        self.reconcile_ticker(&mut ticker);
        let _ = ready.send(true);
        self.emit(BackgroundEvent::Ready);
        info!(
            task_count = self.snapshot.len(),
            background_check = self.check_requested,
            "background context ready"
        );

        loop {
            let next = tokio::select! {
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => Some(envelope),
                    None => break,
                },
                _ = next_tick(&mut ticker) => None,
            };

            match next {
                Some(Envelope { message, reply }) => {
                    let result = self.handle(message).await;
                    if let Err(err) = result.as_ref() {
                        warn!(error = %err, "background message failed");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                    self.reconcile_ticker(&mut ticker);
                }
                None => {
                    self.run_check(Utc::now()).await;
                }
            }
        }

        let _ = ready.send(false);
        debug!("background context stopped");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn ids(tasks: &[Task]) -> Vec<TaskId> {
    tasks.iter().map(|task| task.id.clone()).collect()
}

/// Start the context on the current runtime.
pub fn spawn(context: BackgroundContext) -> (BackgroundHandle, JoinHandle<()>) {
    let (inbox, receiver) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = watch::channel(false);
    let handle = BackgroundHandle {
        inbox,
        ready: ready_rx,
        ready_timeout: context.config.ready_timeout,
    };
    let task = tokio::spawn(context.run(receiver, ready_tx));
    (handle, task)
}

#[derive(Clone)]
pub struct BackgroundHandle {
    inbox: mpsc::UnboundedSender<Envelope>,
    ready: watch::Receiver<bool>,
    ready_timeout: Duration,
}

impl BackgroundHandle {
    /// Fire-and-forget delivery of a message.
    pub fn post(&self, message: BackgroundMessage) -> NotifyResult<()> {
        self.inbox
            .send(Envelope {
                message,
                reply: None,
            })
            .map_err(|_| NotifyError::ChannelUnsupported("background context is gone".into()))
    }

    /// Decode a raw `{type, data}` message and post it.
    pub fn post_raw(&self, raw: &str) -> NotifyResult<()> {
        self.post(BackgroundMessage::decode(raw)?)
    }

    /// Post a message and wait for the context to finish handling it.
    pub async fn request(&self, message: BackgroundMessage) -> NotifyResult<()> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(Envelope {
                message,
                reply: Some(reply),
            })
            .map_err(|_| NotifyError::ChannelUnsupported("background context is gone".into()))?;

        match tokio::time::timeout(DEFAULT_RENDER_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NotifyError::RenderFailure(
                "background context dropped the request".into(),
            )),
            Err(_) => Err(NotifyError::RenderFailure(
                "background context did not answer in time".into(),
            )),
        }
    }

    /// Wait, bounded by the ready timeout, for the context to come up.
    pub async fn ready(&self) -> NotifyResult<()> {
        if self.inbox.is_closed() {
            return Err(NotifyError::ChannelUnsupported(
                "background context stopped".into(),
            ));
        }
        let mut ready = self.ready.clone();
        let outcome = tokio::time::timeout(self.ready_timeout, ready.wait_for(|ready| *ready))
            .await
            .map(|result| result.is_ok());
        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(NotifyError::ChannelUnsupported(
                "background context stopped".into(),
            )),
            Err(_) => Err(NotifyError::ChannelUnsupported(
                "background context not ready".into(),
            )),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.inbox.is_closed() && *self.ready.borrow()
    }

    pub fn update_tasks(&self, tasks: Vec<Task>) -> NotifyResult<()> {
        self.post(BackgroundMessage::UpdateTasksCache { tasks })
    }

    pub fn start_background_check(&self) -> NotifyResult<()> {
        self.post(BackgroundMessage::StartBackgroundCheck)
    }

    pub fn immediate_check(&self) -> NotifyResult<()> {
        self.post(BackgroundMessage::ImmediateTaskCheck)
    }
}

#[async_trait]
impl BackgroundRoute for BackgroundHandle {
    async fn show_via_background(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        self.ready().await?;
        self.request(BackgroundMessage::ShowNotification {
            notification: notification.clone(),
        })
        .await
    }
}

impl BackgroundPresence for BackgroundHandle {
    fn is_alive(&self) -> bool {
        BackgroundHandle::is_alive(self)
    }
}
