//! Rendered notification model and the system notification backend

pub mod payload;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{NotifyError, NotifyResult};
use crate::types::{Task, TaskId};

pub use payload::PushPayload;

pub const DEFAULT_ICON: &str = "/icon-192.png";
pub const DEFAULT_URL: &str = "/";
pub const DEFAULT_VIBRATE: [u64; 3] = [200, 100, 200];
pub const DEFAULT_PUSH_TITLE: &str = "Task notification";
pub const DEFAULT_PUSH_BODY: &str = "You have a task notification";

pub const ACTION_OPEN: &str = "open";
pub const ACTION_DISMISS: &str = "dismiss";
pub const ACTION_COMPLETE: &str = "complete";
pub const ACTION_SNOOZE: &str = "snooze";

const SYSTEM_APP_NAME: &str = "Due Notify";
const SYSTEM_ICON: &str = "dialog-information";

/// Why a notification was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    /// A single task reached its due instant
    #[default]
    TaskDue,
    /// Background pass found tasks past their due date
    Overdue,
    /// Background pass found tasks due within the horizon
    DueToday,
    /// Message raised by hand, not tied to a task
    Adhoc,
    /// End-to-end check of the render path
    Test,
    /// Remote push without a recognized type
    Push,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskDue => "task-due",
            Self::Overdue => "overdue",
            Self::DueToday => "due-today",
            Self::Adhoc => "adhoc",
            Self::Test => "test",
            Self::Push => "push",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task-due" | "task_due" | "due" => Ok(Self::TaskDue),
            "overdue" => Ok(Self::Overdue),
            "due-today" | "due_today" | "today" => Ok(Self::DueToday),
            "adhoc" => Ok(Self::Adhoc),
            "test" => Ok(Self::Test),
            "push" => Ok(Self::Push),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

impl NotificationAction {
    pub fn new(action: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            title: title.into(),
        }
    }

    pub fn open() -> Self {
        Self::new(ACTION_OPEN, "Open app")
    }

    pub fn dismiss() -> Self {
        Self::new(ACTION_DISMISS, "Dismiss")
    }

    pub fn complete() -> Self {
        Self::new(ACTION_COMPLETE, "Mark complete")
    }

    pub fn snooze() -> Self {
        Self::new(ACTION_SNOOZE, "Snooze")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedNotification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
    pub require_interaction: bool,
    pub vibrate: Vec<u64>,
}

pub fn task_tag(task_id: &str) -> String {
    format!("task-{task_id}")
}

impl RenderedNotification {
    fn base(title: String, body: String, tag: String, data: NotificationData) -> Self {
        Self {
            title,
            body,
            icon: DEFAULT_ICON.to_string(),
            badge: DEFAULT_ICON.to_string(),
            tag,
            data,
            actions: vec![NotificationAction::open(), NotificationAction::dismiss()],
            require_interaction: true,
            vibrate: DEFAULT_VIBRATE.to_vec(),
        }
    }

    pub fn task_due(task: &Task, url: &str) -> Self {
        let mut notification = Self::base(
            "Task due".to_string(),
            format!("\"{}\" is due now", task.text),
            task_tag(&task.id),
            NotificationData {
                task_id: Some(task.id.clone()),
                kind: NotificationKind::TaskDue,
                due_date: task.due_date,
                url: url.to_string(),
            },
        );
        notification.actions = vec![
            NotificationAction::open(),
            NotificationAction::complete(),
            NotificationAction::snooze(),
            NotificationAction::dismiss(),
        ];
        notification
    }

    /// Summary for a background pass; `single` names the task when only one is involved.
    pub fn summary(kind: NotificationKind, count: usize, single: Option<&Task>, url: &str) -> Self {
        let (title, body) = match kind {
            NotificationKind::Overdue => (
                "Overdue tasks".to_string(),
                format!("{count} task(s) are past their due date"),
            ),
            _ => (
                "Tasks due today".to_string(),
                format!("{count} task(s) are due within 24 hours"),
            ),
        };
        let body = match single {
            Some(task) if count == 1 => format!("\"{}\": {body}", task.text),
            _ => body,
        };

        Self::base(
            title,
            body,
            format!("due-summary-{}", kind.as_str()),
            NotificationData {
                task_id: single.map(|task| task.id.clone()),
                kind,
                due_date: single.and_then(|task| task.due_date),
                url: url.to_string(),
            },
        )
    }

    pub fn adhoc(title: &str, body: &str, url: &str) -> Self {
        let mut notification = Self::base(
            title.to_string(),
            body.to_string(),
            "adhoc".to_string(),
            NotificationData {
                task_id: None,
                kind: NotificationKind::Adhoc,
                due_date: None,
                url: url.to_string(),
            },
        );
        notification.require_interaction = false;
        notification
    }

    pub fn test(url: &str) -> Self {
        Self::base(
            "Push notification test".to_string(),
            "Push notifications are working".to_string(),
            "test-push-notification".to_string(),
            NotificationData {
                task_id: None,
                kind: NotificationKind::Test,
                due_date: None,
                url: url.to_string(),
            },
        )
    }
}

/// Anything that can put a rendered notification in front of the user
#[async_trait]
pub trait NotificationSurface: Send + Sync {
    async fn show(&self, notification: &RenderedNotification) -> NotifyResult<()>;

    /// Take down the notification currently shown under `tag`, if any.
    async fn close(&self, tag: &str);
}

/// A user activating a shown notification. `action` is `None` for a click on the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationClick {
    pub action: Option<String>,
    pub tag: String,
    pub data: NotificationData,
}

/// Map a daemon action key to the action of a click. The body click arrives as `default`.
pub fn click_action(key: &str) -> Option<String> {
    match key {
        "default" | "" => None,
        other => Some(other.to_string()),
    }
}

#[cfg(target_os = "linux")]
type OpenHandle = notify_rust::NotificationHandle;
#[cfg(not(target_os = "linux"))]
type OpenHandle = ();

type OpenNotifications = Arc<Mutex<HashMap<String, OpenHandle>>>;

/// Desktop notifications via notify-rust
#[derive(Clone)]
pub struct SystemNotifier {
    display_duration_ms: u64,
    clicks: Option<mpsc::UnboundedSender<NotificationClick>>,
    open: OpenNotifications,
}

impl SystemNotifier {
    pub fn new(display_duration_ms: u64) -> Self {
        Self {
            display_duration_ms,
            clicks: None,
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Report clicks on shown notifications to `clicks`. Only the XDG daemon reports them.
    pub fn with_clicks(mut self, clicks: mpsc::UnboundedSender<NotificationClick>) -> Self {
        self.clicks = Some(clicks);
        self
    }

    fn open(&self) -> MutexGuard<'_, HashMap<String, OpenHandle>> {
        lock_open(&self.open)
    }

    #[cfg(target_os = "linux")]
    fn listen_for_click(&self, notification: &RenderedNotification, id: u32) {
        let Some(clicks) = self.clicks.clone() else {
            return;
        };
        let open = self.open.clone();
        let tag = notification.tag.clone();
        let data = notification.data.clone();
        tokio::task::spawn_blocking(move || {
            let mut action = None;
            let waited = notify_rust::handle_action(id, |response| {
                if let notify_rust::ActionResponse::Custom(key) = response {
                    action = Some(click_action(key));
                }
            });
            {
                let mut open = lock_open(&open);
                if open.get(&tag).is_some_and(|handle| handle.id() == id) {
                    open.remove(&tag);
                }
            }
            if let Err(err) = waited {
                debug!(error = %err, tag = %tag, "stopped waiting for notification action");
                return;
            }
            if let Some(action) = action {
                let _ = clicks.send(NotificationClick { action, tag, data });
            }
        });
    }
}

fn lock_open(open: &OpenNotifications) -> MutexGuard<'_, HashMap<String, OpenHandle>> {
    open.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl NotificationSurface for SystemNotifier {
    async fn show(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        let rendered = notification.clone();
        let display_duration_ms = self.display_duration_ms;
        let handle = tokio::task::spawn_blocking(move || {
            send_system_notification(&rendered, display_duration_ms)
        })
        .await
        .map_err(|err| NotifyError::RenderFailure(format!("notification worker failed: {err}")))??;

        #[cfg(target_os = "linux")]
        self.listen_for_click(notification, handle.id());
        self.open().insert(notification.tag.clone(), handle);
        Ok(())
    }

    async fn close(&self, tag: &str) {
        let Some(handle) = self.open().remove(tag) else {
            return;
        };
        #[cfg(target_os = "linux")]
        if let Err(err) = tokio::task::spawn_blocking(move || handle.close()).await {
            warn!(error = %err, tag, "failed to close system notification");
        }
        #[cfg(not(target_os = "linux"))]
        let () = handle;
        debug!(tag, "system notification closed");
    }
}

#[cfg(target_os = "linux")]
fn send_system_notification(
    notification: &RenderedNotification,
    display_duration_ms: u64,
) -> NotifyResult<OpenHandle> {
    let system = system_notification(notification, display_duration_ms);
    match system.show() {
        Ok(handle) => {
            debug!(tag = %notification.tag, id = handle.id(), "system notification sent successfully");
            Ok(handle)
        }
        Err(err) => {
            warn!(error = %err, tag = %notification.tag, "failed to send system notification");
            Err(NotifyError::RenderFailure(err.to_string()))
        }
    }
}

#[cfg(target_os = "macos")]
fn send_system_notification(
    notification: &RenderedNotification,
    display_duration_ms: u64,
) -> NotifyResult<OpenHandle> {
    let system = system_notification(notification, display_duration_ms);
    match system.show() {
        Ok(_) => {
            debug!(tag = %notification.tag, "system notification sent successfully");
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, tag = %notification.tag, "failed to send system notification");
            Err(NotifyError::RenderFailure(err.to_string()))
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn system_notification(
    notification: &RenderedNotification,
    display_duration_ms: u64,
) -> notify_rust::Notification {
    let timeout_ms = display_duration_ms.min(u32::MAX as u64) as u32;
    debug!(
        tag = %notification.tag,
        title = %notification.title,
        timeout_ms,
        "sending system notification"
    );

    let mut system = notify_rust::Notification::new();
    system
        .appname(SYSTEM_APP_NAME)
        .summary(&notification.title)
        .body(&notification.body)
        .icon(SYSTEM_ICON);

    if notification.require_interaction {
        system.timeout(notify_rust::Timeout::Never);
    } else {
        system.timeout(notify_rust::Timeout::Milliseconds(timeout_ms));
    }

    #[cfg(target_os = "linux")]
    for action in &notification.actions {
        system.action(&action.action, &action.title);
    }
    system
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn send_system_notification(
    notification: &RenderedNotification,
    _display_duration_ms: u64,
) -> NotifyResult<OpenHandle> {
    debug!(
        tag = %notification.tag,
        "system notifications not supported on this OS"
    );
    Err(NotifyError::ChannelUnsupported(
        "system notifications are not supported on this OS".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_task() -> Task {
        let created = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
        Task::new("t1", "file report", created).with_due_date(created)
    }

    #[test]
    fn test_notification_kind_from_str() {
        assert_eq!(
            NotificationKind::from_str("Overdue"),
            Ok(NotificationKind::Overdue)
        );
        assert_eq!(
            NotificationKind::from_str("due_today"),
            Ok(NotificationKind::DueToday)
        );
        assert_eq!(
            NotificationKind::from_str("TASK-DUE"),
            Ok(NotificationKind::TaskDue)
        );
        assert!(NotificationKind::from_str("").is_err());
        assert!(NotificationKind::from_str("weekly").is_err());
    }

    #[test]
    fn test_notification_kind_roundtrip() {
        for kind in [
            NotificationKind::TaskDue,
            NotificationKind::Overdue,
            NotificationKind::DueToday,
            NotificationKind::Adhoc,
            NotificationKind::Test,
            NotificationKind::Push,
        ] {
            assert_eq!(NotificationKind::from_str(kind.as_str()), Ok(kind));
        }
    }

    #[test]
    fn test_task_due_notification_is_tagged_by_task() {
        let task = sample_task();
        let notification = RenderedNotification::task_due(&task, "/");

        assert!(notification.tag.contains("t1"));
        assert_eq!(notification.data.task_id.as_deref(), Some("t1"));
        assert_eq!(notification.data.kind, NotificationKind::TaskDue);
        assert!(notification.body.contains("file report"));
        let actions = notification
            .actions
            .iter()
            .map(|action| action.action.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            actions,
            vec![ACTION_OPEN, ACTION_COMPLETE, ACTION_SNOOZE, ACTION_DISMISS]
        );
    }

    #[test]
    fn test_rendered_notification_wire_shape() {
        let notification = RenderedNotification::task_due(&sample_task(), "/tasks");
        let value = serde_json::to_value(&notification).expect("should serialize");

        assert_eq!(value["data"]["taskId"], "t1");
        assert_eq!(value["data"]["type"], "task-due");
        assert_eq!(value["data"]["url"], "/tasks");
        assert_eq!(value["requireInteraction"], true);
        assert_eq!(value["vibrate"], serde_json::json!([200, 100, 200]));
    }

    #[test]
    fn test_summary_names_single_task() {
        let task = sample_task();
        let single = RenderedNotification::summary(NotificationKind::Overdue, 1, Some(&task), "/");
        assert_eq!(single.tag, "due-summary-overdue");
        assert!(single.body.starts_with("\"file report\""));
        assert_eq!(single.data.task_id.as_deref(), Some("t1"));

        let many = RenderedNotification::summary(NotificationKind::DueToday, 3, None, "/");
        assert_eq!(many.tag, "due-summary-due-today");
        assert!(many.body.starts_with("3 task(s)"));
    }

    #[test]
    fn test_click_action_maps_body_click_to_open() {
        assert_eq!(click_action("default"), None);
        assert_eq!(click_action("complete"), Some("complete".to_string()));
        assert_eq!(click_action(ACTION_DISMISS), Some("dismiss".to_string()));
    }

    #[tokio::test]
    async fn test_closing_unknown_tag_is_a_noop() {
        let notifier = SystemNotifier::new(1_000);
        notifier.close("task-missing").await;
        assert!(notifier.open().is_empty());
    }
}
