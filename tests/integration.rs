use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;

use due_notify::background::{
    BackgroundEvent, BackgroundMessage, MemoryViewHost, SnapshotCache,
};
use due_notify::delivery::sensory::{Popup, PopupAction, SensorySurface, Tone};
use due_notify::delivery::{DeliveryOutcome, DeliveryRequest, Tier};
use due_notify::error::{NotifyError, NotifyResult};
use due_notify::notification::{NotificationClick, NotificationSurface, RenderedNotification};
use due_notify::push::PushStateStore;
use due_notify::runtime::{NotifyRuntime, Surfaces};
use due_notify::settings::Settings;
use due_notify::store::MemoryTaskStore;
use due_notify::types::Task;

#[derive(Default)]
struct RecordingNotifications {
    shown: Mutex<Vec<RenderedNotification>>,
    closed: Mutex<Vec<String>>,
}

impl RecordingNotifications {
    fn shown(&self) -> Vec<RenderedNotification> {
        self.shown.lock().unwrap().clone()
    }

    fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSurface for RecordingNotifications {
    async fn show(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        self.shown.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn close(&self, tag: &str) {
        self.closed.lock().unwrap().push(tag.to_string());
    }
}

#[derive(Default)]
struct RecordingPopups(Mutex<Vec<Popup>>);

impl RecordingPopups {
    fn popups(&self) -> Vec<Popup> {
        self.0.lock().unwrap().clone()
    }
}

impl SensorySurface for RecordingPopups {
    fn play_tone(&self, _tone: &Tone) -> NotifyResult<()> {
        Ok(())
    }

    fn vibrate(&self, _pattern: &[u64]) -> NotifyResult<()> {
        Err(NotifyError::ChannelUnsupported("no motor".into()))
    }

    fn show_popup(&self, popup: &Popup) -> NotifyResult<()> {
        self.0.lock().unwrap().push(popup.clone());
        Ok(())
    }

    fn close_popup(&self, _popup_id: u64) {}
}

struct Harness {
    runtime: NotifyRuntime,
    store: Arc<MemoryTaskStore>,
    notifications: Arc<RecordingNotifications>,
    popups: Arc<RecordingPopups>,
    views: Arc<MemoryViewHost>,
    clicks: mpsc::UnboundedSender<NotificationClick>,
}

fn settings(permission: &str) -> Settings {
    Settings {
        notification_permission: permission.to_string(),
        ..Settings::default()
    }
}

fn harness(settings: &Settings, tasks: Vec<Task>, cache: SnapshotCache) -> Harness {
    let store = Arc::new(MemoryTaskStore::new(tasks));
    let notifications = Arc::new(RecordingNotifications::default());
    let popups = Arc::new(RecordingPopups::default());
    let views = Arc::new(MemoryViewHost::default());
    let (clicks, click_rx) = mpsc::unbounded_channel();
    let surfaces = Surfaces {
        notifications: notifications.clone(),
        sensory: popups.clone(),
        views: views.clone(),
        cache,
        push_state: PushStateStore::in_memory(),
        clicks: Some(click_rx),
    };
    let runtime =
        NotifyRuntime::start(settings, store.clone(), surfaces).expect("runtime should start");
    Harness {
        runtime,
        store,
        notifications,
        popups,
        views,
        clicks,
    }
}

fn due_in(id: &str, text: &str, offset: TimeDelta) -> Task {
    let now = Utc::now();
    Task::new(id, text, now).with_due_date(now + offset)
}

#[tokio::test(start_paused = true)]
async fn due_alarm_is_delivered_with_task_tag() {
    let mut harness = harness(
        &settings("granted"),
        vec![due_in("t1", "water plants", TimeDelta::seconds(2))],
        SnapshotCache::in_memory(),
    );

    harness
        .runtime
        .run_until(tokio::time::sleep(Duration::from_secs(3)))
        .await;

    let shown = harness.notifications.shown();
    assert_eq!(shown.len(), 1);
    assert!(shown[0].tag.contains("t1"));
    assert_eq!(shown[0].data.task_id.as_deref(), Some("t1"));
    assert!(shown[0].body.contains("water plants"));
    // Task alarms always add the in-app popup on top of the system notification.
    assert_eq!(harness.popups.popups().len(), 1);
    assert!(!harness.runtime.center.scheduler().is_scheduled("t1"));
    harness.runtime.shutdown();
}

#[tokio::test]
async fn denied_permission_falls_back_to_sensory_only() {
    let harness = harness(&settings("denied"), Vec::new(), SnapshotCache::in_memory());
    let task = due_in("t2", "stretch", TimeDelta::zero());

    let report = harness
        .runtime
        .dispatcher
        .deliver(DeliveryRequest::Task(task))
        .await;

    assert_eq!(report.outcome, DeliveryOutcome::Delivered(Tier::Sensory));
    assert_eq!(report.attempted, vec![Tier::Sensory]);
    assert!(harness.notifications.shown().is_empty());
    assert_eq!(harness.popups.popups()[0].title, "Task due");
    harness.runtime.shutdown();
}

#[tokio::test(start_paused = true)]
async fn completing_a_popup_updates_the_store() {
    let mut harness = harness(
        &settings("denied"),
        vec![due_in("t3", "send invoice", TimeDelta::seconds(1))],
        SnapshotCache::in_memory(),
    );
    let sensory = harness.runtime.sensory.clone();

    harness
        .runtime
        .run_until(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let popup_id = sensory.open_popups()[0];
            let resolution = sensory
                .resolve(popup_id, PopupAction::Complete)
                .expect("popup should be open");
            assert_eq!(resolution.task_id().map(String::as_str), Some("t3"));
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await;

    let task = harness.store.get("t3").expect("task should still exist");
    assert!(task.completed);
    harness.runtime.shutdown();
}

#[tokio::test]
async fn background_check_announces_each_due_task_once() {
    let mut harness = harness(&settings("granted"), Vec::new(), SnapshotCache::in_memory());
    let mut events = harness.runtime.take_events().expect("events available");
    let background = harness.runtime.background.clone();

    background.ready().await.expect("background should come up");
    background
        .update_tasks(vec![
            due_in("late", "renew passport", -TimeDelta::hours(2)),
            due_in("soon", "dentist", TimeDelta::hours(3)),
            due_in("later", "taxes", TimeDelta::days(3)),
        ])
        .unwrap();
    background
        .request(BackgroundMessage::ImmediateTaskCheck)
        .await
        .unwrap();
    background
        .request(BackgroundMessage::ImmediateTaskCheck)
        .await
        .unwrap();

    let tags = harness
        .notifications
        .shown()
        .into_iter()
        .map(|notification| notification.tag)
        .collect::<Vec<_>>();
    assert_eq!(tags.len(), 2);
    assert!(tags.iter().all(|tag| tag.starts_with("due-summary-")));

    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BackgroundEvent::CheckCompleted { overdue, due_today } = event {
            completed.push((overdue, due_today));
        }
    }
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[1].0, vec!["late".to_string()]);
    assert_eq!(completed[1].1, vec!["soon".to_string()]);
    harness.runtime.shutdown();
}

#[tokio::test]
async fn background_snapshot_survives_restart() {
    let temp = TempDir::new().unwrap();
    let cache_path = temp.path().join("task-data-cache.json");
    let tasks = vec![due_in("kept", "buy milk", TimeDelta::hours(5))];

    let harness = harness(
        &settings("granted"),
        Vec::new(),
        SnapshotCache::at(&cache_path),
    );
    let background = harness.runtime.background.clone();
    background.ready().await.unwrap();
    background
        .request(BackgroundMessage::UpdateTasksCache {
            tasks: tasks.clone(),
        })
        .await
        .unwrap();
    background
        .request(BackgroundMessage::StartBackgroundCheck)
        .await
        .unwrap();
    harness.runtime.shutdown();

    let restored = SnapshotCache::at(&cache_path).load();
    assert_eq!(restored.tasks, tasks);
    assert!(restored.background_check);
}

#[tokio::test]
async fn push_subscribe_without_channel_is_unsupported() {
    let harness = harness(&settings("granted"), Vec::new(), SnapshotCache::in_memory());
    harness.runtime.background.ready().await.unwrap();

    let result = harness.runtime.push.subscribe().await;
    assert!(!result.success);
    assert_eq!(result.code, Some("CHANNEL_UNSUPPORTED"));

    let result = harness.runtime.push.unsubscribe().await;
    assert!(result.success);
    assert!(!harness.runtime.push.is_subscribed());
    harness.runtime.shutdown();
}

#[tokio::test]
async fn denied_background_check_stays_off_the_system_tier() {
    let harness = harness(&settings("denied"), Vec::new(), SnapshotCache::in_memory());
    let background = harness.runtime.background.clone();
    background.ready().await.unwrap();
    background
        .update_tasks(vec![due_in("late", "renew passport", -TimeDelta::hours(1))])
        .unwrap();

    background
        .request(BackgroundMessage::ImmediateTaskCheck)
        .await
        .unwrap();
    let pushed = background
        .request(BackgroundMessage::PushReceived {
            payload: Default::default(),
        })
        .await;

    assert!(pushed.is_ok());
    assert!(harness.notifications.shown().is_empty());
    let titles = harness
        .popups
        .popups()
        .into_iter()
        .map(|popup| popup.title)
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["Overdue tasks", "Task notification"]);
    harness.runtime.shutdown();
}

#[tokio::test]
async fn clicked_notification_is_closed_and_opens_its_view() {
    let mut harness = harness(&settings("granted"), Vec::new(), SnapshotCache::in_memory());
    let mut events = harness.runtime.take_events().expect("events available");
    harness.runtime.background.ready().await.unwrap();
    let notification = RenderedNotification::task_due(
        &due_in("t7", "book flights", TimeDelta::zero()),
        "/tasks",
    );

    harness
        .clicks
        .send(NotificationClick {
            action: None,
            tag: notification.tag.clone(),
            data: notification.data.clone(),
        })
        .unwrap();

    loop {
        let event = events.recv().await.expect("background event");
        if let BackgroundEvent::Clicked { action, task_id } = event {
            assert_eq!(action, "open");
            assert_eq!(task_id.as_deref(), Some("t7"));
            break;
        }
    }
    // The click event is emitted before the view is opened.
    harness
        .runtime
        .background
        .request(BackgroundMessage::ImmediateTaskCheck)
        .await
        .unwrap();
    assert_eq!(harness.notifications.closed(), vec!["task-t7".to_string()]);
    let views = harness.views.views();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].url, "/tasks");
    harness.runtime.shutdown();
}
