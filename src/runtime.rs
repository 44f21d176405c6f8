//! Process wiring: builds every service from [`Settings`] and joins them.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::background::{
    self, BackgroundConfig, BackgroundContext, BackgroundEvent, BackgroundHandle,
    BackgroundMessage, SnapshotCache, SystemViewHost, ViewHost,
};
use crate::capability::{HostProbe, PermissionState};
use crate::delivery::sensory::{PopupResolution, SensorySurface, TerminalSurface};
use crate::delivery::{Dispatcher, LocalDeliverer, SensoryDeliverer};
use crate::foreground::NotificationCenter;
use crate::notification::{NotificationClick, NotificationSurface, SystemNotifier};
use crate::push::{HttpPushChannel, HttpSubscriptionRegistry, PushService, PushStateStore};
use crate::scheduler::Scheduler;
use crate::settings::Settings;
use crate::store::TaskStore;

/// Output devices and state files the services run against.
pub struct Surfaces {
    pub notifications: Arc<dyn NotificationSurface>,
    pub sensory: Arc<dyn SensorySurface>,
    pub views: Arc<dyn ViewHost>,
    pub cache: SnapshotCache,
    pub push_state: PushStateStore,
    /// Clicks reported by the notification surface, routed by the background context.
    pub clicks: Option<mpsc::UnboundedReceiver<NotificationClick>>,
}

impl Surfaces {
    pub fn system(settings: &Settings) -> Self {
        let (click_tx, clicks) = mpsc::unbounded_channel();
        Self {
            notifications: Arc::new(
                SystemNotifier::new(settings.popup_duration_ms).with_clicks(click_tx),
            ),
            sensory: Arc::new(TerminalSurface),
            views: Arc::new(SystemViewHost::new(settings.app_url.clone())),
            cache: SnapshotCache::default_path()
                .map(SnapshotCache::at)
                .unwrap_or_else(SnapshotCache::in_memory),
            push_state: PushStateStore::default_path()
                .map(PushStateStore::at)
                .unwrap_or_else(PushStateStore::in_memory),
            clicks: Some(clicks),
        }
    }
}

pub struct NotifyRuntime {
    pub permission: Arc<PermissionState>,
    pub background: BackgroundHandle,
    pub sensory: Arc<SensoryDeliverer>,
    pub dispatcher: Arc<Dispatcher>,
    pub push: Arc<PushService>,
    pub center: Arc<NotificationCenter>,
    background_task: JoinHandle<()>,
    click_task: Option<JoinHandle<()>>,
    morning_hour: Option<u32>,
    resolutions: Option<mpsc::UnboundedReceiver<PopupResolution>>,
    events: Option<mpsc::UnboundedReceiver<BackgroundEvent>>,
}

impl NotifyRuntime {
    /// Spawn the background context and build the foreground services around it.
    /// Must be called inside a tokio runtime.
    pub fn start(
        settings: &Settings,
        store: Arc<dyn TaskStore>,
        surfaces: Surfaces,
    ) -> Result<Self> {
        let permission = Arc::new(PermissionState::new(settings.permission()));

        let (resolution_tx, resolutions) = mpsc::unbounded_channel();
        let sensory = Arc::new(
            SensoryDeliverer::new(surfaces.sensory)
                .with_sound(settings.sound_enabled)
                .with_vibration(settings.vibration_enabled)
                .with_task_popup_duration(settings.popup_duration())
                .with_resolution_sink(resolution_tx),
        );

        let (event_tx, events) = mpsc::unbounded_channel();
        let context = BackgroundContext::new(
            surfaces.notifications.clone(),
            surfaces.views,
            surfaces.cache,
        )
        .with_config(BackgroundConfig {
            check_interval: settings.check_interval(),
            url: settings.app_url.clone(),
            ready_timeout: settings.ready_timeout(),
        })
        .with_permission(permission.clone())
        .with_sensory(sensory.clone())
        .with_events(event_tx);
        let (background, background_task) = background::spawn(context);
        let click_task = surfaces
            .clicks
            .map(|clicks| tokio::spawn(forward_clicks(clicks, background.clone())));

        let mut push = PushService::new(permission.clone(), surfaces.push_state)
            .with_public_key(settings.push_public_key.clone())
            .with_user_agent(settings.user_agent.clone())
            .with_url(settings.app_url.clone())
            .with_background(Arc::new(background.clone()))
            .with_renderer(Arc::new(background.clone()));
        if let Some(url) = settings.push_gateway_url() {
            let channel = Arc::new(HttpPushChannel::new(url)?);
            push = push.with_channel(channel.clone()).with_gateway(channel);
        }
        if let Some(url) = settings.push_registry_url() {
            push = push.with_registry(Arc::new(HttpSubscriptionRegistry::new(url)?));
        }
        let push = Arc::new(push);

        let probe = HostProbe::new(settings.user_agent.clone(), permission.clone())
            .with_touch(settings.touch)
            .with_standalone(settings.standalone)
            .with_push_channel(settings.push_gateway_url().is_some())
            .with_background(Arc::new(background.clone()));

        let dispatcher = Arc::new(
            Dispatcher::new(Arc::new(probe), sensory.clone())
                .with_local(LocalDeliverer::new(surfaces.notifications))
                .with_background(Arc::new(background.clone()))
                .with_push(push.clone())
                .with_url(settings.app_url.clone()),
        );

        let center = Arc::new(
            NotificationCenter::new(Scheduler::new(dispatcher.clone()), store)
                .with_background(background.clone())
                .with_dispatcher(dispatcher.clone())
                .with_check_interval(settings.check_interval())
                .with_snooze(settings.snooze()),
        );

        debug!("notification runtime assembled");
        Ok(Self {
            permission,
            background,
            sensory,
            dispatcher,
            push,
            center,
            background_task,
            click_task,
            morning_hour: settings.morning_summary_hour(),
            resolutions: Some(resolutions),
            events: Some(events),
        })
    }

    /// Events from the background context, unless the center already consumes them.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<BackgroundEvent>> {
        self.events.take()
    }

    /// Schedule the store's tasks and follow it until `shutdown` resolves.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) {
        let live = self.center.start();
        info!(live_alarms = live, "watching tasks");
        if let Some(hour) = self.morning_hour {
            self.center.start_morning_summary(hour);
        }

        let resolutions = self
            .resolutions
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        let events = self
            .events
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);

        tokio::select! {
            _ = self.center.run(resolutions, events) => {}
            _ = shutdown => {}
        }
    }

    pub fn shutdown(self) {
        self.center.stop();
        self.center.scheduler().cancel_all();
        self.sensory.close_all();
        self.background_task.abort();
        if let Some(click_task) = self.click_task {
            click_task.abort();
        }
        debug!("notification runtime stopped");
    }
}

async fn forward_clicks(
    mut clicks: mpsc::UnboundedReceiver<NotificationClick>,
    background: BackgroundHandle,
) {
    while let Some(click) = clicks.recv().await {
        let message = BackgroundMessage::NotificationClick {
            action: click.action,
            tag: Some(click.tag),
            data: click.data,
        };
        if let Err(err) = background.post(message) {
            warn!(error = %err, "dropping notification click");
            break;
        }
    }
}
