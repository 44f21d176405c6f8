//! Tiered delivery of alarms and ad-hoc messages.
//!
//! The dispatcher asks the capability probe for a [`TierPlan`], tries the primary tier,
//! falls back to the background route and finally to the sensory tier. Every tier error
//! is logged and swallowed here; callers only get a report of what was attempted.

pub mod local;
pub mod sensory;
pub mod speaker;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityProbe, DeliveryStrategy, TierPlan};
use crate::error::NotifyResult;
use crate::notification::{DEFAULT_URL, RenderedNotification};
use crate::scheduler::AlarmHandler;
use crate::types::Task;

pub use local::LocalDeliverer;
pub use sensory::{PopupOptions, PopupStyle, SensoryDeliverer};

/// Hands a notification to the background context for rendering.
#[async_trait]
pub trait BackgroundRoute: Send + Sync {
    async fn show_via_background(&self, notification: &RenderedNotification) -> NotifyResult<()>;
}

/// Asks the cloud push service to deliver a notification to this device.
#[async_trait]
pub trait PushTier: Send + Sync {
    async fn push(&self, notification: &RenderedNotification) -> NotifyResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRequest {
    Task(Task),
    Adhoc { title: String, body: String },
    /// Already rendered elsewhere, e.g. a due summary or a push payload.
    Notification(RenderedNotification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    BackgroundRouted,
    CloudPush,
    Sensory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "tier")]
pub enum DeliveryOutcome {
    Delivered(Tier),
    FallbackDelivered(Tier),
    FailedSilently,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub plan: TierPlan,
    pub outcome: DeliveryOutcome,
    pub attempted: Vec<Tier>,
}

impl DeliveryReport {
    pub fn attempted(&self, tier: Tier) -> bool {
        self.attempted.contains(&tier)
    }
}

pub struct Dispatcher {
    probe: Arc<dyn CapabilityProbe>,
    sensory: Arc<SensoryDeliverer>,
    local: Option<LocalDeliverer>,
    background: Option<Arc<dyn BackgroundRoute>>,
    push: Option<Arc<dyn PushTier>>,
    url: String,
}

impl Dispatcher {
    pub fn new(probe: Arc<dyn CapabilityProbe>, sensory: Arc<SensoryDeliverer>) -> Self {
        Self {
            probe,
            sensory,
            local: None,
            background: None,
            push: None,
            url: DEFAULT_URL.to_string(),
        }
    }

    pub fn with_local(mut self, local: LocalDeliverer) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_background(mut self, background: Arc<dyn BackgroundRoute>) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushTier>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn sensory(&self) -> &Arc<SensoryDeliverer> {
        &self.sensory
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn render(&self, request: &DeliveryRequest) -> RenderedNotification {
        match request {
            DeliveryRequest::Task(task) => RenderedNotification::task_due(task, &self.url),
            DeliveryRequest::Adhoc { title, body } => {
                RenderedNotification::adhoc(title, body, &self.url)
            }
            DeliveryRequest::Notification(notification) => notification.clone(),
        }
    }

    pub async fn deliver(&self, request: DeliveryRequest) -> DeliveryReport {
        let plan = self.probe.snapshot().plan();
        let notification = self.render(&request);
        let mut attempted = Vec::new();

        let primary_tier = match plan.primary {
            DeliveryStrategy::Local => Some(Tier::Local),
            DeliveryStrategy::BackgroundRouted => Some(Tier::BackgroundRouted),
            DeliveryStrategy::PushOnly => Some(Tier::CloudPush),
            DeliveryStrategy::SensoryOnly => None,
        };

        let mut outcome = None;
        if let Some(tier) = primary_tier
            && self.attempt(tier, &notification, &mut attempted).await
        {
            outcome = Some(DeliveryOutcome::Delivered(tier));
        }

        if outcome.is_none()
            && primary_tier.is_some()
            && !attempted.contains(&Tier::BackgroundRouted)
            && self
                .attempt(Tier::BackgroundRouted, &notification, &mut attempted)
                .await
        {
            outcome = Some(DeliveryOutcome::FallbackDelivered(Tier::BackgroundRouted));
        }

        if plan.augment_with_push
            && !attempted.contains(&Tier::CloudPush)
            && self
                .attempt(Tier::CloudPush, &notification, &mut attempted)
                .await
            && outcome.is_none()
        {
            outcome = Some(DeliveryOutcome::FallbackDelivered(Tier::CloudPush));
        }

        // Task alarms always get the sensory tier on top; ad-hoc messages only as last resort.
        let wants_sensory = outcome.is_none() || matches!(request, DeliveryRequest::Task(_));
        if wants_sensory {
            attempted.push(Tier::Sensory);
            let perceived = self.deliver_sensory(&request);
            if outcome.is_none() && perceived {
                outcome = Some(if primary_tier.is_none() {
                    DeliveryOutcome::Delivered(Tier::Sensory)
                } else {
                    DeliveryOutcome::FallbackDelivered(Tier::Sensory)
                });
            }
        }

        let outcome = outcome.unwrap_or(DeliveryOutcome::FailedSilently);
        match outcome {
            DeliveryOutcome::FailedSilently => {
                warn!(tag = %notification.tag, ?attempted, "every delivery tier failed")
            }
            _ => info!(tag = %notification.tag, ?outcome, ?attempted, "notification delivered"),
        }

        DeliveryReport {
            plan,
            outcome,
            attempted,
        }
    }

    async fn attempt(
        &self,
        tier: Tier,
        notification: &RenderedNotification,
        attempted: &mut Vec<Tier>,
    ) -> bool {
        let result = match tier {
            Tier::Local => match self.local.as_ref() {
                Some(local) => Some(local.show(notification).await),
                None => None,
            },
            Tier::BackgroundRouted => match self.background.as_ref() {
                Some(background) => Some(background.show_via_background(notification).await),
                None => None,
            },
            Tier::CloudPush => match self.push.as_ref() {
                Some(push) => Some(push.push(notification).await),
                None => None,
            },
            Tier::Sensory => None,
        };

        match result {
            None => {
                debug!(?tier, "delivery tier not configured");
                false
            }
            Some(Ok(())) => {
                attempted.push(tier);
                true
            }
            Some(Err(err)) => {
                attempted.push(tier);
                warn!(?tier, error = %err, tag = %notification.tag, "delivery tier failed");
                false
            }
        }
    }

    fn deliver_sensory(&self, request: &DeliveryRequest) -> bool {
        match request {
            DeliveryRequest::Task(task) => self.sensory.show_task_due(task),
            DeliveryRequest::Adhoc { title, body } => self.sensory.show_full(
                title,
                body,
                PopupOptions {
                    style: PopupStyle::Info,
                    ..PopupOptions::default()
                },
            ),
            DeliveryRequest::Notification(notification) => self.sensory.show_full(
                &notification.title,
                &notification.body,
                PopupOptions {
                    style: PopupStyle::Warning,
                    ..PopupOptions::default()
                },
            ),
        }
    }
}

#[async_trait]
impl AlarmHandler for Dispatcher {
    async fn on_alarm(&self, task: Task) {
        self.deliver(DeliveryRequest::Task(task)).await;
    }
}
