//! Runtime capability detection and delivery tier selection.

use std::str::FromStr;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

static MOBILE_USER_AGENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)android|iphone|ipad|ipod|blackberry|iemobile|opera mini")
        .expect("mobile user agent pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    #[default]
    Default,
    Granted,
    Denied,
    Unsupported,
}

impl NotificationPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

impl FromStr for NotificationPermission {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "prompt" => Ok(Self::Default),
            "granted" => Ok(Self::Granted),
            "denied" => Ok(Self::Denied),
            "unsupported" => Ok(Self::Unsupported),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilitySnapshot {
    pub is_touch_or_mobile: bool,
    pub notification_permission: NotificationPermission,
    pub has_background_context: bool,
    pub has_push_channel: bool,
    pub is_standalone: bool,
}

/// Primary delivery route for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStrategy {
    /// Raise the notification directly from the foreground context.
    Local,
    /// Hand the notification to the background context to raise.
    BackgroundRouted,
    /// Only the cloud push channel can raise a system notification.
    PushOnly,
    /// No system notification is possible; use sound, vibration and popup.
    SensoryOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierPlan {
    pub primary: DeliveryStrategy,
    pub augment_with_push: bool,
}

impl CapabilitySnapshot {
    pub fn push_eligible(&self) -> bool {
        self.notification_permission.is_granted() && self.is_standalone && self.has_push_channel
    }

    pub fn strategy(&self) -> DeliveryStrategy {
        if !self.notification_permission.is_granted() {
            return DeliveryStrategy::SensoryOnly;
        }

        if self.is_touch_or_mobile {
            if self.has_background_context {
                return DeliveryStrategy::BackgroundRouted;
            }
            if self.push_eligible() {
                return DeliveryStrategy::PushOnly;
            }
        }

        DeliveryStrategy::Local
    }

    pub fn plan(&self) -> TierPlan {
        let primary = self.strategy();
        TierPlan {
            primary,
            augment_with_push: self.push_eligible() && primary != DeliveryStrategy::PushOnly,
        }
    }
}

pub fn is_mobile_user_agent(user_agent: &str) -> bool {
    MOBILE_USER_AGENT.is_match(user_agent)
}

/// Query and request primitive for the platform notification permission.
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    fn query(&self) -> NotificationPermission;
    async fn request(&self) -> NotificationPermission;
}

/// Permission state held in process.
///
/// Desktop notification daemons have no prompt, so a request from the `default` state is
/// answered with `granted`. `denied` and `unsupported` are sticky.
pub struct PermissionState {
    current: RwLock<NotificationPermission>,
}

impl PermissionState {
    pub fn new(initial: NotificationPermission) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn set(&self, permission: NotificationPermission) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = permission;
    }
}

#[async_trait]
impl PermissionBroker for PermissionState {
    fn query(&self) -> NotificationPermission {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn request(&self) -> NotificationPermission {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if *current == NotificationPermission::Default {
            *current = NotificationPermission::Granted;
        }
        *current
    }
}

pub trait CapabilityProbe: Send + Sync {
    fn snapshot(&self) -> CapabilitySnapshot;
}

/// Liveness check for the background execution context.
pub trait BackgroundPresence: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// Probe that reads the host description from configuration plus live collaborators.
pub struct HostProbe {
    user_agent: String,
    touch: bool,
    standalone: bool,
    push_channel: bool,
    permission: Arc<dyn PermissionBroker>,
    background: Option<Arc<dyn BackgroundPresence>>,
}

impl HostProbe {
    pub fn new(user_agent: impl Into<String>, permission: Arc<dyn PermissionBroker>) -> Self {
        Self {
            user_agent: user_agent.into(),
            touch: false,
            standalone: false,
            push_channel: false,
            permission,
            background: None,
        }
    }

    pub fn with_touch(mut self, touch: bool) -> Self {
        self.touch = touch;
        self
    }

    pub fn with_standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }

    pub fn with_push_channel(mut self, available: bool) -> Self {
        self.push_channel = available;
        self
    }

    pub fn with_background(mut self, background: Arc<dyn BackgroundPresence>) -> Self {
        self.background = Some(background);
        self
    }
}

impl CapabilityProbe for HostProbe {
    fn snapshot(&self) -> CapabilitySnapshot {
        let snapshot = CapabilitySnapshot {
            is_touch_or_mobile: self.touch || is_mobile_user_agent(&self.user_agent),
            notification_permission: self.permission.query(),
            has_background_context: self
                .background
                .as_ref()
                .is_some_and(|background| background.is_alive()),
            has_push_channel: self.push_channel,
            is_standalone: self.standalone,
        };
        debug!(?snapshot, "capability snapshot");
        snapshot
    }
}
