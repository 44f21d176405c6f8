//! Recording fakes for the delivery seams, shared by unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::capability::{CapabilityProbe, CapabilitySnapshot};
use crate::delivery::sensory::{Popup, SensorySurface, Tone};
use crate::delivery::{BackgroundRoute, PushTier};
use crate::error::{NotifyError, NotifyResult};
use crate::notification::{NotificationSurface, RenderedNotification};

pub struct FixedProbe(pub CapabilitySnapshot);

impl CapabilityProbe for FixedProbe {
    fn snapshot(&self) -> CapabilitySnapshot {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Behavior {
    #[default]
    Accept,
    Fail,
    Hang,
}

#[derive(Default)]
pub struct RecordingSurface {
    behavior: Behavior,
    shown: Mutex<Vec<RenderedNotification>>,
    closed: Mutex<Vec<String>>,
}

impl RecordingSurface {
    pub fn failing() -> Self {
        Self {
            behavior: Behavior::Fail,
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            behavior: Behavior::Hang,
            ..Self::default()
        }
    }

    pub fn notifications(&self) -> Vec<RenderedNotification> {
        self.shown.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .map(|notification| notification.title)
            .collect()
    }
}

#[async_trait]
impl NotificationSurface for RecordingSurface {
    async fn show(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        match self.behavior {
            Behavior::Accept => {
                self.shown.lock().unwrap().push(notification.clone());
                Ok(())
            }
            Behavior::Fail => Err(NotifyError::RenderFailure("surface refused".into())),
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn close(&self, tag: &str) {
        self.closed.lock().unwrap().push(tag.to_string());
    }
}

#[derive(Default)]
pub struct RecordingRoute {
    behavior: Behavior,
    received: Mutex<Vec<RenderedNotification>>,
}

impl RecordingRoute {
    pub fn failing() -> Self {
        Self {
            behavior: Behavior::Fail,
            ..Self::default()
        }
    }

    pub fn notifications(&self) -> Vec<RenderedNotification> {
        self.received.lock().unwrap().clone()
    }

    fn record(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        match self.behavior {
            Behavior::Accept | Behavior::Hang => {
                self.received.lock().unwrap().push(notification.clone());
                Ok(())
            }
            Behavior::Fail => Err(NotifyError::ChannelUnsupported("route unavailable".into())),
        }
    }
}

#[async_trait]
impl BackgroundRoute for RecordingRoute {
    async fn show_via_background(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        self.record(notification)
    }
}

#[async_trait]
impl PushTier for RecordingRoute {
    async fn push(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        self.record(notification)
    }
}

#[derive(Default)]
pub struct RecordingSensory {
    fail_popups: bool,
    tones: Mutex<usize>,
    vibrations: Mutex<Vec<Vec<u64>>>,
    popups: Mutex<Vec<Popup>>,
    closed: Mutex<Vec<u64>>,
}

impl RecordingSensory {
    pub fn failing_popups() -> Self {
        Self {
            fail_popups: true,
            ..Self::default()
        }
    }

    pub fn tones(&self) -> usize {
        *self.tones.lock().unwrap()
    }

    pub fn vibrations(&self) -> Vec<Vec<u64>> {
        self.vibrations.lock().unwrap().clone()
    }

    pub fn popups(&self) -> Vec<Popup> {
        self.popups.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<u64> {
        self.closed.lock().unwrap().clone()
    }
}

impl SensorySurface for RecordingSensory {
    fn play_tone(&self, _tone: &Tone) -> NotifyResult<()> {
        *self.tones.lock().unwrap() += 1;
        Ok(())
    }

    fn vibrate(&self, pattern: &[u64]) -> NotifyResult<()> {
        self.vibrations.lock().unwrap().push(pattern.to_vec());
        Ok(())
    }

    fn show_popup(&self, popup: &Popup) -> NotifyResult<()> {
        if self.fail_popups {
            return Err(NotifyError::RenderFailure("no overlay".into()));
        }
        self.popups.lock().unwrap().push(popup.clone());
        Ok(())
    }

    fn close_popup(&self, popup_id: u64) {
        self.closed.lock().unwrap().push(popup_id);
    }
}
