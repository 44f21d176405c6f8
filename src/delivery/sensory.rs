//! Permission-free delivery: synthesized tone, vibration and an in-app popup.

use std::collections::HashMap;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::delivery::speaker;
use crate::error::{NotifyError, NotifyResult};
use crate::notification::{ACTION_COMPLETE, ACTION_DISMISS, ACTION_SNOOZE, NotificationAction};
use crate::types::{Task, TaskId};

pub const VIBRATION_PATTERN: [u64; 5] = [200, 100, 200, 100, 200];
pub const TASK_POPUP_DURATION: Duration = Duration::from_secs(10);

/// Two-pitch beep with an exponential fade.
#[derive(Debug, Clone, PartialEq)]
pub struct Tone {
    /// `(start_seconds, frequency_hz)` steps, ascending by start.
    pub steps: Vec<(f32, f32)>,
    pub duration_secs: f32,
    pub start_gain: f32,
    pub end_gain: f32,
}

impl Tone {
    pub fn alert() -> Self {
        Self {
            steps: vec![(0.0, 800.0), (0.2, 1000.0), (0.4, 800.0)],
            duration_secs: 0.6,
            start_gain: 0.3,
            end_gain: 0.01,
        }
    }

    pub fn frequency_at(&self, t: f32) -> f32 {
        self.steps
            .iter()
            .rev()
            .find(|(start, _)| *start <= t)
            .or(self.steps.first())
            .map(|(_, hz)| *hz)
            .unwrap_or(0.0)
    }

    pub fn gain_at(&self, t: f32) -> f32 {
        if self.duration_secs <= 0.0 {
            return 0.0;
        }
        let progress = (t / self.duration_secs).clamp(0.0, 1.0);
        self.start_gain * (self.end_gain / self.start_gain).powf(progress)
    }

    /// Mono PCM samples in `[-1.0, 1.0]`.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let total = (self.duration_secs * sample_rate as f32).round() as usize;
        let mut phase = 0.0_f32;
        let mut samples = Vec::with_capacity(total);
        for index in 0..total {
            let t = index as f32 / sample_rate as f32;
            phase += std::f32::consts::TAU * self.frequency_at(t) / sample_rate as f32;
            if phase > std::f32::consts::TAU {
                phase -= std::f32::consts::TAU;
            }
            samples.push(phase.sin() * self.gain_at(t));
        }
        samples
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PopupStyle {
    Info,
    Success,
    Warning,
    Error,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PopupAction {
    Dismiss,
    Complete,
    Snooze,
}

impl PopupAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dismiss => ACTION_DISMISS,
            Self::Complete => ACTION_COMPLETE,
            Self::Snooze => ACTION_SNOOZE,
        }
    }
}

impl FromStr for PopupAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dismiss" | "close" | "d" => Ok(Self::Dismiss),
            "complete" | "done" | "c" => Ok(Self::Complete),
            "snooze" | "s" => Ok(Self::Snooze),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Popup {
    pub id: u64,
    pub title: String,
    pub message: String,
    pub style: PopupStyle,
    pub actions: Vec<NotificationAction>,
    pub duration: Duration,
    pub task: Option<Task>,
}

#[derive(Debug, Clone)]
pub struct PopupOptions {
    pub style: PopupStyle,
    pub duration: Duration,
    pub actions: Vec<NotificationAction>,
    pub task: Option<Task>,
}

impl Default for PopupOptions {
    fn default() -> Self {
        Self {
            style: PopupStyle::Info,
            duration: Duration::from_secs(5),
            actions: Vec::new(),
            task: None,
        }
    }
}

/// What the user chose on a popup, forwarded to whoever owns the task list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupResolution {
    pub popup_id: u64,
    pub action: PopupAction,
    pub task: Option<Task>,
}

impl PopupResolution {
    pub fn task_id(&self) -> Option<&TaskId> {
        self.task.as_ref().map(|task| &task.id)
    }
}

/// Output device for the sensory tier.
pub trait SensorySurface: Send + Sync {
    fn play_tone(&self, tone: &Tone) -> NotifyResult<()>;
    fn vibrate(&self, pattern: &[u64]) -> NotifyResult<()>;
    fn show_popup(&self, popup: &Popup) -> NotifyResult<()>;
    fn close_popup(&self, popup_id: u64);
}

/// Terminal rendition: the tone on the speaker (bell without one), a framed block on
/// stderr for the popup.
#[derive(Debug, Default)]
pub struct TerminalSurface;

fn ring_bell() {
    let mut stderr = std::io::stderr();
    if let Err(err) = stderr.write_all(b"\x07").and_then(|_| stderr.flush()) {
        warn!(error = %err, "terminal bell failed");
    }
}

impl SensorySurface for TerminalSurface {
    fn play_tone(&self, tone: &Tone) -> NotifyResult<()> {
        speaker::play_detached(tone.clone(), ring_bell)
    }

    fn vibrate(&self, _pattern: &[u64]) -> NotifyResult<()> {
        Err(NotifyError::ChannelUnsupported(
            "terminal has no vibration motor".to_string(),
        ))
    }

    fn show_popup(&self, popup: &Popup) -> NotifyResult<()> {
        let rule = "═".repeat(63);
        let mut lines = vec![
            rule.clone(),
            format!("  [{}] {}", popup.id, popup.title),
            format!("  {}", popup.message),
        ];
        if !popup.actions.is_empty() {
            let actions = popup
                .actions
                .iter()
                .map(|action| format!("{} {} ({})", popup.id, action.action, action.title))
                .collect::<Vec<_>>()
                .join("  |  ");
            lines.push(format!("  {actions}"));
        }
        lines.push(rule);

        let mut stderr = std::io::stderr();
        writeln!(stderr, "\n{}\n", lines.join("\n"))
            .map_err(|err| NotifyError::RenderFailure(format!("popup render failed: {err}")))
    }

    fn close_popup(&self, _popup_id: u64) {}
}

pub struct SensoryDeliverer {
    surface: Arc<dyn SensorySurface>,
    enabled: AtomicBool,
    sound: bool,
    vibration: bool,
    task_popup_duration: Duration,
    next_popup_id: AtomicU64,
    open_popups: Mutex<HashMap<u64, Popup>>,
    resolutions: Option<mpsc::UnboundedSender<PopupResolution>>,
}

impl SensoryDeliverer {
    pub fn new(surface: Arc<dyn SensorySurface>) -> Self {
        Self {
            surface,
            enabled: AtomicBool::new(true),
            sound: true,
            vibration: true,
            task_popup_duration: TASK_POPUP_DURATION,
            next_popup_id: AtomicU64::new(1),
            open_popups: Mutex::new(HashMap::new()),
            resolutions: None,
        }
    }

    pub fn with_sound(mut self, enabled: bool) -> Self {
        self.sound = enabled;
        self
    }

    pub fn with_vibration(mut self, enabled: bool) -> Self {
        self.vibration = enabled;
        self
    }

    pub fn with_task_popup_duration(mut self, duration: Duration) -> Self {
        self.task_popup_duration = duration;
        self
    }

    pub fn with_resolution_sink(mut self, sink: mpsc::UnboundedSender<PopupResolution>) -> Self {
        self.resolutions = Some(sink);
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        debug!(enabled, "sensory notifications toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn popups(&self) -> MutexGuard<'_, HashMap<u64, Popup>> {
        self.open_popups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn play_sound(&self) -> bool {
        if !self.is_enabled() || !self.sound {
            return false;
        }
        match self.surface.play_tone(&Tone::alert()) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "audio alert failed");
                false
            }
        }
    }

    pub fn vibrate(&self) -> bool {
        if !self.is_enabled() || !self.vibration {
            return false;
        }
        match self.surface.vibrate(&VIBRATION_PATTERN) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "vibration unavailable");
                false
            }
        }
    }

    /// Show a popup and arm its auto-close; returns the popup id when shown.
    pub fn show_popup(
        self: &Arc<Self>,
        title: &str,
        message: &str,
        options: PopupOptions,
    ) -> Option<u64> {
        if !self.is_enabled() {
            return None;
        }

        let popup = Popup {
            id: self.next_popup_id.fetch_add(1, Ordering::Relaxed),
            title: title.to_string(),
            message: message.to_string(),
            style: options.style,
            actions: options.actions,
            duration: options.duration,
            task: options.task,
        };

        if let Err(err) = self.surface.show_popup(&popup) {
            warn!(error = %err, title, "popup render failed");
            return None;
        }

        let id = popup.id;
        let duration = popup.duration;
        self.popups().insert(id, popup);
        debug!(popup_id = id, title, "popup shown");

        if !duration.is_zero()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            let weak: Weak<Self> = Arc::downgrade(self);
            runtime.spawn(async move {
                tokio::time::sleep(duration).await;
                if let Some(deliverer) = weak.upgrade() {
                    deliverer.close_popup(id);
                }
            });
        }

        Some(id)
    }

    pub fn close_popup(&self, popup_id: u64) -> bool {
        let removed = self.popups().remove(&popup_id).is_some();
        if removed {
            self.surface.close_popup(popup_id);
        }
        removed
    }

    pub fn close_all(&self) {
        let ids = self.popups().drain().map(|(id, _)| id).collect::<Vec<_>>();
        for id in ids {
            self.surface.close_popup(id);
        }
    }

    pub fn open_popups(&self) -> Vec<u64> {
        let mut ids = self.popups().keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Apply a user choice to an open popup; the popup closes either way.
    pub fn resolve(&self, popup_id: u64, action: PopupAction) -> Option<PopupResolution> {
        let popup = self.popups().remove(&popup_id)?;
        self.surface.close_popup(popup_id);

        let resolution = PopupResolution {
            popup_id,
            action,
            task: popup.task,
        };
        if let Some(sink) = self.resolutions.as_ref()
            && sink.send(resolution.clone()).is_err()
        {
            debug!(popup_id, "popup resolution sink closed");
        }
        Some(resolution)
    }

    /// Sound, vibration and popup together. Returns `true` if anything was perceivable.
    pub fn show_full(self: &Arc<Self>, title: &str, message: &str, options: PopupOptions) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let sounded = self.play_sound();
        let vibrated = self.vibrate();
        let popup = self.show_popup(title, message, options);
        sounded || vibrated || popup.is_some()
    }

    pub fn show_task_due(self: &Arc<Self>, task: &Task) -> bool {
        self.show_full(
            "Task due",
            &format!("\"{}\" is due now", task.text),
            PopupOptions {
                style: PopupStyle::Task,
                duration: self.task_popup_duration,
                actions: vec![
                    NotificationAction::complete(),
                    NotificationAction::snooze(),
                    NotificationAction::dismiss(),
                ],
                task: Some(task.clone()),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSensory;
    use chrono::Utc;

    fn deliverer(surface: Arc<RecordingSensory>) -> Arc<SensoryDeliverer> {
        Arc::new(SensoryDeliverer::new(surface))
    }

    #[test]
    fn test_tone_shape() {
        let tone = Tone::alert();
        assert_eq!(tone.frequency_at(0.0), 800.0);
        assert_eq!(tone.frequency_at(0.25), 1000.0);
        assert_eq!(tone.frequency_at(0.5), 800.0);
        assert!((tone.gain_at(0.0) - 0.3).abs() < 1e-6);
        assert!((tone.gain_at(0.6) - 0.01).abs() < 1e-6);

        let samples = tone.render(8_000);
        assert_eq!(samples.len(), 4_800);
        assert!(samples.iter().all(|sample| sample.abs() <= 0.3 + 1e-6));
    }

    #[test]
    fn test_popup_action_from_str() {
        assert_eq!(PopupAction::from_str("Complete"), Ok(PopupAction::Complete));
        assert_eq!(PopupAction::from_str("s"), Ok(PopupAction::Snooze));
        assert_eq!(PopupAction::from_str("close"), Ok(PopupAction::Dismiss));
        assert!(PopupAction::from_str("later").is_err());
    }

    #[test]
    fn test_full_notification_uses_every_channel() {
        let surface = Arc::new(RecordingSensory::default());
        let sensory = deliverer(surface.clone());
        let task = Task::new("t1", "water plants", Utc::now());

        assert!(sensory.show_task_due(&task));
        assert_eq!(surface.tones(), 1);
        assert_eq!(surface.vibrations(), vec![VIBRATION_PATTERN.to_vec()]);
        let popups = surface.popups();
        assert_eq!(popups.len(), 1);
        assert_eq!(popups[0].style, PopupStyle::Task);
        assert_eq!(popups[0].task.as_ref().map(|t| t.id.as_str()), Some("t1"));
        assert_eq!(sensory.open_popups(), vec![popups[0].id]);
    }

    #[test]
    fn test_disabled_deliverer_is_silent() {
        let surface = Arc::new(RecordingSensory::default());
        let sensory = deliverer(surface.clone());
        sensory.set_enabled(false);

        assert!(!sensory.show_full("t", "m", PopupOptions::default()));
        assert_eq!(surface.tones(), 0);
        assert!(surface.popups().is_empty());
    }

    #[test]
    fn test_failed_popup_still_counts_sound() {
        let surface = Arc::new(RecordingSensory::failing_popups());
        let sensory = deliverer(surface.clone());

        assert!(sensory.show_full("t", "m", PopupOptions::default()));
        assert!(sensory.open_popups().is_empty());
    }

    #[test]
    fn test_resolve_forwards_choice_and_closes() {
        let surface = Arc::new(RecordingSensory::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sensory = Arc::new(SensoryDeliverer::new(surface.clone()).with_resolution_sink(tx));
        let task = Task::new("t9", "call back", Utc::now());
        sensory.show_task_due(&task);
        let id = sensory.open_popups()[0];

        let resolution = sensory.resolve(id, PopupAction::Snooze).expect("popup is open");
        assert_eq!(resolution.task_id().map(String::as_str), Some("t9"));
        assert_eq!(rx.try_recv().expect("resolution forwarded"), resolution);
        assert!(sensory.open_popups().is_empty());
        assert_eq!(surface.closed(), vec![id]);
        assert!(sensory.resolve(id, PopupAction::Dismiss).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_popup_auto_closes_after_duration() {
        let surface = Arc::new(RecordingSensory::default());
        let sensory = deliverer(surface);
        let id = sensory
            .show_popup(
                "hello",
                "world",
                PopupOptions {
                    duration: Duration::from_secs(5),
                    ..PopupOptions::default()
                },
            )
            .expect("popup shown");

        tokio::time::advance(Duration::from_secs(6)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!sensory.open_popups().contains(&id));
    }
}
