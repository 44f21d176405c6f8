use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capability::NotificationPermission;
use crate::notification::DEFAULT_URL;

const MIN_CHECK_INTERVAL_SECS: u64 = 60;
const MAX_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60 * 60;
const MIN_SNOOZE_MINUTES: u64 = 1;
const MAX_SNOOZE_MINUTES: u64 = 120;
const DEFAULT_SNOOZE_MINUTES: u64 = 5;
const MIN_POPUP_DURATION_MS: u64 = 1_000;
const MAX_POPUP_DURATION_MS: u64 = 60_000;
const DEFAULT_POPUP_DURATION_MS: u64 = 10_000;
const MIN_READY_TIMEOUT_MS: u64 = 100;
const MAX_READY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 2_000;
const MAX_MORNING_SUMMARY_HOUR: u32 = 23;
const DEFAULT_MORNING_SUMMARY_HOUR: u32 = 9;
const DEFAULT_PERMISSION: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub check_interval_secs: u64,
    pub snooze_minutes: u64,
    pub popup_duration_ms: u64,
    pub ready_timeout_ms: u64,
    pub sound_enabled: bool,
    pub vibration_enabled: bool,
    pub morning_summary: bool,
    pub morning_summary_hour: u32,
    pub notification_permission: String,
    pub user_agent: String,
    pub touch: bool,
    pub standalone: bool,
    pub app_url: String,
    pub push_public_key: String,
    pub push_gateway_url: String,
    pub push_registry_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            snooze_minutes: DEFAULT_SNOOZE_MINUTES,
            popup_duration_ms: DEFAULT_POPUP_DURATION_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            sound_enabled: true,
            vibration_enabled: true,
            morning_summary: true,
            morning_summary_hour: DEFAULT_MORNING_SUMMARY_HOUR,
            notification_permission: DEFAULT_PERMISSION.to_string(),
            user_agent: String::new(),
            touch: false,
            standalone: false,
            app_url: DEFAULT_URL.to_string(),
            push_public_key: String::new(),
            push_gateway_url: String::new(),
            push_registry_url: String::new(),
        }
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("due-notify");
        path.push("settings.toml");
        Some(path)
    }

    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(mut settings) => {
                    settings.validate();
                    settings
                }
                Err(error) => {
                    warn!(
                        "failed to parse settings config '{}': {}",
                        path.display(),
                        error
                    );
                    Self::default()
                }
            },
            Err(error) => {
                warn!(
                    "failed to read settings config '{}': {}",
                    path.display(),
                    error
                );
                Self::default()
            }
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path().ok_or_else(|| anyhow!("unable to determine config path"))?;
        self.save_to_path(&path)
    }

    pub fn save_to_path(&self, path: &Path) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("invalid settings config path"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory '{}'", parent.display()))?;

        let mut validated = self.clone();
        validated.validate();
        let contents =
            toml::to_string_pretty(&validated).context("failed to serialize settings to TOML")?;

        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("invalid settings config file name"))?
            .to_string_lossy()
            .to_string();
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&tmp_path, contents).with_context(|| {
            format!(
                "failed to write temporary settings file '{}'",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "failed to atomically rename settings file '{}' to '{}'",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }

    fn validate(&mut self) {
        self.check_interval_secs = self
            .check_interval_secs
            .clamp(MIN_CHECK_INTERVAL_SECS, MAX_CHECK_INTERVAL_SECS);
        self.snooze_minutes = self
            .snooze_minutes
            .clamp(MIN_SNOOZE_MINUTES, MAX_SNOOZE_MINUTES);
        self.popup_duration_ms = self
            .popup_duration_ms
            .clamp(MIN_POPUP_DURATION_MS, MAX_POPUP_DURATION_MS);
        self.ready_timeout_ms = self
            .ready_timeout_ms
            .clamp(MIN_READY_TIMEOUT_MS, MAX_READY_TIMEOUT_MS);
        self.morning_summary_hour = self.morning_summary_hour.min(MAX_MORNING_SUMMARY_HOUR);

        self.notification_permission =
            match NotificationPermission::from_str(&self.notification_permission) {
                Ok(permission) => permission.as_str().to_string(),
                Err(()) => {
                    warn!(
                        "invalid notification_permission '{}' in settings config; falling back to {}",
                        self.notification_permission, DEFAULT_PERMISSION
                    );
                    DEFAULT_PERMISSION.to_string()
                }
            };

        if self.app_url.trim().is_empty() {
            self.app_url = DEFAULT_URL.to_string();
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn snooze(&self) -> Duration {
        Duration::from_secs(self.snooze_minutes * 60)
    }

    pub fn popup_duration(&self) -> Duration {
        Duration::from_millis(self.popup_duration_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Local hour of the daily summary, if enabled.
    pub fn morning_summary_hour(&self) -> Option<u32> {
        self.morning_summary
            .then_some(self.morning_summary_hour.min(MAX_MORNING_SUMMARY_HOUR))
    }

    pub fn permission(&self) -> NotificationPermission {
        NotificationPermission::from_str(&self.notification_permission).unwrap_or_default()
    }

    pub fn push_gateway_url(&self) -> Option<&str> {
        non_empty(&self.push_gateway_url)
    }

    pub fn push_registry_url(&self) -> Option<&str> {
        non_empty(&self.push_registry_url)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings_file_path(temp_dir: &TempDir) -> PathBuf {
        temp_dir.path().join("due-notify").join("settings.toml")
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.check_interval(), Duration::from_secs(3_600));
        assert_eq!(settings.snooze(), Duration::from_secs(300));
        assert_eq!(settings.popup_duration(), Duration::from_secs(10));
        assert_eq!(settings.ready_timeout(), Duration::from_secs(2));
        assert_eq!(settings.permission(), NotificationPermission::Default);
        assert_eq!(settings.app_url, "/");
        assert!(settings.push_gateway_url().is_none());
        assert_eq!(settings.morning_summary_hour(), Some(9));
    }

    #[test]
    fn test_morning_summary_hour_is_clamped_or_disabled() {
        let mut settings = Settings {
            morning_summary_hour: 31,
            ..Settings::default()
        };
        settings.validate();
        assert_eq!(settings.morning_summary_hour, MAX_MORNING_SUMMARY_HOUR);

        settings.morning_summary = false;
        assert_eq!(settings.morning_summary_hour(), None);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load_from_path(&settings_file_path(&temp_dir));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_malformed_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = settings_file_path(&temp_dir);
        fs::create_dir_all(path.parent().expect("settings path should have parent"))
            .expect("failed to create config dir");
        fs::write(&path, "snooze_minutes = 10\ncheck_interval_secs = [invalid")
            .expect("failed to write malformed settings");

        let settings = Settings::load_from_path(&path);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_partial_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = settings_file_path(&temp_dir);
        fs::create_dir_all(path.parent().expect("settings path should have parent"))
            .expect("failed to create config dir");
        fs::write(
            &path,
            "snooze_minutes = 10\nuser_agent = \"Mozilla/5.0 (iPhone)\"\npush_gateway_url = \" http://push.test \"",
        )
        .expect("failed to write partial settings");

        let settings = Settings::load_from_path(&path);
        assert_eq!(settings.snooze_minutes, 10);
        assert_eq!(settings.user_agent, "Mozilla/5.0 (iPhone)");
        assert_eq!(settings.push_gateway_url(), Some("http://push.test"));
        assert_eq!(settings.check_interval_secs, DEFAULT_CHECK_INTERVAL_SECS);
        assert!(settings.sound_enabled);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = settings_file_path(&temp_dir);
        let expected = Settings {
            check_interval_secs: 900,
            snooze_minutes: 15,
            sound_enabled: false,
            notification_permission: "granted".to_string(),
            standalone: true,
            push_public_key: "BPk".to_string(),
            ..Settings::default()
        };

        expected
            .save_to_path(&path)
            .expect("failed to save settings for roundtrip test");
        let loaded = Settings::load_from_path(&path);

        assert_eq!(loaded, expected);
        assert!(path.exists());
        assert_eq!(
            fs::read_dir(path.parent().unwrap())
                .unwrap()
                .filter_map(Result::ok)
                .count(),
            1
        );
    }

    #[test]
    fn test_validate_clamps_values() {
        let mut settings = Settings {
            check_interval_secs: 1,
            snooze_minutes: 0,
            popup_duration_ms: u64::MAX,
            ready_timeout_ms: 0,
            ..Settings::default()
        };

        settings.validate();

        assert_eq!(settings.check_interval_secs, MIN_CHECK_INTERVAL_SECS);
        assert_eq!(settings.snooze_minutes, MIN_SNOOZE_MINUTES);
        assert_eq!(settings.popup_duration_ms, MAX_POPUP_DURATION_MS);
        assert_eq!(settings.ready_timeout_ms, MIN_READY_TIMEOUT_MS);

        settings.check_interval_secs = u64::MAX;
        settings.snooze_minutes = u64::MAX;
        settings.validate();

        assert_eq!(settings.check_interval_secs, MAX_CHECK_INTERVAL_SECS);
        assert_eq!(settings.snooze_minutes, MAX_SNOOZE_MINUTES);
    }

    #[test]
    fn test_validate_permission() {
        let mut settings = Settings {
            notification_permission: "PROMPT".to_string(),
            app_url: "  ".to_string(),
            ..Settings::default()
        };
        settings.validate();
        assert_eq!(settings.notification_permission, "default");
        assert_eq!(settings.app_url, "/");

        settings.notification_permission = "maybe".to_string();
        settings.validate();
        assert_eq!(settings.permission(), NotificationPermission::Default);

        settings.notification_permission = "Denied".to_string();
        settings.validate();
        assert_eq!(settings.permission(), NotificationPermission::Denied);
    }
}
