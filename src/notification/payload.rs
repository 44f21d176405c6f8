//! Cloud push payload decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    DEFAULT_ICON, DEFAULT_PUSH_BODY, DEFAULT_PUSH_TITLE, NotificationAction, NotificationData,
    NotificationKind, RenderedNotification, task_tag,
};
use crate::error::{NotifyError, NotifyResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<PushNotificationFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PushDataFields>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotificationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Data block of a push; values stay strings because push services flatten them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushDataFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl PushPayload {
    pub fn decode(raw: &str) -> NotifyResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| NotifyError::Protocol(format!("malformed push payload: {err}")))
    }

    pub fn from_rendered(notification: &RenderedNotification) -> Self {
        Self {
            notification: Some(PushNotificationFields {
                title: Some(notification.title.clone()),
                body: Some(notification.body.clone()),
                icon: Some(notification.icon.clone()),
                badge: Some(notification.badge.clone()),
                tag: Some(notification.tag.clone()),
            }),
            data: Some(PushDataFields {
                task_id: notification.data.task_id.clone(),
                kind: Some(notification.data.kind.as_str().to_string()),
                due_date: notification.data.due_date.map(|due| due.to_rfc3339()),
            }),
        }
    }

    /// Render with defaults for every missing field.
    pub fn render(&self, url: &str) -> RenderedNotification {
        let fields = self.notification.clone().unwrap_or_default();
        let data = self.data.clone().unwrap_or_default();
        let task_id = non_empty(data.task_id.as_ref());

        let tag = non_empty(fields.tag.as_ref()).unwrap_or_else(|| match task_id.as_deref() {
            Some(id) => task_tag(id),
            None => "task-notification".to_string(),
        });
        let kind = data
            .kind
            .as_deref()
            .and_then(|kind| kind.parse::<NotificationKind>().ok())
            .unwrap_or(NotificationKind::Push);
        let due_date = data
            .due_date
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|due| due.with_timezone(&Utc));

        RenderedNotification {
            title: non_empty(fields.title.as_ref()).unwrap_or_else(|| DEFAULT_PUSH_TITLE.into()),
            body: non_empty(fields.body.as_ref()).unwrap_or_else(|| DEFAULT_PUSH_BODY.into()),
            icon: non_empty(fields.icon.as_ref()).unwrap_or_else(|| DEFAULT_ICON.into()),
            badge: non_empty(fields.badge.as_ref()).unwrap_or_else(|| DEFAULT_ICON.into()),
            tag,
            data: NotificationData {
                task_id,
                kind,
                due_date,
                url: url.to_string(),
            },
            actions: vec![NotificationAction::open(), NotificationAction::dismiss()],
            require_interaction: true,
            vibrate: super::DEFAULT_VIBRATE.to_vec(),
        }
    }
}
