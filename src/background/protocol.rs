//! Messages exchanged between the foreground and the background context.
//!
//! Wire form is `{ "type": "...", "data": ... }`. Decoding is strict about the type
//! tag and lenient about individual tasks inside a snapshot.

use serde::Serialize;
use serde_json::Value;

use crate::error::{NotifyError, NotifyResult};
use crate::notification::{NotificationData, PushPayload, RenderedNotification};
use crate::types::{Task, TaskId, tasks_from_json};

pub const START_BACKGROUND_CHECK: &str = "START_BACKGROUND_CHECK";
pub const UPDATE_TASKS_CACHE: &str = "UPDATE_TASKS_CACHE";
pub const IMMEDIATE_TASK_CHECK: &str = "IMMEDIATE_TASK_CHECK";
pub const SHOW_NOTIFICATION: &str = "SHOW_NOTIFICATION";
pub const PUSH_RECEIVED: &str = "PUSH_RECEIVED";
pub const NOTIFICATION_CLICK: &str = "NOTIFICATION_CLICK";

/// Inbound messages of the background context.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackgroundMessage {
    StartBackgroundCheck,
    UpdateTasksCache {
        tasks: Vec<Task>,
    },
    ImmediateTaskCheck,
    ShowNotification {
        notification: RenderedNotification,
    },
    PushReceived {
        payload: PushPayload,
    },
    NotificationClick {
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        data: NotificationData,
    },
}

impl BackgroundMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StartBackgroundCheck => START_BACKGROUND_CHECK,
            Self::UpdateTasksCache { .. } => UPDATE_TASKS_CACHE,
            Self::ImmediateTaskCheck => IMMEDIATE_TASK_CHECK,
            Self::ShowNotification { .. } => SHOW_NOTIFICATION,
            Self::PushReceived { .. } => PUSH_RECEIVED,
            Self::NotificationClick { .. } => NOTIFICATION_CLICK,
        }
    }

    pub fn encode(&self) -> NotifyResult<String> {
        serde_json::to_string(self)
            .map_err(|err| NotifyError::Protocol(format!("failed to encode message: {err}")))
    }

    pub fn decode(raw: &str) -> NotifyResult<Self> {
        let value = serde_json::from_str::<Value>(raw)
            .map_err(|err| NotifyError::Protocol(format!("message is not JSON: {err}")))?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: Value) -> NotifyResult<Self> {
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| NotifyError::Protocol("message has no type".to_string()))?
            .to_string();
        let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);

        match message_type.as_str() {
            START_BACKGROUND_CHECK => Ok(Self::StartBackgroundCheck),
            IMMEDIATE_TASK_CHECK => Ok(Self::ImmediateTaskCheck),
            UPDATE_TASKS_CACHE => {
                let mut data = data;
                let tasks = data
                    .get_mut("tasks")
                    .map(Value::take)
                    .ok_or_else(|| field_missing(UPDATE_TASKS_CACHE, "tasks"))?;
                Ok(Self::UpdateTasksCache {
                    tasks: tasks_from_json(tasks),
                })
            }
            SHOW_NOTIFICATION => {
                let notification = data
                    .get("notification")
                    .cloned()
                    .ok_or_else(|| field_missing(SHOW_NOTIFICATION, "notification"))?;
                let notification = serde_json::from_value(notification).map_err(|err| {
                    NotifyError::Protocol(format!("{SHOW_NOTIFICATION}: {err}"))
                })?;
                Ok(Self::ShowNotification { notification })
            }
            PUSH_RECEIVED => {
                let payload = data.get("payload").cloned().unwrap_or(Value::Null);
                let payload = if payload.is_null() {
                    PushPayload::default()
                } else {
                    serde_json::from_value(payload)
                        .map_err(|err| NotifyError::Protocol(format!("{PUSH_RECEIVED}: {err}")))?
                };
                Ok(Self::PushReceived { payload })
            }
            NOTIFICATION_CLICK => {
                let action = data
                    .get("action")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let tag = data.get("tag").and_then(Value::as_str).map(str::to_string);
                let data = data
                    .get("data")
                    .cloned()
                    .ok_or_else(|| field_missing(NOTIFICATION_CLICK, "data"))?;
                let data = serde_json::from_value(data).map_err(|err| {
                    NotifyError::Protocol(format!("{NOTIFICATION_CLICK}: {err}"))
                })?;
                Ok(Self::NotificationClick { action, tag, data })
            }
            other => Err(NotifyError::Protocol(format!(
                "unknown message type '{other}'"
            ))),
        }
    }
}

fn field_missing(message_type: &str, field: &str) -> NotifyError {
    NotifyError::Protocol(format!("{message_type} is missing data.{field}"))
}

/// Events the background context reports back to the foreground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackgroundEvent {
    Ready,
    CheckCompleted {
        overdue: Vec<TaskId>,
        due_today: Vec<TaskId>,
    },
    Rendered {
        tag: String,
    },
    Clicked {
        action: String,
        task_id: Option<TaskId>,
    },
}
