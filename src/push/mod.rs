//! Cloud push opt-in and the push delivery tier.
//!
//! A device subscribes by asking the push channel for a token bound to the configured
//! application key. The token and a stable device id live in a small local state file;
//! the subscription record is also forwarded to an optional remote registry.

pub mod http;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{BackgroundPresence, NotificationPermission, PermissionBroker};
use crate::delivery::{BackgroundRoute, PushTier};
use crate::error::{NotifyError, NotifyResult, OperationResult};
use crate::notification::{DEFAULT_URL, PushPayload, RenderedNotification};
use crate::persist::{load_json, store_json};

pub use http::{HttpPushChannel, HttpSubscriptionRegistry};

/// Uncompressed P-256 point: 0x04 followed by two 32 byte coordinates.
const PUBLIC_KEY_LEN: usize = 65;
const STATE_FILE_NAME: &str = "push-state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub device_id: String,
    pub token: String,
    pub user_agent: String,
    pub platform: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(rename = "isActive")]
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PushState {
    pub device_id: Option<String>,
    pub token: Option<String>,
    pub subscription: Option<PushSubscription>,
}

#[derive(Debug, Clone)]
pub struct PushStateStore {
    path: Option<PathBuf>,
}

impl PushStateStore {
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::data_local_dir()?;
        path.push("due-notify");
        path.push(STATE_FILE_NAME);
        Some(path)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> PushState {
        self.path
            .as_deref()
            .and_then(|path| load_json(path, "push state"))
            .unwrap_or_default()
    }

    pub fn store(&self, state: &PushState) -> NotifyResult<()> {
        match self.path.as_deref() {
            Some(path) => store_json(path, state, "push state"),
            None => Ok(()),
        }
    }
}

/// Issues subscription tokens for this device.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn register(&self, application_key: &[u8], device_id: &str) -> NotifyResult<String>;
}

/// Remote record of which devices are subscribed.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    async fn save(&self, subscription: &PushSubscription) -> NotifyResult<()>;
    async fn deactivate(&self, device_id: &str) -> NotifyResult<()>;
}

/// Asks the cloud service to push a payload to a subscription token.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, token: &str, payload: &PushPayload) -> NotifyResult<()>;
}

/// Decode a base64url application server key.
pub fn decode_public_key(encoded: &str) -> NotifyResult<Vec<u8>> {
    let trimmed = encoded.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|err| NotifyError::SubscriptionFailure(format!("invalid public key: {err}")))?;
    if bytes.len() != PUBLIC_KEY_LEN || bytes[0] != 0x04 {
        return Err(NotifyError::SubscriptionFailure(format!(
            "public key must be a {PUBLIC_KEY_LEN} byte uncompressed point, got {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushDebugInfo {
    pub initialized: bool,
    pub has_token: bool,
    pub is_subscribed: bool,
    pub channel_supported: bool,
    pub background_alive: bool,
    pub notification_permission: NotificationPermission,
    pub device_id: Option<String>,
    pub state_path: Option<PathBuf>,
}

pub struct PushService {
    permission: Arc<dyn PermissionBroker>,
    store: PushStateStore,
    state: Mutex<PushState>,
    channel: Option<Arc<dyn PushChannel>>,
    registry: Option<Arc<dyn SubscriptionRegistry>>,
    gateway: Option<Arc<dyn PushGateway>>,
    background: Option<Arc<dyn BackgroundPresence>>,
    renderer: Option<Arc<dyn BackgroundRoute>>,
    public_key: Option<String>,
    user_agent: String,
    url: String,
}

impl PushService {
    pub fn new(permission: Arc<dyn PermissionBroker>, store: PushStateStore) -> Self {
        let state = store.load();
        Self {
            permission,
            store,
            state: Mutex::new(state),
            channel: None,
            registry: None,
            gateway: None,
            background: None,
            renderer: None,
            public_key: None,
            user_agent: String::new(),
            url: DEFAULT_URL.to_string(),
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn PushChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn SubscriptionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PushGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Subscriptions are bound to a running background context when one is given.
    pub fn with_background(mut self, background: Arc<dyn BackgroundPresence>) -> Self {
        self.background = Some(background);
        self
    }

    /// Render path used by [`PushService::send_test`].
    pub fn with_renderer(mut self, renderer: Arc<dyn BackgroundRoute>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        let public_key = public_key.into();
        self.public_key = (!public_key.trim().is_empty()).then_some(public_key);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PushState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token(&self) -> Option<String> {
        self.state().token.clone()
    }

    pub fn subscription(&self) -> Option<PushSubscription> {
        self.state().subscription.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state().token.is_some()
    }

    /// Stable id of this device, created and persisted on first use.
    pub fn device_id(&self) -> NotifyResult<String> {
        let mut state = self.state();
        if let Some(device_id) = state.device_id.as_ref() {
            return Ok(device_id.clone());
        }
        let device_id = format!("device_{}", Uuid::new_v4().simple());
        state.device_id = Some(device_id.clone());
        self.store.store(&state)?;
        debug!(device_id = %device_id, "created device id");
        Ok(device_id)
    }

    pub async fn subscribe(&self) -> OperationResult {
        match self.try_subscribe().await {
            Ok(token) => {
                info!("push subscription created");
                OperationResult::ok_with_token(token)
            }
            Err(err) => {
                warn!(error = %err, "push subscription failed");
                OperationResult::failed(&err)
            }
        }
    }

    async fn try_subscribe(&self) -> NotifyResult<String> {
        let channel = self.channel.as_ref().ok_or_else(|| {
            NotifyError::ChannelUnsupported("no push channel is configured".into())
        })?;
        if let Some(background) = self.background.as_ref()
            && !background.is_alive()
        {
            return Err(NotifyError::ChannelUnsupported(
                "background context is not running".into(),
            ));
        }

        let mut permission = self.permission.query();
        if permission == NotificationPermission::Default {
            permission = self.permission.request().await;
        }
        if !permission.is_granted() {
            return Err(NotifyError::PermissionDenied(format!(
                "notification permission is {}",
                permission.as_str()
            )));
        }

        let public_key = self.public_key.as_deref().ok_or_else(|| {
            NotifyError::SubscriptionFailure("no push public key is configured".into())
        })?;
        let application_key = decode_public_key(public_key)?;
        let device_id = self.device_id()?;

        let token = channel.register(&application_key, &device_id).await?;
        if token.trim().is_empty() {
            return Err(NotifyError::SubscriptionFailure(
                "push channel returned an empty token".into(),
            ));
        }

        let now = Utc::now();
        let subscription = PushSubscription {
            device_id,
            token: token.clone(),
            user_agent: self.user_agent.clone(),
            platform: std::env::consts::OS.to_string(),
            created_at: now,
            last_used: now,
            active: true,
        };
        {
            let mut state = self.state();
            state.token = Some(token.clone());
            state.subscription = Some(subscription.clone());
            self.store.store(&state)?;
        }

        if let Some(registry) = self.registry.as_ref()
            && let Err(err) = registry.save(&subscription).await
        {
            warn!(error = %err, "failed to record push subscription remotely");
        }
        Ok(token)
    }

    pub async fn unsubscribe(&self) -> OperationResult {
        let device_id = {
            let mut state = self.state();
            let had_token = state.token.take().is_some();
            if let Some(subscription) = state.subscription.as_mut() {
                subscription.active = false;
            }
            if let Err(err) = self.store.store(&state) {
                warn!(error = %err, "failed to persist push unsubscription");
                return OperationResult::failed(&err);
            }
            had_token.then(|| state.device_id.clone()).flatten()
        };

        if let (Some(registry), Some(device_id)) = (self.registry.as_ref(), device_id)
            && let Err(err) = registry.deactivate(&device_id).await
        {
            warn!(error = %err, "failed to deactivate remote push subscription");
        }
        info!("push subscription removed");
        OperationResult::ok()
    }

    /// Show a test notification through the background render path.
    pub async fn send_test(&self) -> OperationResult {
        let result = async {
            if !self.is_subscribed() {
                return Err(NotifyError::SubscriptionFailure(
                    "push notifications are not subscribed".into(),
                ));
            }
            let renderer = self.renderer.as_ref().ok_or_else(|| {
                NotifyError::ChannelUnsupported("no background render path".into())
            })?;
            renderer
                .show_via_background(&RenderedNotification::test(&self.url))
                .await
        }
        .await;

        match result {
            Ok(()) => OperationResult::ok(),
            Err(err) => {
                warn!(error = %err, "test push notification failed");
                OperationResult::failed(&err)
            }
        }
    }

    pub fn debug_info(&self) -> PushDebugInfo {
        let state = self.state();
        PushDebugInfo {
            initialized: self.channel.is_some() && self.public_key.is_some(),
            has_token: state.token.is_some(),
            is_subscribed: state
                .subscription
                .as_ref()
                .is_some_and(|subscription| subscription.active)
                && state.token.is_some(),
            channel_supported: self.channel.is_some(),
            background_alive: self
                .background
                .as_ref()
                .is_some_and(|background| background.is_alive()),
            notification_permission: self.permission.query(),
            device_id: state.device_id.clone(),
            state_path: self.store.path().map(Path::to_path_buf),
        }
    }
}

#[async_trait]
impl PushTier for PushService {
    async fn push(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        let token = self.token().ok_or_else(|| {
            NotifyError::SubscriptionFailure("push notifications are not subscribed".into())
        })?;
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| NotifyError::ChannelUnsupported("no push gateway is configured".into()))?;

        gateway
            .send(&token, &PushPayload::from_rendered(notification))
            .await?;

        let mut state = self.state();
        if let Some(subscription) = state.subscription.as_mut() {
            subscription.last_used = Utc::now();
        }
        if let Err(err) = self.store.store(&state) {
            warn!(error = %err, "failed to persist push usage");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::PermissionState;
    use crate::testing::RecordingRoute;
    use tempfile::TempDir;

    fn public_key() -> String {
        let mut key = vec![0x04];
        key.extend((1..PUBLIC_KEY_LEN as u8).map(|byte| byte.wrapping_mul(7)));
        URL_SAFE_NO_PAD.encode(key)
    }

    #[derive(Default)]
    struct FakeChannel {
        registered: Mutex<Vec<(usize, String)>>,
    }

    #[async_trait]
    impl PushChannel for FakeChannel {
        async fn register(&self, application_key: &[u8], device_id: &str) -> NotifyResult<String> {
            self.registered
                .lock()
                .unwrap()
                .push((application_key.len(), device_id.to_string()));
            Ok(format!("token-for-{device_id}"))
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        saved: Mutex<Vec<PushSubscription>>,
        deactivated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SubscriptionRegistry for FakeRegistry {
        async fn save(&self, subscription: &PushSubscription) -> NotifyResult<()> {
            self.saved.lock().unwrap().push(subscription.clone());
            Ok(())
        }

        async fn deactivate(&self, device_id: &str) -> NotifyResult<()> {
            self.deactivated.lock().unwrap().push(device_id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        sent: Mutex<Vec<(String, PushPayload)>>,
    }

    #[async_trait]
    impl PushGateway for FakeGateway {
        async fn send(&self, token: &str, payload: &PushPayload) -> NotifyResult<()> {
            self.sent
                .lock()
                .unwrap()
                .push((token.to_string(), payload.clone()));
            Ok(())
        }
    }

    fn service(permission: NotificationPermission, store: PushStateStore) -> PushService {
        PushService::new(Arc::new(PermissionState::new(permission)), store)
            .with_channel(Arc::new(FakeChannel::default()))
            .with_public_key(public_key())
            .with_user_agent("test-agent")
    }

    #[test]
    fn test_decode_public_key_checks_shape() {
        assert_eq!(decode_public_key(&public_key()).unwrap().len(), PUBLIC_KEY_LEN);
        assert_eq!(
            decode_public_key(&format!("{}=", public_key())).unwrap()[0],
            0x04
        );
        assert!(decode_public_key("not base64!").is_err());
        assert!(decode_public_key(&URL_SAFE_NO_PAD.encode([0x04; 12])).is_err());
        assert!(decode_public_key(&URL_SAFE_NO_PAD.encode([0x02; PUBLIC_KEY_LEN])).is_err());
    }

    #[tokio::test]
    async fn test_subscribe_persists_token_and_device() {
        let temp = TempDir::new().unwrap();
        let store = PushStateStore::at(temp.path().join(STATE_FILE_NAME));
        let registry = Arc::new(FakeRegistry::default());
        let push = service(NotificationPermission::Granted, store.clone())
            .with_registry(registry.clone());

        let result = push.subscribe().await;

        assert!(result.success, "{:?}", result.error);
        let token = result.token.expect("token should be returned");
        assert!(token.starts_with("token-for-device_"));
        assert!(push.is_subscribed());

        let saved = store.load();
        assert_eq!(saved.token.as_deref(), Some(token.as_str()));
        let subscription = saved.subscription.expect("subscription recorded");
        assert!(subscription.active);
        assert_eq!(subscription.user_agent, "test-agent");
        assert_eq!(registry.saved.lock().unwrap().len(), 1);

        let reloaded = PushService::new(
            Arc::new(PermissionState::new(NotificationPermission::Granted)),
            store,
        );
        assert!(reloaded.is_subscribed());
        assert_eq!(reloaded.device_id().unwrap(), subscription.device_id);
    }

    #[tokio::test]
    async fn test_subscribe_requires_permission() {
        let push = service(NotificationPermission::Denied, PushStateStore::in_memory());
        let result = push.subscribe().await;

        assert!(!result.success);
        assert_eq!(result.code, Some("PERMISSION_DENIED"));
        assert!(!push.is_subscribed());
    }

    #[tokio::test]
    async fn test_subscribe_requests_default_permission() {
        let push = service(NotificationPermission::Default, PushStateStore::in_memory());
        assert!(push.subscribe().await.success);
    }

    #[tokio::test]
    async fn test_subscribe_without_channel_is_unsupported() {
        let push = PushService::new(
            Arc::new(PermissionState::new(NotificationPermission::Granted)),
            PushStateStore::in_memory(),
        )
        .with_public_key(public_key());

        let result = push.subscribe().await;
        assert_eq!(result.code, Some("CHANNEL_UNSUPPORTED"));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let registry = Arc::new(FakeRegistry::default());
        let push = service(NotificationPermission::Granted, PushStateStore::in_memory())
            .with_registry(registry.clone());
        assert!(push.subscribe().await.success);

        assert!(push.unsubscribe().await.success);
        assert!(push.unsubscribe().await.success);

        assert!(!push.is_subscribed());
        assert!(!push.subscription().unwrap().active);
        assert_eq!(registry.deactivated.lock().unwrap().len(), 1);
        assert!(!push.debug_info().is_subscribed);
    }

    #[tokio::test]
    async fn test_send_test_uses_render_path() {
        let renderer = Arc::new(RecordingRoute::default());
        let push = service(NotificationPermission::Granted, PushStateStore::in_memory())
            .with_renderer(renderer.clone());

        assert_eq!(push.send_test().await.code, Some("SUBSCRIPTION_FAILURE"));
        assert!(push.subscribe().await.success);
        assert!(push.send_test().await.success);

        let shown = renderer.notifications();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].tag, "test-push-notification");
    }

    #[tokio::test]
    async fn test_push_tier_sends_through_gateway() {
        let gateway = Arc::new(FakeGateway::default());
        let push = service(NotificationPermission::Granted, PushStateStore::in_memory())
            .with_gateway(gateway.clone());
        let notification = RenderedNotification::adhoc("hi", "there", "/");

        assert!(push.push(&notification).await.is_err());
        let token = push.subscribe().await.token.unwrap();
        push.push(&notification).await.unwrap();

        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, token);
        assert_eq!(
            sent[0].1.notification.as_ref().and_then(|n| n.title.as_deref()),
            Some("hi")
        );
    }

    #[test]
    fn test_debug_info_reports_state() {
        let push = service(NotificationPermission::Default, PushStateStore::in_memory());
        let info = push.debug_info();
        assert!(info.initialized);
        assert!(!info.has_token);
        assert_eq!(info.notification_permission, NotificationPermission::Default);
        assert!(info.device_id.is_none());
        assert!(info.state_path.is_none());
    }
}
