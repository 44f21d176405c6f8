//! HTTP bindings for the push channel, gateway and subscription registry.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PushChannel, PushGateway, PushSubscription, SubscriptionRegistry};
use crate::error::{NotifyError, NotifyResult};
use crate::notification::PushPayload;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_client() -> NotifyResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("due-notify/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| NotifyError::ChannelUnsupported(format!("failed to build HTTP client: {err}")))
}

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    application_server_key: String,
    device_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    token: &'a str,
    payload: &'a PushPayload,
}

/// Cloud push service reached over HTTP: `POST /register` issues tokens and
/// `POST /send` delivers a payload to one.
#[derive(Debug, Clone)]
pub struct HttpPushChannel {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPushChannel {
    pub fn new(endpoint: impl Into<String>) -> NotifyResult<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PushChannel for HttpPushChannel {
    async fn register(&self, application_key: &[u8], device_id: &str) -> NotifyResult<String> {
        let url = join(&self.endpoint, "register");
        debug!(%url, device_id, "registering push subscription");
        let request = RegisterRequest {
            application_server_key: URL_SAFE_NO_PAD.encode(application_key),
            device_id,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| NotifyError::SubscriptionFailure(format!("register request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(NotifyError::SubscriptionFailure(format!(
                "push service returned HTTP {} for register",
                response.status()
            )));
        }
        let body = response
            .json::<RegisterResponse>()
            .await
            .map_err(|err| NotifyError::SubscriptionFailure(format!("invalid register response: {err}")))?;
        Ok(body.token)
    }
}

#[async_trait]
impl PushGateway for HttpPushChannel {
    async fn send(&self, token: &str, payload: &PushPayload) -> NotifyResult<()> {
        let url = join(&self.endpoint, "send");
        let response = self
            .client
            .post(&url)
            .json(&SendRequest { token, payload })
            .send()
            .await
            .map_err(|err| NotifyError::RenderFailure(format!("push send failed: {err}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::RenderFailure(format!(
                "push service returned HTTP {} for send",
                response.status()
            )))
        }
    }
}

/// Remote subscription store: `POST /subscriptions`, `DELETE /subscriptions/<device>`.
#[derive(Debug, Clone)]
pub struct HttpSubscriptionRegistry {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSubscriptionRegistry {
    pub fn new(endpoint: impl Into<String>) -> NotifyResult<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SubscriptionRegistry for HttpSubscriptionRegistry {
    async fn save(&self, subscription: &PushSubscription) -> NotifyResult<()> {
        let response = self
            .client
            .post(join(&self.endpoint, "subscriptions"))
            .json(subscription)
            .send()
            .await
            .map_err(|err| NotifyError::SubscriptionFailure(err.to_string()))?;
        response
            .error_for_status()
            .map(|_| ())
            .map_err(|err| NotifyError::SubscriptionFailure(err.to_string()))
    }

    async fn deactivate(&self, device_id: &str) -> NotifyResult<()> {
        let response = self
            .client
            .delete(join(&self.endpoint, &format!("subscriptions/{device_id}")))
            .send()
            .await
            .map_err(|err| NotifyError::SubscriptionFailure(err.to_string()))?;
        response
            .error_for_status()
            .map(|_| ())
            .map_err(|err| NotifyError::SubscriptionFailure(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_normalizes_slashes() {
        assert_eq!(join("http://push.test/", "/send"), "http://push.test/send");
        assert_eq!(join("http://push.test/v1", "register"), "http://push.test/v1/register");
    }

    #[test]
    fn test_register_request_wire_shape() {
        let request = RegisterRequest {
            application_server_key: URL_SAFE_NO_PAD.encode([4u8, 1, 2]),
            device_id: "device_1",
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["applicationServerKey"], "BAEC");
        assert_eq!(value["deviceId"], "device_1");
    }

    #[test]
    fn test_clients_build() {
        assert!(HttpPushChannel::new("http://push.test").is_ok());
        assert!(HttpSubscriptionRegistry::new("http://push.test").is_ok());
    }
}
