use std::sync::Arc;
use std::time::Duration;

use crate::error::{NotifyError, NotifyResult};
use crate::notification::{NotificationSurface, RenderedNotification};

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Raises notifications from the active (foreground) context.
pub struct LocalDeliverer {
    surface: Arc<dyn NotificationSurface>,
    timeout: Duration,
}

impl LocalDeliverer {
    pub fn new(surface: Arc<dyn NotificationSurface>) -> Self {
        Self {
            surface,
            timeout: DEFAULT_RENDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn show(&self, notification: &RenderedNotification) -> NotifyResult<()> {
        tokio::time::timeout(self.timeout, self.surface.show(notification))
            .await
            .map_err(|_| {
                NotifyError::RenderFailure(format!(
                    "notification surface did not answer within {}ms",
                    self.timeout.as_millis()
                ))
            })?
    }
}
