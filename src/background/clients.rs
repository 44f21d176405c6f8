//! Notification click routing onto application views.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{NotifyError, NotifyResult};
use crate::notification::{ACTION_DISMISS, DEFAULT_URL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    pub id: u64,
    pub url: String,
    pub focused: bool,
}

/// Host of the application's interactive views.
#[async_trait]
pub trait ViewHost: Send + Sync {
    async fn list_views(&self) -> Vec<ClientView>;
    async fn focus(&self, view_id: u64) -> NotifyResult<()>;
    async fn open_view(&self, url: &str) -> NotifyResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickRoute {
    Dismissed,
    Focused(u64),
    Opened(String),
}

/// Route a notification click. The notification itself is closed by the caller.
pub async fn route_click(
    host: &dyn ViewHost,
    action: Option<&str>,
    url: Option<&str>,
) -> NotifyResult<ClickRoute> {
    if action == Some(ACTION_DISMISS) {
        return Ok(ClickRoute::Dismissed);
    }

    let url = url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .unwrap_or(DEFAULT_URL);
    let views = host.list_views().await;
    let matching = views
        .iter()
        .filter(|view| view.url.contains(url))
        .collect::<Vec<_>>();
    let target = matching
        .iter()
        .find(|view| view.focused)
        .or_else(|| matching.first());

    match target {
        Some(view) => {
            host.focus(view.id).await?;
            debug!(view_id = view.id, url, "focused existing view");
            Ok(ClickRoute::Focused(view.id))
        }
        None => {
            host.open_view(url).await?;
            debug!(url, "opened new view");
            Ok(ClickRoute::Opened(url.to_string()))
        }
    }
}

/// Opens views with the system URL handler. Views opened this way cannot be
/// enumerated afterwards, so every routed click opens a new one.
#[derive(Debug, Clone)]
pub struct SystemViewHost {
    base_url: String,
}

impl SystemViewHost {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn resolve(&self, url: &str) -> String {
        if url.contains("://") {
            return url.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if url.starts_with('/') {
            format!("{base}{url}")
        } else {
            format!("{base}/{url}")
        }
    }
}

#[async_trait]
impl ViewHost for SystemViewHost {
    async fn list_views(&self) -> Vec<ClientView> {
        Vec::new()
    }

    async fn focus(&self, view_id: u64) -> NotifyResult<()> {
        Err(NotifyError::ChannelUnsupported(format!(
            "cannot focus view {view_id} opened by the system handler"
        )))
    }

    async fn open_view(&self, url: &str) -> NotifyResult<()> {
        let target = self.resolve(url);
        tokio::task::spawn_blocking(move || open::that(&target))
            .await
            .map_err(|err| NotifyError::RenderFailure(format!("opener task failed: {err}")))?
            .map_err(|err| NotifyError::RenderFailure(format!("failed to open view: {err}")))
    }
}

/// In-process view registry, used when the host embeds its own views.
#[derive(Debug, Default)]
pub struct MemoryViewHost {
    next_id: AtomicU64,
    views: Mutex<Vec<ClientView>>,
}

impl MemoryViewHost {
    pub fn with_views(views: Vec<ClientView>) -> Self {
        let next = views.iter().map(|view| view.id).max().unwrap_or(0) + 1;
        Self {
            next_id: AtomicU64::new(next),
            views: Mutex::new(views),
        }
    }

    pub fn views(&self) -> Vec<ClientView> {
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ViewHost for MemoryViewHost {
    async fn list_views(&self) -> Vec<ClientView> {
        self.views()
    }

    async fn focus(&self, view_id: u64) -> NotifyResult<()> {
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        if !views.iter().any(|view| view.id == view_id) {
            return Err(NotifyError::RenderFailure(format!("view {view_id} is gone")));
        }
        for view in views.iter_mut() {
            view.focused = view.id == view_id;
        }
        Ok(())
    }

    async fn open_view(&self, url: &str) -> NotifyResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).max(1);
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        for view in views.iter_mut() {
            view.focused = false;
        }
        views.push(ClientView {
            id,
            url: url.to_string(),
            focused: true,
        });
        Ok(())
    }
}
