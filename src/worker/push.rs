//! Push payloads, notification display and click routing.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStorage;
use crate::config::Config;

use super::clients::{ClientHandle, ClientId};
use super::ServiceWorker;

/// Fields a push sender may set; everything else comes from config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub tag: Option<String>,
}

impl PushPayload {
  /// JSON payloads are read field by field; anything else becomes the body.
  pub fn parse(data: &[u8], app_name: &str) -> Self {
    match serde_json::from_slice::<serde_json::Value>(data) {
      Ok(value) => serde_json::from_value(value).unwrap_or_default(),
      Err(_) => Self {
        title: Some(app_name.to_string()),
        body: Some(String::from_utf8_lossy(data).into_owned()),
        ..Self::default()
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
  pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub data: NotificationData,
  pub require_interaction: bool,
}

impl Notification {
  pub fn from_payload(payload: PushPayload, config: &Config) -> Self {
    let defaults = &config.notifications;
    Self {
      title: payload.title.unwrap_or_else(|| config.app_name.clone()),
      body: payload.body.unwrap_or_else(|| defaults.default_body.clone()),
      icon: defaults.icon.clone(),
      badge: defaults.badge.clone(),
      tag: payload.tag.unwrap_or_else(|| defaults.default_tag.clone()),
      data: NotificationData {
        url: payload.url.unwrap_or_else(|| "/".to_string()),
      },
      require_interaction: false,
    }
  }
}

/// OS notification surface.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn show(&self, notification: &Notification) -> Result<()>;

  async fn close(&self, _notification: &Notification) -> Result<()> {
    Ok(())
  }
}

/// Writes notifications to the log instead of a desktop surface.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
  async fn show(&self, notification: &Notification) -> Result<()> {
    tracing::info!(
      title = %notification.title,
      body = %notification.body,
      tag = %notification.tag,
      url = %notification.data.url,
      "notification"
    );
    Ok(())
  }
}

/// Where a notification click landed
#[derive(Debug)]
pub enum ClickOutcome {
  Focused(ClientId),
  Opened(ClientHandle),
}

impl<S: CacheStorage> ServiceWorker<S> {
  /// Show a notification for an inbound push. Empty pushes are ignored.
  pub async fn handle_push(&self, data: Option<&[u8]>) -> Option<Notification> {
    let data = data.filter(|d| !d.is_empty())?;
    let payload = PushPayload::parse(data, &self.config.app_name);
    let notification = Notification::from_payload(payload, &self.config);

    if let Err(e) = self.notifier.show(&notification).await {
      tracing::error!(tag = %notification.tag, "failed to show notification: {e}");
    }
    Some(notification)
  }

  /// Close the notification, then focus a window already at its URL or open
  /// a new one.
  pub async fn handle_notification_click(&self, notification: &Notification) -> Result<ClickOutcome> {
    if let Err(e) = self.notifier.close(notification).await {
      tracing::debug!(tag = %notification.tag, "failed to close notification: {e}");
    }

    let target = self
      .origin
      .join(&notification.data.url)
      .map_err(|e| eyre!("Invalid notification url '{}': {}", notification.data.url, e))?;

    let existing = self
      .clients
      .match_all(true)
      .into_iter()
      .find(|c| c.url == target);

    if let Some(client) = existing {
      if self.clients.focus(client.id) {
        return Ok(ClickOutcome::Focused(client.id));
      }
    }

    tracing::debug!(url = %target, "opening window for notification");
    Ok(ClickOutcome::Opened(self.clients.open_window(target)))
  }
}
