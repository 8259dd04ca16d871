//! Push payload decoding, notification rendering, and action routing.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Action id carried by the built-in "open the app" action.
pub const ACTION_VIEW: &str = "view";
/// Action id for the built-in no-op dismissal.
pub const ACTION_DISMISS: &str = "dismiss";

/// Inbound push payload shape.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
  pub title: String,
  pub body: String,
  #[serde(default)]
  pub icon: Option<String>,
  #[serde(default)]
  pub image: Option<String>,
  #[serde(default)]
  pub actions: Vec<PushAction>,
  pub data: RoutingData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushAction {
  pub action: String,
  pub title: String,
  #[serde(default)]
  pub icon: Option<String>,
}

/// Routing information a notification carries back into the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingData {
  pub url: String,
  #[serde(default)]
  pub action: Option<String>,
  #[serde(default)]
  pub id: Option<Value>,
}

/// A rendered notification, ready to display.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub image: Option<String>,
  pub actions: Vec<NotificationAction>,
  pub data: RoutingData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub id: String,
  pub label: String,
}

/// Decode a raw push payload. Malformed payloads are dropped with a log
/// line; they never crash the agent.
pub fn parse_payload(raw: &[u8]) -> Option<PushPayload> {
  match serde_json::from_slice(raw) {
    Ok(payload) => Some(payload),
    Err(e) => {
      warn!(error = %e, "Dropping malformed push payload");
      None
    }
  }
}

/// A reference to one open application window.
#[derive(Debug, Clone)]
pub struct WindowRef {
  pub id: u64,
  pub url: String,
}

/// The client application's windows and message port, abstracted so the
/// agent can run (and be tested) outside its real host.
pub trait ClientSurface: Send + Sync {
  /// Currently open application windows.
  fn windows(&self) -> Vec<WindowRef>;

  fn focus(&self, id: u64) -> Result<()>;

  fn open(&self, url: &str) -> Result<WindowRef>;

  /// Post a message to the foreground application.
  fn post_message(&self, message: Value) -> Result<()>;
}

/// Surface for running with no client attached: logs instead of rendering.
pub struct HeadlessSurface;

impl ClientSurface for HeadlessSurface {
  fn windows(&self) -> Vec<WindowRef> {
    Vec::new()
  }

  fn focus(&self, _id: u64) -> Result<()> {
    Ok(())
  }

  fn open(&self, url: &str) -> Result<WindowRef> {
    info!(url, "Would open window");
    Ok(WindowRef {
      id: 0,
      url: url.to_string(),
    })
  }

  fn post_message(&self, message: Value) -> Result<()> {
    debug!(%message, "Would post message to foreground");
    Ok(())
  }
}

/// What happened in response to a user action on a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
  Opened(u64),
  Focused(u64),
  Forwarded,
  Dismissed,
}

/// Renders notifications and routes their actions back into the app.
pub struct NotificationDispatcher {
  surface: Arc<dyn ClientSurface>,
}

impl NotificationDispatcher {
  pub fn new(surface: Arc<dyn ClientSurface>) -> Self {
    Self { surface }
  }

  /// Decode and render one push payload. The rendered notification always
  /// carries the default view action first, then any payload actions.
  pub fn render(&self, raw: &[u8]) -> Option<Notification> {
    let payload = parse_payload(raw)?;

    let mut actions = vec![NotificationAction {
      id: ACTION_VIEW.to_string(),
      label: "View".to_string(),
    }];
    actions.extend(payload.actions.iter().map(|a| NotificationAction {
      id: a.action.clone(),
      label: a.title.clone(),
    }));

    Some(Notification {
      title: payload.title,
      body: payload.body,
      icon: payload.icon,
      image: payload.image,
      actions,
      data: payload.data,
    })
  }

  /// Route a user action on a displayed notification.
  ///
  /// An empty action id is the notification body itself being clicked and
  /// behaves like the default view action.
  pub fn dispatch_action(&self, action: &str, data: &RoutingData) -> Result<ActionOutcome> {
    match action {
      ACTION_DISMISS => Ok(ActionOutcome::Dismissed),
      ACTION_VIEW | "" => self.open_or_focus(&data.url),
      other => {
        // Domain-specific actions belong to the foreground.
        self.surface.post_message(serde_json::json!({
          "type": "NOTIFICATION_ACTION",
          "action": other,
          "data": data,
        }))?;
        Ok(ActionOutcome::Forwarded)
      }
    }
  }

  /// Focus an existing window already showing the target URL rather than
  /// opening a duplicate.
  fn open_or_focus(&self, url: &str) -> Result<ActionOutcome> {
    if let Some(window) = self.surface.windows().into_iter().find(|w| w.url == url) {
      self.surface.focus(window.id)?;
      return Ok(ActionOutcome::Focused(window.id));
    }

    let window = self.surface.open(url)?;
    Ok(ActionOutcome::Opened(window.id))
  }
}
