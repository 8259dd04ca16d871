//! Agent events and their sources.

use reqwest::Method;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::cache::FetchOutcome;
use crate::control::ControlRequest;
use crate::fetch::HttpClient;
use crate::notify::RoutingData;

/// Events the agent loop reacts to.
///
/// Tick/Online/Offline come from the handler's own timers; everything else is
/// injected by the embedding application through `EventHandler::sender`.
#[derive(Debug)]
#[allow(dead_code)]
pub enum Event {
  /// Periodic maintenance tick
  Tick,
  /// Connectivity regained
  Online,
  /// Connectivity lost
  Offline,
  /// Intercepted outbound request awaiting a response
  Fetch {
    method: Method,
    url: Url,
    reply: oneshot::Sender<color_eyre::Result<FetchOutcome>>,
  },
  /// Foreground control request
  Control(ControlRequest),
  /// Raw inbound push payload
  Push(Vec<u8>),
  /// User action on a displayed notification
  NotificationAction { action: String, data: RoutingData },
  /// Explicit replay trigger for a sync tag
  Sync(String),
  /// Adopt a waiting version immediately
  SkipWaiting,
  /// Stop the agent loop
  Shutdown,
}

/// Event handler that produces events from a tick timer and a connectivity
/// probe, and accepts injected events from the embedding application.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(tick_rate: Duration, probe_rate: Duration, client: HttpClient) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Maintenance tick
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      interval.tick().await; // the immediate first tick carries no information
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    // Connectivity probe; emits only on transitions
    let probe_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(probe_rate);
      let mut online = true; // assume online until a probe says otherwise
      loop {
        interval.tick().await;
        let now_online = client.probe().await;
        if now_online != online {
          online = now_online;
          let event = if online { Event::Online } else { Event::Offline };
          if probe_tx.send(event).is_err() {
            break;
          }
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for injecting fetch, control, push, and sync events.
  #[allow(dead_code)]
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event.
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
