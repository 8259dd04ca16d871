//! Agent wiring: the interception entry point and the background event loop.
//!
//! The binary drives the agent through `run`; an embedding application can
//! instead call `handle_fetch`, `handle_control`, and `handle_push` directly
//! and inject events through an `EventHandler` sender.

use color_eyre::Result;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{fingerprint, CacheBackend, CacheLayer, CacheStore, FetchOutcome, FetchSource};
use crate::config::Config;
use crate::control::{ControlCommand, ControlReply, ControlRequest};
use crate::event::{Event, EventHandler};
use crate::fetch::HttpClient;
use crate::lifecycle::LifecycleManager;
use crate::notify::{ClientSurface, NotificationDispatcher};
use crate::replay::ReplayQueue;
use crate::routes::{Router, Strategy};

/// The background agent: request interception, replay, notifications, and
/// the control channel, wired over one cache store.
pub struct Agent<B: CacheBackend + 'static> {
  config: Config,
  store: CacheStore<B>,
  layer: CacheLayer<B>,
  router: Router,
  client: HttpClient,
  lifecycle: LifecycleManager<B>,
  replay: Arc<ReplayQueue>,
  notifier: NotificationDispatcher,
  surface: Arc<dyn ClientSurface>,
  online: bool,
  /// Installed but holding off activation until clients adopt the update.
  waiting: bool,
}

impl<B: CacheBackend + 'static> Agent<B> {
  pub fn new(config: Config, backend: B, surface: Arc<dyn ClientSurface>) -> Result<Self> {
    let origin = config.origin_url()?;
    let client = HttpClient::new(origin.clone())?;

    let store = CacheStore::new(backend, &config.cache);
    let layer = CacheLayer::new(store.clone());
    let lifecycle = LifecycleManager::new(store.clone());

    let rules = if config.routes.is_empty() {
      Router::default_rules()
    } else {
      config.routes.clone()
    };
    let router = Router::new(origin, rules);

    Ok(Self {
      config,
      store,
      layer,
      router,
      client,
      lifecycle,
      replay: Arc::new(ReplayQueue::new()),
      notifier: NotificationDispatcher::new(surface.clone()),
      surface,
      online: true,
      waiting: false,
    })
  }

  /// Install, optionally wait for adoption, activate, then process events.
  pub async fn run(&mut self) -> Result<()> {
    self.start().await?;

    let mut events = EventHandler::new(
      Duration::from_secs(self.config.tick_secs),
      Duration::from_secs(self.config.probe_secs),
      self.client.clone(),
    );
    info!(origin = %self.client.origin(), "Agent running");

    while let Some(event) = events.next().await {
      if matches!(event, Event::Shutdown) {
        break;
      }
      self.handle_event(event).await;
    }

    Ok(())
  }

  /// Install the current generation and activate it unless live clients
  /// should adopt it explicitly first.
  pub async fn start(&mut self) -> Result<()> {
    let mut manifest: Vec<Url> = Vec::with_capacity(self.config.precache.len());
    for path in &self.config.precache {
      manifest.push(self.client.resolve(path)?);
    }

    let client = self.client.clone();
    self
      .lifecycle
      .install(&manifest, move |url| {
        let client = client.clone();
        async move { client.fetch(Method::GET, &url).await }
      })
      .await?;

    if self.lifecycle.update_waiting()? && !self.surface.windows().is_empty() {
      // A previous generation is serving live clients; prompt and hold.
      info!("New version installed and waiting for adoption");
      self.waiting = true;
      self.post_message(json!({
        "type": "UPDATE_AVAILABLE",
        "version": self.config.cache.version,
      }));
      return Ok(());
    }

    self.activate()
  }

  fn activate(&mut self) -> Result<()> {
    let dropped = self.lifecycle.activate()?;
    self.waiting = false;

    // Claim open clients so they route through this generation without a
    // manual reload.
    self.post_message(json!({
      "type": "AGENT_ACTIVATED",
      "version": self.config.cache.version,
      "removed": dropped,
    }));
    Ok(())
  }

  async fn handle_event(&mut self, event: Event) {
    match event {
      Event::Tick => self.maintenance().await,
      Event::Fetch { method, url, reply } => {
        let outcome = self.handle_fetch(method, &url).await;
        if reply.send(outcome).is_err() {
          debug!("Fetch caller went away before the reply");
        }
      }
      Event::NotificationAction { action, data } => {
        match self.notifier.dispatch_action(&action, &data) {
          Ok(outcome) => debug!(?outcome, "Notification action handled"),
          Err(e) => warn!(error = %e, "Notification action failed"),
        }
      }
      Event::Online => {
        if !self.online {
          self.online = true;
          info!("Connectivity restored");
          self.post_status();
          self.drain_replay().await;
        }
      }
      Event::Offline => {
        if self.online {
          self.online = false;
          warn!("Origin unreachable; entering offline mode");
          self.post_status();
        }
      }
      Event::Sync(tag) => {
        debug!(tag = %tag, "Replay trigger");
        self.drain_replay().await;
      }
      Event::Control(request) => self.handle_control(request).await,
      Event::Push(raw) => self.handle_push(&raw),
      Event::SkipWaiting => {
        if self.waiting {
          info!("Adopting new version immediately");
          if let Err(e) = self.activate() {
            warn!(error = %e, "Activation failed");
          }
        }
      }
      Event::Shutdown => {}
    }
  }

  /// Interception entry point for one outbound request.
  ///
  /// Intercepted requests always resolve to a response (worst case the
  /// synthetic offline one); only passthrough requests can surface a
  /// transport error to the caller.
  pub async fn handle_fetch(&self, method: Method, url: &Url) -> Result<FetchOutcome> {
    let decision = match self.router.classify(&method, url) {
      Some(decision) => decision,
      None => {
        // Not ours: pass through untouched.
        let response = self.client.fetch(method, url).await?;
        return Ok(FetchOutcome {
          response,
          source: FetchSource::Network,
        });
      }
    };

    let key = fingerprint(&method, url);
    let client = self.client.clone();
    let target = url.clone();
    let fetch = move || async move { client.fetch(Method::GET, &target).await };

    let outcome = match decision.strategy {
      Strategy::CacheFirst => self.layer.cache_first(&decision.partition, &key, fetch).await,
      Strategy::NetworkFirst => {
        self
          .layer
          .network_first(&decision.partition, &key, fetch)
          .await
      }
      Strategy::StaleWhileRevalidate => {
        self
          .layer
          .stale_while_revalidate(&decision.partition, &key, fetch)
          .await
      }
    };

    Ok(outcome)
  }

  /// Handle one control request, replying exactly once if it was recognized.
  pub async fn handle_control(&self, request: ControlRequest) {
    let command = match ControlCommand::parse(&request.message) {
      Some(command) => command,
      None => return, // already logged; dropping the sender is the ignore
    };

    let reply = match command {
      ControlCommand::GetCacheStats => match self.store.stats() {
        Ok(stats) => ControlReply::CacheStats { stats },
        Err(e) => ControlReply::Error {
          message: e.to_string(),
        },
      },
      ControlCommand::ClearCache => match self.store.clear_all() {
        Ok(()) => {
          info!("Cleared all cache partitions");
          ControlReply::CacheCleared
        }
        Err(e) => ControlReply::Error {
          message: e.to_string(),
        },
      },
      ControlCommand::UpdateCache { url } => self.update_cache(&url).await,
      ControlCommand::RegisterBackgroundSync {
        tag,
        endpoint,
        payload,
      } => match self.replay.register(tag, endpoint, payload) {
        Ok(id) => {
          if self.online {
            self.drain_replay().await;
          }
          ControlReply::SyncRegistered { id }
        }
        Err(e) => ControlReply::Error {
          message: e.to_string(),
        },
      },
    };

    if request.reply.send(reply).is_err() {
      debug!("Control caller went away before the reply");
    }
  }

  /// Re-fetch one URL and replace its cache entry.
  async fn update_cache(&self, raw_url: &str) -> ControlReply {
    let url = match self.client.resolve(raw_url) {
      Ok(url) => url,
      Err(e) => {
        return ControlReply::Error {
          message: e.to_string(),
        }
      }
    };

    let partition = match self.router.classify(&Method::GET, &url) {
      Some(decision) => decision.partition,
      None => {
        return ControlReply::Error {
          message: format!("{} is not an interceptable request", url),
        }
      }
    };

    match self.client.fetch(Method::GET, &url).await {
      Ok(response) => {
        let key = fingerprint(&Method::GET, &url);
        if let Err(e) = self.store.put(&partition, &key, response) {
          warn!(url = %url, error = %e, "Cache update write failed");
        }
        ControlReply::CacheUpdated {
          url: url.to_string(),
        }
      }
      Err(e) => ControlReply::Error {
        message: e.to_string(),
      },
    }
  }

  /// Render an inbound push payload and hand it to the client surface.
  pub fn handle_push(&self, raw: &[u8]) {
    if let Some(notification) = self.notifier.render(raw) {
      info!(title = %notification.title, "Displaying notification");
      self.post_message(json!({
        "type": "SHOW_NOTIFICATION",
        "notification": notification,
      }));
    }
  }

  /// Idle maintenance: expiry sweeps, plus a replay drain while online.
  async fn maintenance(&self) {
    for partition in self.store.partition_names() {
      match self.store.evict_expired(&partition) {
        Ok(0) => {}
        Ok(swept) => debug!(partition = %partition, swept, "Swept expired entries"),
        Err(e) => warn!(partition = %partition, error = %e, "Expiry sweep failed"),
      }
    }

    if self.online {
      self.drain_replay().await;
    }
  }

  async fn drain_replay(&self) {
    let client = self.client.clone();
    let result = self
      .replay
      .drain(move |task| {
        let client = client.clone();
        async move { client.post_json(&task.endpoint, &task.payload).await }
      })
      .await;

    match result {
      Ok(report) if report.sent + report.failed > 0 => {
        info!(sent = report.sent, failed = report.failed, "Replay drain finished");
      }
      Ok(_) => {}
      Err(e) => warn!(error = %e, "Replay drain aborted"),
    }
  }

  fn post_status(&self) {
    self.post_message(json!({
      "type": "OFFLINE_STATUS",
      "online": self.online,
    }));
  }

  fn post_message(&self, message: serde_json::Value) {
    if let Err(e) = self.surface.post_message(message) {
      warn!(error = %e, "Failed to post message to foreground");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryBackend;
  use crate::fetch::ResponseData;
  use crate::notify::WindowRef;
  use serde_json::json;
  use tokio::sync::oneshot;

  struct NullSurface;

  impl ClientSurface for NullSurface {
    fn windows(&self) -> Vec<WindowRef> {
      Vec::new()
    }
    fn focus(&self, _id: u64) -> Result<()> {
      Ok(())
    }
    fn open(&self, url: &str) -> Result<WindowRef> {
      Ok(WindowRef {
        id: 1,
        url: url.to_string(),
      })
    }
    fn post_message(&self, _message: serde_json::Value) -> Result<()> {
      Ok(())
    }
  }

  fn agent() -> Agent<MemoryBackend> {
    let config = Config {
      origin: "https://app.example.org".to_string(),
      ..Config::default()
    };
    let mut agent = Agent::new(config, MemoryBackend::new(), Arc::new(NullSurface)).unwrap();
    // Keep tests off the network: an offline agent never kicks a drain.
    agent.online = false;
    agent
  }

  fn response(body: &str) -> ResponseData {
    ResponseData {
      status: 200,
      headers: vec![],
      body: body.as_bytes().to_vec(),
    }
  }

  #[tokio::test]
  async fn test_control_stats_reply() {
    let agent = agent();
    agent.store.put("dynamic", "k", response("x")).unwrap();

    let (tx, rx) = oneshot::channel();
    agent
      .handle_control(ControlRequest {
        message: json!({"type": "GET_CACHE_STATS"}),
        reply: tx,
      })
      .await;

    match rx.await.unwrap() {
      ControlReply::CacheStats { stats } => {
        let dynamic = stats
          .partitions
          .iter()
          .find(|p| p.name == "dynamic-v1")
          .unwrap();
        assert_eq!(dynamic.entries, 1);
      }
      other => panic!("unexpected reply: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_control_clear_cache() {
    let agent = agent();
    agent.store.put("dynamic", "k", response("x")).unwrap();

    let (tx, rx) = oneshot::channel();
    agent
      .handle_control(ControlRequest {
        message: json!({"type": "CLEAR_CACHE"}),
        reply: tx,
      })
      .await;

    assert!(matches!(rx.await.unwrap(), ControlReply::CacheCleared));
    assert!(agent.store.get("dynamic", "k").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_control_register_background_sync() {
    let agent = agent();

    let (tx, rx) = oneshot::channel();
    agent
      .handle_control(ControlRequest {
        message: json!({
          "type": "REGISTER_BACKGROUND_SYNC",
          "data": {"tag": "donation", "endpoint": "/api/donations", "payload": {"amount": 10}}
        }),
        reply: tx,
      })
      .await;

    match rx.await.unwrap() {
      ControlReply::SyncRegistered { id } => assert_eq!(id, 1),
      other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(agent.replay.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_unknown_control_type_gets_no_reply() {
    let agent = agent();

    let (tx, rx) = oneshot::channel();
    agent
      .handle_control(ControlRequest {
        message: json!({"type": "SELF_DESTRUCT"}),
        reply: tx,
      })
      .await;

    // The sender was dropped without a reply.
    assert!(rx.await.is_err());
  }

  #[test]
  fn test_push_with_malformed_payload_is_ignored() {
    let agent = agent();
    // Must not panic or error.
    agent.handle_push(b"definitely not json");
  }

  #[tokio::test]
  async fn test_handle_fetch_serves_precached_asset_offline() {
    let agent = agent();
    let url = Url::parse("https://app.example.org/scripts/app.js").unwrap();
    let key = fingerprint(&Method::GET, &url);
    agent.store.put("static", &key, response("app code")).unwrap();

    // Cache-first hit: no network involved at all.
    let outcome = agent.handle_fetch(Method::GET, &url).await.unwrap();
    assert_eq!(outcome.source, FetchSource::Cache);
    assert_eq!(outcome.response.body, b"app code");
  }
}
