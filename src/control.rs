//! Control protocol between the foreground application and the agent.
//!
//! Messages are `{type, data?}` JSON values paired with a one-shot reply
//! channel. The dispatcher replies exactly once per recognized request;
//! unknown or malformed messages are logged and dropped, and no error ever
//! crosses the channel boundary.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::cache::CacheStats;

/// Commands the agent recognizes over the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
  GetCacheStats,
  ClearCache,
  /// Re-fetch one URL and replace its cache entry.
  UpdateCache { url: String },
  /// Queue a replay task for the next drain.
  RegisterBackgroundSync {
    tag: String,
    endpoint: String,
    payload: Value,
  },
}

impl ControlCommand {
  /// Decode a raw control message. `None` means the message was logged and
  /// dropped; the caller simply never gets a reply.
  pub fn parse(message: &Value) -> Option<Self> {
    let kind = match message.get("type").and_then(Value::as_str) {
      Some(kind) => kind,
      None => {
        warn!(%message, "Control message without a type field");
        return None;
      }
    };
    let data = message.get("data");

    match kind {
      "GET_CACHE_STATS" => Some(Self::GetCacheStats),
      "CLEAR_CACHE" => Some(Self::ClearCache),
      "UPDATE_CACHE" => match data.and_then(|d| d.get("url")).and_then(Value::as_str) {
        Some(url) => Some(Self::UpdateCache {
          url: url.to_string(),
        }),
        None => {
          warn!("UPDATE_CACHE message without a url");
          None
        }
      },
      "REGISTER_BACKGROUND_SYNC" => {
        let endpoint = match data.and_then(|d| d.get("endpoint")).and_then(Value::as_str) {
          Some(endpoint) => endpoint.to_string(),
          None => {
            warn!("REGISTER_BACKGROUND_SYNC message without an endpoint");
            return None;
          }
        };
        let tag = data
          .and_then(|d| d.get("tag"))
          .and_then(Value::as_str)
          .unwrap_or("replay")
          .to_string();
        let payload = data
          .and_then(|d| d.get("payload"))
          .cloned()
          .unwrap_or(Value::Null);

        Some(Self::RegisterBackgroundSync {
          tag,
          endpoint,
          payload,
        })
      }
      other => {
        warn!(kind = other, "Ignoring unknown control message type");
        None
      }
    }
  }
}

/// Replies, serialized as `{type, ...}` for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  CacheStats { stats: CacheStats },
  CacheCleared,
  CacheUpdated { url: String },
  SyncRegistered { id: u64 },
  Error { message: String },
}

/// One in-flight control request: the raw message plus its reply channel.
///
/// Dropping the sender without sending is how unrecognized messages are
/// ignored; callers observe a closed channel, not an error value.
#[derive(Debug)]
pub struct ControlRequest {
  pub message: Value,
  pub reply: oneshot::Sender<ControlReply>,
}
