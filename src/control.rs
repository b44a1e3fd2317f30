//! Control messages from the host page.
//!
//! Wire form is a JSON object with a `type` tag:
//! `{"type": "SKIP_WAITING"}`, `{"type": "CLEAR_CACHE"}` and
//! `{"type": "CACHE_URLS", "payload": {"urls": [...]}}`. `CACHE_URLS` also
//! accepts `urls` at the top level.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::event::{Event, EventHandler, Outcome};
use crate::interceptor::InterceptionLayer;

/// A runtime command for the interception layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  /// Activate the waiting release now, even with pages still open
  SkipWaiting,
  /// Add URLs to the active generation
  CacheUrls { urls: Vec<String> },
  /// Drop every generation and repopulate the active one
  ClearCache,
}

#[derive(Deserialize)]
struct RawMessage {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  payload: Option<RawPayload>,
  #[serde(default)]
  urls: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RawPayload {
  #[serde(default)]
  urls: Option<Vec<String>>,
}

impl ControlMessage {
  pub fn from_json(raw: &str) -> Result<Self> {
    let message: RawMessage =
      serde_json::from_str(raw).map_err(|e| eyre!("Malformed control message: {}", e))?;

    match message.kind.as_str() {
      "SKIP_WAITING" => Ok(Self::SkipWaiting),
      "CLEAR_CACHE" => Ok(Self::ClearCache),
      "CACHE_URLS" => {
        let urls = message
          .payload
          .and_then(|p| p.urls)
          .or(message.urls)
          .unwrap_or_default();
        Ok(Self::CacheUrls { urls })
      }
      other => Err(eyre!("Unknown control message type '{}'", other)),
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::SkipWaiting => "SKIP_WAITING",
      Self::CacheUrls { .. } => "CACHE_URLS",
      Self::ClearCache => "CLEAR_CACHE",
    }
  }
}

/// Reply to a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  Activated { generation: Option<String> },
  Cached {
    stored: Vec<String>,
    failed: Vec<String>,
  },
  Cleared { generation: Option<String> },
  Rejected { reason: String },
}

impl ControlReply {
  pub fn rejected(reason: impl Into<String>) -> Self {
    Self::Rejected {
      reason: reason.into(),
    }
  }

  pub fn to_json(&self) -> String {
    serde_json::to_string(self)
      .unwrap_or_else(|e| format!("{{\"type\":\"REJECTED\",\"reason\":\"{}\"}}", e))
  }
}

/// Run a control message against the layer.
pub async fn dispatch(layer: &InterceptionLayer, message: ControlMessage) -> ControlReply {
  info!(kind = message.kind(), "control message");

  let reply = match message {
    ControlMessage::SkipWaiting => layer
      .skip_waiting()
      .await
      .map(|generation| ControlReply::Activated { generation }),
    ControlMessage::CacheUrls { urls } => layer
      .cache_urls(&urls)
      .await
      .map(|(stored, failed)| ControlReply::Cached { stored, failed }),
    ControlMessage::ClearCache => layer
      .clear_cache()
      .await
      .map(|generation| ControlReply::Cleared { generation }),
  };

  reply.unwrap_or_else(|e| {
    warn!(error = %e, "control message failed");
    ControlReply::rejected(e.to_string())
  })
}

/// Asynchronous channel for posting control messages to a layer.
#[derive(Clone)]
pub struct ControlChannel {
  events: EventHandler,
}

impl ControlChannel {
  /// Start processing messages for `layer` in a background task.
  pub fn spawn(layer: Arc<InterceptionLayer>) -> Self {
    Self {
      events: EventHandler::spawn(layer),
    }
  }

  /// Send a message and wait for the reply.
  pub async fn send(&self, message: ControlMessage) -> ControlReply {
    match self.events.send(Event::Message(message)).await {
      Some(Outcome::Reply(reply)) => reply,
      Some(other) => ControlReply::rejected(format!("unexpected outcome {:?}", other)),
      None => ControlReply::rejected("control channel closed"),
    }
  }

  /// Send a message without waiting for the reply.
  pub fn post(&self, message: ControlMessage) -> bool {
    self.events.post(Event::Message(message))
  }
}
