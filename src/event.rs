use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::control::{ControlMessage, ControlReply};
use crate::interceptor::{InstallReport, InterceptionLayer};
use crate::lifecycle::Release;
use crate::net::{Request, Response};

/// Events delivered to the interception layer
#[derive(Debug)]
pub enum Event {
  /// Populate a generation for a new release
  Install(Release),
  /// Promote the waiting release
  Activate,
  /// An intercepted outgoing request
  Fetch(Request),
  /// A command from the host page
  Message(ControlMessage),
}

/// What handling an event produced
#[derive(Debug)]
pub enum Outcome {
  Installed(InstallReport),
  Activated(Option<String>),
  Response(Response),
  Reply(ControlReply),
  Failed(String),
}

type Envelope = (Event, Option<oneshot::Sender<Outcome>>);

/// Sending half of an event queue drained by a background task.
///
/// Events are handled one at a time, in the order they were sent.
#[derive(Clone)]
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl EventHandler {
  /// Spawn the task that feeds queued events to `layer`.
  pub fn spawn(layer: Arc<InterceptionLayer>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
      while let Some((event, reply)) = rx.recv().await {
        let outcome = layer.handle(event).await;
        if let Some(reply) = reply {
          if reply.send(outcome).is_err() {
            debug!("event sender went away before the outcome");
          }
        }
      }
    });

    Self { tx }
  }

  /// Queue an event and wait for its outcome.
  ///
  /// Returns None if the handling task has stopped.
  pub async fn send(&self, event: Event) -> Option<Outcome> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self.tx.send((event, Some(reply_tx))).ok()?;
    reply_rx.await.ok()
  }

  /// Queue an event without waiting. Returns false if the handling task has stopped.
  pub fn post(&self, event: Event) -> bool {
    self.tx.send((event, None)).is_ok()
  }
}
