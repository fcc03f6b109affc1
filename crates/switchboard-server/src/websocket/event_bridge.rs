//! Event bridge: turns document-API writes into routed envelopes.
//!
//! Two entry points reach the same routing path:
//! - [`EventBridge::notify_change`], called synchronously by whoever
//!   performed the write (the `POST /changes` hook uses this);
//! - [`EventBridge::run`], a task draining a `broadcast` channel of
//!   [`ChangeEvent`]s for in-process publishers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{Action, Envelope};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::router::MessageRouter;

/// A completed write in the document layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened (`create`, `update`, `delete`, or custom).
    pub action: Action,
    /// Collection the document belongs to.
    pub collection: String,
    /// The affected document.
    #[serde(default)]
    pub document: Value,
}

impl ChangeEvent {
    /// Build a change event.
    pub fn new(action: impl Into<Action>, collection: impl Into<String>, document: Value) -> Self {
        Self {
            action: action.into(),
            collection: collection.into(),
            document,
        }
    }

    /// The envelope clients receive for this change.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::from_http_request(self.action.clone(), self.collection.clone(), self.document.clone())
    }
}

/// Bridges document changes to WebSocket clients.
pub struct EventBridge {
    router: Arc<MessageRouter>,
}

impl EventBridge {
    /// Create a bridge routing through `router`.
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self { router }
    }

    /// Route a change to its recipients. Returns the recipient count.
    pub fn notify_change(
        &self,
        action: impl Into<Action>,
        collection: impl Into<String>,
        document: Value,
    ) -> usize {
        self.dispatch(&ChangeEvent::new(action, collection, document))
    }

    /// Route a [`ChangeEvent`] as its [`ChangeEvent::to_envelope`] form.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        let envelope = event.to_envelope();
        let recipients = self.router.route(&envelope);
        tracing::debug!(
            action = %envelope.action(),
            collection = envelope.collection(),
            recipients,
            "bridged document change"
        );
        recipients
    }

    /// Drain `rx` until the sender is dropped or `cancel` fires.
    #[tracing::instrument(skip_all, name = "event_bridge")]
    pub async fn run(&self, mut rx: broadcast::Receiver<ChangeEvent>, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("event bridge cancelled, exiting");
                    break;
                }
                received = rx.recv() => received,
            };
            match received {
                Ok(event) => {
                    let _ = self.dispatch(&event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event bridge lagged, changes skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bridge: sender closed, exiting");
                    break;
                }
            }
        }
    }
}
