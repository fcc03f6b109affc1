//! Per-connection lifecycle state machine.
//!
//! ```text
//! Connecting ──authenticate──▶ Authenticated ──open──▶ Open ──close──▶ Closed
//!      │                             │                  ▲  │
//!      └──────────close──────────────┴──────────────────┘  └─on_message─┘
//! ```
//!
//! The handler owns the registry side of a connection: `open` admits it,
//! `close` (or dropping the handler) removes it. It knows nothing about the
//! transport, so the session loop and tests drive it the same way.

use std::sync::Arc;

use metrics::counter;
use switchboard_core::{Action, ChannelKey, CodecError, ConnectionId, Principal, decode};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::ClientConnection;
use super::registry::ConnectionRegistry;
use super::router::MessageRouter;
use crate::metrics::WS_DECODE_FAILURES_TOTAL;

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade requested, not yet authenticated.
    Connecting,
    /// Session resolved to a principal; nothing registered yet.
    Authenticated,
    /// Registered and processing messages.
    Open,
    /// Deregistered. Terminal.
    Closed,
}

/// A lifecycle operation attempted from the wrong state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// The operation is not valid in the current state.
    #[error("cannot {operation} while {from:?}")]
    InvalidTransition {
        /// State the handler was in.
        from: ConnectionState,
        /// Operation that was attempted.
        operation: &'static str,
    },
}

/// What an inbound frame did.
#[derive(Debug)]
pub enum MessageOutcome {
    /// The connection joined a channel (`added` is false if already a member).
    Joined {
        /// Channel joined.
        channel: ChannelKey,
        /// Whether membership changed.
        added: bool,
    },
    /// The connection left a channel (`removed` is false if not a member).
    Left {
        /// Channel left.
        channel: ChannelKey,
        /// Whether membership changed.
        removed: bool,
    },
    /// A join/leave command that named no usable channel.
    MissingChannel,
    /// The envelope was routed to this many connections.
    Routed(usize),
    /// The frame could not be decoded; nothing was routed.
    Rejected(CodecError),
}

/// Drives one connection from handshake to close.
pub struct ConnectionHandler {
    state: ConnectionState,
    principal: Option<Principal>,
    connection: Option<Arc<ClientConnection>>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
}

impl ConnectionHandler {
    /// Start a handler in `Connecting`.
    pub fn new(registry: Arc<ConnectionRegistry>, router: Arc<MessageRouter>) -> Self {
        Self {
            state: ConnectionState::Connecting,
            principal: None,
            connection: None,
            registry,
            router,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Authenticated principal, once known.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// The registered connection while `Open`.
    pub fn connection(&self) -> Option<&Arc<ClientConnection>> {
        self.connection.as_ref()
    }

    /// `Connecting → Authenticated`.
    pub fn authenticate(&mut self, principal: Principal) -> Result<(), LifecycleError> {
        self.ensure_state(ConnectionState::Connecting, "authenticate")?;
        self.principal = Some(principal);
        self.state = ConnectionState::Authenticated;
        Ok(())
    }

    /// `Authenticated → Open`: create the connection for the authenticated
    /// principal and admit it into the registry.
    ///
    /// `outbound` feeds the transport writer; `close` is the connection's
    /// hang-up signal.
    pub fn open(
        &mut self,
        outbound: mpsc::Sender<Arc<String>>,
        close: CancellationToken,
    ) -> Result<Arc<ClientConnection>, LifecycleError> {
        self.ensure_state(ConnectionState::Authenticated, "open")?;
        let Some(principal) = self.principal.clone() else {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                operation: "open",
            });
        };
        let connection = Arc::new(ClientConnection::new(principal, outbound, close));
        self.registry.admit(connection.clone());
        info!(client_id = %connection.id, principal = %connection.principal(), "connection registered");
        self.connection = Some(connection.clone());
        self.state = ConnectionState::Open;
        Ok(connection)
    }

    /// Handle one inbound text frame while `Open`.
    ///
    /// `join`/`leave` update channel membership; anything else goes to the
    /// router. A frame that fails to decode is counted and reported in the
    /// outcome; the connection stays open.
    pub fn on_message(&self, text: &str) -> Result<MessageOutcome, LifecycleError> {
        self.ensure_state(ConnectionState::Open, "handle a message")?;
        let Some(connection) = &self.connection else {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                operation: "handle a message",
            });
        };

        let envelope = match decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                counter!(WS_DECODE_FAILURES_TOTAL).increment(1);
                warn!(client_id = %connection.id, error = %e, "dropping undecodable frame");
                return Ok(MessageOutcome::Rejected(e));
            }
        };

        let outcome = match envelope.action() {
            Action::Join | Action::Leave => {
                let Some(channel) = envelope.channel_key() else {
                    debug!(client_id = %connection.id, action = %envelope.action(), "membership command without channel");
                    return Ok(MessageOutcome::MissingChannel);
                };
                if *envelope.action() == Action::Join {
                    let added = self.registry.join(&connection.id, &channel);
                    debug!(client_id = %connection.id, %channel, added, "joined channel");
                    MessageOutcome::Joined { channel, added }
                } else {
                    let removed = self.registry.leave(&connection.id, &channel);
                    debug!(client_id = %connection.id, %channel, removed, "left channel");
                    MessageOutcome::Left { channel, removed }
                }
            }
            _ => MessageOutcome::Routed(self.router.route(&envelope)),
        };
        Ok(outcome)
    }

    /// Move to `Closed` from any state, deregistering the connection if it
    /// was admitted. Returns the removed connection the first time; later
    /// calls are no-ops.
    pub fn close(&mut self) -> Option<Arc<ClientConnection>> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        self.state = ConnectionState::Closed;
        let connection = self.connection.take()?;
        connection.close();
        let removed = self.registry.remove(&connection.id);
        info!(client_id = %connection.id, principal = %connection.principal(), "connection deregistered");
        removed.or(Some(connection))
    }

    /// ID of the registered connection, if any.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection.as_ref().map(|c| &c.id)
    }

    fn ensure_state(&self, state: ConnectionState, operation: &'static str) -> Result<(), LifecycleError> {
        if self.state == state {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                from: self.state,
                operation,
            })
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        router: Arc<MessageRouter>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let router = Arc::new(MessageRouter::new(registry.clone(), 100));
            Self { registry, router }
        }

        fn handler(&self) -> ConnectionHandler {
            ConnectionHandler::new(self.registry.clone(), self.router.clone())
        }

        fn open(&self, principal: &str) -> (ConnectionHandler, mpsc::Receiver<Arc<String>>) {
            let mut handler = self.handler();
            handler.authenticate(Principal::from(principal)).unwrap();
            let (tx, rx) = mpsc::channel(16);
            let _ = handler.open(tx, CancellationToken::new()).unwrap();
            (handler, rx)
        }
    }

    #[test]
    fn starts_connecting_and_registers_nothing() {
        let fx = Fixture::new();
        let handler = fx.handler();
        assert_eq!(handler.state(), ConnectionState::Connecting);
        assert!(handler.principal().is_none());
        assert_eq!(fx.registry.connection_count(), 0);
    }

    #[test]
    fn full_lifecycle() {
        let fx = Fixture::new();
        let mut handler = fx.handler();
        handler.authenticate(Principal::from("alice")).unwrap();
        assert_eq!(handler.state(), ConnectionState::Authenticated);
        assert_eq!(fx.registry.connection_count(), 0);

        let (tx, _rx) = mpsc::channel(4);
        let conn = handler.open(tx, CancellationToken::new()).unwrap();
        assert_eq!(handler.state(), ConnectionState::Open);
        assert_eq!(conn.principal().as_str(), "alice");
        assert!(fx.registry.get(&conn.id).is_some());

        let removed = handler.close().unwrap();
        assert_eq!(removed.id, conn.id);
        assert_eq!(handler.state(), ConnectionState::Closed);
        assert!(conn.is_closed());
        assert_eq!(fx.registry.connection_count(), 0);
    }

    #[test]
    fn out_of_order_transitions_fail() {
        let fx = Fixture::new();
        let mut handler = fx.handler();
        let (tx, _rx) = mpsc::channel(4);

        assert_matches!(
            handler.open(tx.clone(), CancellationToken::new()),
            Err(LifecycleError::InvalidTransition { from: ConnectionState::Connecting, .. })
        );
        assert_matches!(
            handler.on_message(r#"{"action":"create"}"#),
            Err(LifecycleError::InvalidTransition { .. })
        );

        handler.authenticate(Principal::from("alice")).unwrap();
        assert_matches!(
            handler.authenticate(Principal::from("bob")),
            Err(LifecycleError::InvalidTransition { from: ConnectionState::Authenticated, .. })
        );
        assert_eq!(handler.principal().unwrap().as_str(), "alice");
    }

    #[test]
    fn closed_is_terminal() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.open("alice");
        let _ = handler.close();
        assert!(handler.close().is_none());
        assert_matches!(
            handler.on_message(r#"{"action":"create"}"#),
            Err(LifecycleError::InvalidTransition { from: ConnectionState::Closed, .. })
        );
        assert_matches!(
            handler.authenticate(Principal::from("alice")),
            Err(LifecycleError::InvalidTransition { .. })
        );
    }

    #[test]
    fn close_before_open_registers_nothing() {
        let fx = Fixture::new();
        let mut handler = fx.handler();
        handler.authenticate(Principal::from("alice")).unwrap();
        assert!(handler.close().is_none());
        assert_eq!(handler.state(), ConnectionState::Closed);
        assert_eq!(fx.registry.connection_count(), 0);
    }

    #[test]
    fn drop_deregisters() {
        let fx = Fixture::new();
        let (handler, _rx) = fx.open("alice");
        let id = handler.connection_id().unwrap().clone();
        let _ = fx.registry.join(&id, &ChannelKey::new("room", "1"));
        drop(handler);
        assert!(fx.registry.get(&id).is_none());
        assert_eq!(fx.registry.channel_count(), 0);
    }

    #[test]
    fn close_after_external_removal_is_safe() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.open("alice");
        let id = handler.connection_id().unwrap().clone();
        let _ = fx.registry.remove(&id);
        assert!(handler.close().is_some());
        assert_eq!(fx.registry.connection_count(), 0);
    }

    #[test]
    fn join_and_leave_commands() {
        let fx = Fixture::new();
        let (handler, _rx) = fx.open("alice");
        let id = handler.connection_id().unwrap().clone();
        let key = ChannelKey::new("room", "7");

        let outcome = handler
            .on_message(r#"{"action":"join","collection":"","channelType":"room","channelId":"7"}"#)
            .unwrap();
        assert_matches!(outcome, MessageOutcome::Joined { ref channel, added: true } if *channel == key);
        assert!(fx.registry.is_member(&id, &key));

        let again = handler
            .on_message(r#"{"action":"join","channelType":"room","channelId":7}"#)
            .unwrap();
        assert_matches!(again, MessageOutcome::Joined { added: false, .. });

        let outcome = handler
            .on_message(r#"{"action":"leave","response":{"channelType":"room","channelId":"7"}}"#)
            .unwrap();
        assert_matches!(outcome, MessageOutcome::Left { removed: true, .. });
        assert!(!fx.registry.is_member(&id, &key));
        assert_eq!(fx.registry.channel_count(), 0);
    }

    #[test]
    fn membership_command_without_channel() {
        let fx = Fixture::new();
        let (handler, _rx) = fx.open("alice");
        let outcome = handler.on_message(r#"{"action":"join","channelType":"room"}"#).unwrap();
        assert_matches!(outcome, MessageOutcome::MissingChannel);
        assert_eq!(fx.registry.channel_count(), 0);
    }

    #[test]
    fn membership_commands_are_not_forwarded() {
        let fx = Fixture::new();
        let (handler, mut own_rx) = fx.open("alice");
        let (_other, mut other_rx) = fx.open("bob");
        let _ = handler
            .on_message(r#"{"action":"join","channelType":"room","channelId":"1"}"#)
            .unwrap();
        assert!(own_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn application_messages_are_routed() {
        let fx = Fixture::new();
        let (sender, _srx) = fx.open("alice");
        let (member, mut mrx) = fx.open("bob");
        let (_outsider, mut orx) = fx.open("carol");
        let _ = member
            .on_message(r#"{"action":"join","channelType":"room","channelId":"9"}"#)
            .unwrap();

        let outcome = sender
            .on_message(r#"{"action":"typing","collection":"Message","channelType":"room","channelId":"9","response":{"who":"alice"}}"#)
            .unwrap();
        assert_matches!(outcome, MessageOutcome::Routed(1));

        let frame: serde_json::Value = serde_json::from_str(&mrx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["action"], "typing");
        assert_eq!(frame["response"]["who"], "alice");
        assert!(orx.try_recv().is_err());
    }

    #[test]
    fn malformed_frames_are_rejected_without_closing() {
        let fx = Fixture::new();
        let (handler, _rx) = fx.open("alice");

        for bad in ["not json", "[1,2]", r#"{"collection":"x"}"#, r#"{"action":5}"#, ""] {
            let outcome = handler.on_message(bad).unwrap();
            assert_matches!(outcome, MessageOutcome::Rejected(ref e) if e.is_decode());
        }
        assert_eq!(handler.state(), ConnectionState::Open);
        assert_eq!(fx.registry.connection_count(), 1);
    }
}
