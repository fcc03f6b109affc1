//! Envelope routing: picks the recipients for an envelope and queues it.
//!
//! Resolution order for [`MessageRouter::route`]:
//! 1. `usersmeta` envelopes go only to the connections of `response.userId`
//!    (nobody if there is no owner), whatever channel hints they carry.
//! 2. An envelope naming a channel with at least one member goes to exactly
//!    those members.
//! 3. Everything else goes to every live connection.
//!
//! Each pass serializes the envelope once and `try_send`s the shared text to
//! every recipient. A full or closed queue is logged and counted; it never
//! stops the rest of the pass. Connections that reach the drop limit are
//! evicted after the pass.

use std::sync::Arc;

use metrics::counter;
use switchboard_core::{ChannelKey, Envelope, Principal, encode};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use super::registry::ConnectionRegistry;
use crate::metrics::{ROUTER_DELIVERIES_TOTAL, WS_BROADCAST_DROPS_TOTAL};

/// Delivery strategy chosen for an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Connections of the envelope's owner.
    Owner,
    /// Members of the envelope's channel.
    Channel,
    /// Every live connection.
    Broadcast,
    /// Connections of an explicitly named principal.
    Direct,
}

impl Strategy {
    /// Metric/log label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Channel => "channel",
            Self::Broadcast => "broadcast",
            Self::Direct => "direct",
        }
    }
}

/// Resolves recipients from the registry and fans envelopes out to them.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    max_dropped_messages: u64,
}

impl MessageRouter {
    /// Create a router over `registry`. Connections whose lifetime drop count
    /// reaches `max_dropped_messages` are evicted.
    pub fn new(registry: Arc<ConnectionRegistry>, max_dropped_messages: u64) -> Self {
        Self {
            registry,
            max_dropped_messages: max_dropped_messages.max(1),
        }
    }

    /// The registry this router reads from.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Pick the strategy for `envelope` and deliver it.
    ///
    /// Returns the number of connections the envelope was queued to.
    pub fn route(&self, envelope: &Envelope) -> usize {
        if envelope.is_user_meta() {
            return self.send_to_owner(envelope);
        }
        if let Some(key) = envelope.channel_key() {
            let members = self.registry.lookup_by_channel(&key);
            if !members.is_empty() {
                return self.deliver(&members, envelope, Strategy::Channel);
            }
            debug!(channel = %key, "channel has no members, broadcasting");
        }
        self.broadcast_all(envelope)
    }

    /// Deliver to the connections of the principal named by `response.userId`.
    pub fn send_to_owner(&self, envelope: &Envelope) -> usize {
        let Some(owner) = envelope.owner() else {
            debug!(collection = envelope.collection(), "owner-targeted envelope has no userId");
            return 0;
        };
        let targets = self.registry.lookup_by_principal(&owner);
        self.deliver(&targets, envelope, Strategy::Owner)
    }

    /// Deliver to the members of `key`, as observed at lookup time.
    pub fn send_to_channel(&self, key: &ChannelKey, envelope: &Envelope) -> usize {
        let targets = self.registry.lookup_by_channel(key);
        self.deliver(&targets, envelope, Strategy::Channel)
    }

    /// Deliver to every live connection.
    pub fn broadcast_all(&self, envelope: &Envelope) -> usize {
        let targets = self.registry.all();
        self.deliver(&targets, envelope, Strategy::Broadcast)
    }

    /// Deliver to every connection of `principal`.
    pub fn send_to_principal(&self, principal: &Principal, envelope: &Envelope) -> usize {
        let targets = self.registry.lookup_by_principal(principal);
        self.deliver(&targets, envelope, Strategy::Direct)
    }

    fn deliver(
        &self,
        targets: &[Arc<ClientConnection>],
        envelope: &Envelope,
        strategy: Strategy,
    ) -> usize {
        if targets.is_empty() {
            debug!(strategy = strategy.as_str(), collection = envelope.collection(), "no recipients");
            return 0;
        }
        let json = match encode(envelope) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(collection = envelope.collection(), error = %e, "failed to encode envelope");
                return 0;
            }
        };

        let mut delivered = 0usize;
        let mut evict = Vec::new();
        for conn in targets {
            if conn.send(json.clone()) {
                delivered += 1;
                continue;
            }
            counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
            warn!(
                client_id = %conn.id,
                principal = %conn.principal(),
                drops = conn.drop_count(),
                "failed to queue message for client"
            );
            if conn.drop_count() >= self.max_dropped_messages {
                evict.push(conn);
            }
        }

        for conn in evict {
            warn!(
                client_id = %conn.id,
                drops = conn.drop_count(),
                "evicting slow client"
            );
            conn.close();
            let _ = self.registry.remove(&conn.id);
        }

        counter!(ROUTER_DELIVERIES_TOTAL, "strategy" => strategy.as_str()).increment(delivered as u64);
        debug!(
            strategy = strategy.as_str(),
            action = %envelope.action(),
            collection = envelope.collection(),
            recipients = delivered,
            "routed envelope"
        );
        delivered
    }
}
