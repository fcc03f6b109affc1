//! Connection registry with principal and channel indexes.
//!
//! The registry keeps three mappings consistent with the set of live
//! connections: principal → connections, channel → members, and
//! connection → channels. The last two mirror each other exactly, so a
//! connection's channels can be dropped on disconnect without scanning.
//!
//! All state sits behind one `RwLock`. Mutations take the write lock for
//! the whole update; lookups clone the matching `Arc`s out under a single
//! read lock, so a routing pass works on a consistent snapshot even if
//! members join or leave while it is sending.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use switchboard_core::{ChannelKey, ConnectionId, Principal};
use tracing::debug;

use super::connection::ClientConnection;

#[derive(Default)]
struct RegistryIndex {
    connections: HashMap<ConnectionId, Arc<ClientConnection>>,
    by_principal: HashMap<Principal, HashSet<ConnectionId>>,
    by_channel: HashMap<ChannelKey, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<ChannelKey>>,
}

impl RegistryIndex {
    fn remove(&mut self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let connection = self.connections.remove(id)?;

        let principal = connection.principal();
        if let Some(ids) = self.by_principal.get_mut(principal) {
            let _ = ids.remove(id);
            if ids.is_empty() {
                let _ = self.by_principal.remove(principal);
            }
        }

        for key in self.memberships.remove(id).unwrap_or_default() {
            if let Some(members) = self.by_channel.get_mut(&key) {
                let _ = members.remove(id);
                if members.is_empty() {
                    let _ = self.by_channel.remove(&key);
                }
            }
        }

        Some(connection)
    }

    fn resolve(&self, ids: Option<&HashSet<ConnectionId>>) -> Vec<Arc<ClientConnection>> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id).cloned())
            .collect()
    }
}

/// Live connections indexed by owner and by channel.
#[derive(Default)]
pub struct ConnectionRegistry {
    index: RwLock<RegistryIndex>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under its principal with no channel memberships.
    ///
    /// A connection already registered under the same ID is replaced and
    /// its memberships discarded.
    pub fn admit(&self, connection: Arc<ClientConnection>) {
        let mut index = self.index.write();
        let id = connection.id.clone();
        if index.remove(&id).is_some() {
            debug!(client_id = %id, "replaced existing registration");
        }
        let _ = index
            .by_principal
            .entry(connection.principal().clone())
            .or_default()
            .insert(id.clone());
        let _ = index.memberships.insert(id.clone(), HashSet::new());
        let _ = index.connections.insert(id, connection);
    }

    /// Remove a connection and every index entry that refers to it.
    ///
    /// Returns the connection if it was registered; removing an unknown or
    /// already removed ID is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.index.write().remove(id)
    }

    /// Subscribe a connection to a channel.
    ///
    /// Returns `false` if the connection is not registered or was already a
    /// member.
    pub fn join(&self, id: &ConnectionId, key: &ChannelKey) -> bool {
        let mut index = self.index.write();
        let Some(channels) = index.memberships.get_mut(id) else {
            return false;
        };
        if !channels.insert(key.clone()) {
            return false;
        }
        index
            .by_channel
            .entry(key.clone())
            .or_default()
            .insert(id.clone())
    }

    /// Unsubscribe a connection from a channel, dropping the channel when it
    /// has no members left.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&self, id: &ConnectionId, key: &ChannelKey) -> bool {
        let mut index = self.index.write();
        let was_member = index
            .memberships
            .get_mut(id)
            .is_some_and(|channels| channels.remove(key));
        if !was_member {
            return false;
        }
        if let Some(members) = index.by_channel.get_mut(key) {
            let _ = members.remove(id);
            if members.is_empty() {
                let _ = index.by_channel.remove(key);
            }
        }
        true
    }

    /// Look up a single connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.index.read().connections.get(id).cloned()
    }

    /// Snapshot of every connection owned by `principal`.
    pub fn lookup_by_principal(&self, principal: &Principal) -> Vec<Arc<ClientConnection>> {
        let index = self.index.read();
        index.resolve(index.by_principal.get(principal))
    }

    /// Snapshot of every member of `key`.
    pub fn lookup_by_channel(&self, key: &ChannelKey) -> Vec<Arc<ClientConnection>> {
        let index = self.index.read();
        index.resolve(index.by_channel.get(key))
    }

    /// Snapshot of every live connection.
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.index.read().connections.values().cloned().collect()
    }

    /// Channels a connection currently belongs to.
    pub fn memberships(&self, id: &ConnectionId) -> HashSet<ChannelKey> {
        self.index
            .read()
            .memberships
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `id` is a member of `key`.
    pub fn is_member(&self, id: &ConnectionId, key: &ChannelKey) -> bool {
        self.index
            .read()
            .by_channel
            .get(key)
            .is_some_and(|members| members.contains(id))
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.index.read().connections.len()
    }

    /// Number of channels with at least one member.
    pub fn channel_count(&self) -> usize {
        self.index.read().by_channel.len()
    }

    /// Number of distinct principals with at least one connection.
    pub fn principal_count(&self) -> usize {
        self.index.read().by_principal.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn make_connection(principal: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = ClientConnection::new(Principal::from(principal), tx, CancellationToken::new());
        (Arc::new(conn), rx)
    }

    fn room(id: &str) -> ChannelKey {
        ChannelKey::new("room", id)
    }

    /// `k ∈ memberships[c] ⟺ c ∈ by_channel[k]`, and no empty channel entries.
    fn assert_consistent(registry: &ConnectionRegistry) {
        let index = registry.index.read();
        for (id, channels) in &index.memberships {
            assert!(index.connections.contains_key(id));
            for key in channels {
                assert!(index.by_channel.get(key).is_some_and(|m| m.contains(id)));
            }
        }
        for (key, members) in &index.by_channel {
            assert!(!members.is_empty(), "empty channel entry for {key}");
            for id in members {
                assert!(index.memberships.get(id).is_some_and(|c| c.contains(key)));
            }
        }
        for (principal, ids) in &index.by_principal {
            assert!(!ids.is_empty());
            for id in ids {
                assert_eq!(index.connections[id].principal(), principal);
            }
        }
    }

    #[test]
    fn admit_indexes_by_principal() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = make_connection("alice");
        let (a2, _r2) = make_connection("alice");
        let (b1, _r3) = make_connection("bob");
        registry.admit(a1);
        registry.admit(a2);
        registry.admit(b1);

        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.principal_count(), 2);
        assert_eq!(registry.lookup_by_principal(&Principal::from("alice")).len(), 2);
        assert_eq!(registry.lookup_by_principal(&Principal::from("carol")).len(), 0);
        assert_consistent(&registry);
    }

    #[test]
    fn admitted_connection_has_no_memberships() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("alice");
        registry.admit(conn.clone());
        assert!(registry.memberships(&conn.id).is_empty());
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn join_and_leave_are_bidirectional() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("alice");
        registry.admit(conn.clone());

        assert!(registry.join(&conn.id, &room("7")));
        assert!(registry.is_member(&conn.id, &room("7")));
        assert!(registry.memberships(&conn.id).contains(&room("7")));
        assert_consistent(&registry);

        assert!(registry.leave(&conn.id, &room("7")));
        assert!(!registry.is_member(&conn.id, &room("7")));
        assert!(registry.memberships(&conn.id).is_empty());
        assert_eq!(registry.channel_count(), 0);
        assert_consistent(&registry);
    }

    #[test]
    fn duplicate_join_and_stray_leave_report_false() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("alice");
        registry.admit(conn.clone());

        assert!(registry.join(&conn.id, &room("1")));
        assert!(!registry.join(&conn.id, &room("1")));
        assert!(!registry.leave(&conn.id, &room("2")));
        assert_eq!(registry.lookup_by_channel(&room("1")).len(), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn unknown_connection_join_is_noop() {
        let registry = ConnectionRegistry::new();
        let ghost = ConnectionId::new();
        assert!(!registry.join(&ghost, &room("1")));
        assert!(!registry.leave(&ghost, &room("1")));
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn channel_survives_until_last_member_leaves() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = make_connection("alice");
        let (b, _rb) = make_connection("bob");
        registry.admit(a.clone());
        registry.admit(b.clone());
        let _ = registry.join(&a.id, &room("7"));
        let _ = registry.join(&b.id, &room("7"));

        let _ = registry.leave(&a.id, &room("7"));
        assert_eq!(registry.channel_count(), 1);
        assert_eq!(registry.lookup_by_channel(&room("7"))[0].id, b.id);

        let _ = registry.leave(&b.id, &room("7"));
        assert_eq!(registry.channel_count(), 0);
        assert_consistent(&registry);
    }

    #[test]
    fn remove_clears_every_index() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("alice");
        registry.admit(conn.clone());
        let _ = registry.join(&conn.id, &room("1"));
        let _ = registry.join(&conn.id, &room("2"));

        let removed = registry.remove(&conn.id).unwrap();
        assert_eq!(removed.id, conn.id);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.principal_count(), 0);
        assert_eq!(registry.channel_count(), 0);
        assert!(registry.memberships(&conn.id).is_empty());
        assert_consistent(&registry);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("alice");
        let (other, _ro) = make_connection("alice");
        registry.admit(conn.clone());
        registry.admit(other.clone());
        let _ = registry.join(&conn.id, &room("1"));
        let _ = registry.join(&other.id, &room("1"));

        assert!(registry.remove(&conn.id).is_some());
        assert!(registry.remove(&conn.id).is_none());
        assert!(registry.remove(&conn.id).is_none());

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.lookup_by_principal(&Principal::from("alice")).len(), 1);
        assert_eq!(registry.lookup_by_channel(&room("1")).len(), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn readmit_same_id_resets_memberships() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("alice");
        registry.admit(conn.clone());
        let _ = registry.join(&conn.id, &room("1"));

        registry.admit(conn.clone());
        assert_eq!(registry.connection_count(), 1);
        assert!(registry.memberships(&conn.id).is_empty());
        assert_eq!(registry.channel_count(), 0);
        assert_consistent(&registry);
    }

    #[test]
    fn lookup_is_a_snapshot() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = make_connection("alice");
        let (b, _rb) = make_connection("bob");
        registry.admit(a.clone());
        registry.admit(b.clone());
        let _ = registry.join(&a.id, &room("7"));
        let _ = registry.join(&b.id, &room("7"));

        let snapshot = registry.lookup_by_channel(&room("7"));
        let _ = registry.leave(&a.id, &room("7"));
        let _ = registry.remove(&b.id);

        assert_eq!(snapshot.len(), 2);
        assert!(registry.lookup_by_channel(&room("7")).is_empty());
    }

    #[test]
    fn concurrent_join_leave_stays_consistent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut conns = Vec::new();
        for i in 0..8 {
            let (conn, rx) = make_connection(&format!("user_{}", i % 3));
            registry.admit(conn.clone());
            conns.push((conn, rx));
        }

        let threads: Vec<_> = conns
            .iter()
            .map(|(conn, _)| {
                let registry = registry.clone();
                let id = conn.id.clone();
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let key = room(&(n % 5).to_string());
                        let _ = registry.join(&id, &key);
                        if n % 3 == 0 {
                            let _ = registry.leave(&id, &key);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_consistent(&registry);

        for (conn, _) in &conns {
            let _ = registry.remove(&conn.id);
        }
        assert_eq!(registry.channel_count(), 0);
        assert_eq!(registry.principal_count(), 0);
        assert_consistent(&registry);
    }
}
