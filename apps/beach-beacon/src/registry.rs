use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::{ConnectionId, Role, ServerMessage};

/// Sending half of a connection's outbound queue. The transport drains the
/// receiving half into the socket.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection id {0} is already in use")]
    DuplicateId(ConnectionId),
    #[error("connection id must not be empty")]
    InvalidId,
    #[error("connection {0} is not registered")]
    NotConnected(ConnectionId),
}

/// Point-in-time copy of one connection's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub role: Role,
    pub push_token: Option<String>,
    pub peer: Option<ConnectionId>,
}

/// Result of linking two connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingChange {
    /// Former partners whose link was cleared to make room for this pairing.
    pub displaced: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub unassigned: usize,
    pub clients: usize,
    pub admins: usize,
    pub pairings: usize,
}

struct ConnectionEntry {
    id: ConnectionId,
    role: Role,
    push_token: Option<String>,
    peer: Option<ConnectionId>,
    outbound: Outbound,
}

impl ConnectionEntry {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.clone(),
            role: self.role,
            push_token: self.push_token.clone(),
            peer: self.peer.clone(),
        }
    }
}

/// Live connections keyed by registration sequence so role lookups come
/// back in registration order; `index` maps ids onto that sequence.
#[derive(Default)]
struct RegistryInner {
    next_seq: u64,
    entries: BTreeMap<u64, ConnectionEntry>,
    index: HashMap<ConnectionId, u64>,
}

impl RegistryInner {
    fn get(&self, id: &ConnectionId) -> Option<&ConnectionEntry> {
        self.index.get(id).and_then(|seq| self.entries.get(seq))
    }

    fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionEntry> {
        match self.index.get(id) {
            Some(seq) => self.entries.get_mut(seq),
            None => None,
        }
    }

    fn insert(&mut self, id: ConnectionId, outbound: Outbound) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(id.clone(), seq);
        self.entries.insert(
            seq,
            ConnectionEntry {
                id,
                role: Role::Unassigned,
                push_token: None,
                peer: None,
                outbound,
            },
        );
    }

    /// Clear `id`'s link and its partner's back-link. Returns the partner.
    fn detach(&mut self, id: &ConnectionId) -> Option<ConnectionId> {
        let partner = self.get_mut(id)?.peer.take()?;
        if let Some(entry) = self.get_mut(&partner) {
            if entry.peer.as_ref() == Some(id) {
                entry.peer = None;
            }
        }
        Some(partner)
    }

    fn link(&mut self, a: &ConnectionId, b: &ConnectionId) -> Option<PairingChange> {
        if a == b || self.get(a).is_none() || self.get(b).is_none() {
            return None;
        }

        let mut change = PairingChange::default();
        for (side, other) in [(a, b), (b, a)] {
            let current = self.get(side).and_then(|entry| entry.peer.clone());
            if let Some(current) = current {
                if &current != other {
                    self.detach(side);
                    change.displaced.push(current);
                }
            }
        }

        if let Some(entry) = self.get_mut(a) {
            entry.peer = Some(b.clone());
        }
        if let Some(entry) = self.get_mut(b) {
            entry.peer = Some(a.clone());
        }
        Some(change)
    }
}

/// The set of live connections, their roles, push tokens and peer links.
///
/// All state sits behind one lock; every operation takes it once and never
/// holds it across an await point.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under a freshly generated id.
    pub fn register(&self, outbound: Outbound) -> ConnectionId {
        let mut guard = self.inner.lock();
        let mut id = ConnectionId::generate();
        while guard.index.contains_key(&id) {
            id = ConnectionId::generate();
        }
        guard.insert(id.clone(), outbound);
        id
    }

    /// Add a connection under an id chosen by the caller.
    pub fn register_with_id(
        &self,
        id: ConnectionId,
        outbound: Outbound,
    ) -> Result<ConnectionId, RegistryError> {
        if id.as_str().trim().is_empty() {
            return Err(RegistryError::InvalidId);
        }
        let mut guard = self.inner.lock();
        if guard.index.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        guard.insert(id.clone(), outbound);
        Ok(id)
    }

    /// Move a live connection to a caller-chosen id. Its role, token and
    /// position in registration order are kept; peer links follow it.
    pub fn rename(&self, id: &ConnectionId, new_id: ConnectionId) -> Result<(), RegistryError> {
        if new_id.as_str().trim().is_empty() {
            return Err(RegistryError::InvalidId);
        }
        let mut guard = self.inner.lock();
        if !guard.index.contains_key(id) {
            return Err(RegistryError::NotConnected(id.clone()));
        }
        if &new_id == id {
            return Ok(());
        }
        if guard.index.contains_key(&new_id) {
            return Err(RegistryError::DuplicateId(new_id));
        }

        let Some(seq) = guard.index.remove(id) else {
            return Err(RegistryError::NotConnected(id.clone()));
        };
        guard.index.insert(new_id.clone(), seq);
        for entry in guard.entries.values_mut() {
            if entry.peer.as_ref() == Some(id) {
                entry.peer = Some(new_id.clone());
            }
        }
        if let Some(entry) = guard.entries.get_mut(&seq) {
            entry.id = new_id;
        }
        Ok(())
    }

    /// Remove a connection and every peer link pointing at it. No-op for
    /// unknown ids.
    pub fn unregister(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        let mut guard = self.inner.lock();
        let seq = guard.index.remove(id)?;
        let entry = guard.entries.remove(&seq)?;
        for other in guard.entries.values_mut() {
            if other.peer.as_ref() == Some(id) {
                other.peer = None;
            }
        }
        Some(entry.snapshot())
    }

    /// Overwrite a connection's role. Returns the previous role, or `None`
    /// when the connection is already gone.
    pub fn set_role(&self, id: &ConnectionId, role: Role) -> Option<Role> {
        let mut guard = self.inner.lock();
        let entry = guard.get_mut(id)?;
        Some(std::mem::replace(&mut entry.role, role))
    }

    /// Replace a connection's push token; blank tokens clear it. Returns
    /// `false` when the connection is already gone.
    pub fn set_push_token(&self, id: &ConnectionId, token: Option<String>) -> bool {
        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let mut guard = self.inner.lock();
        match guard.get_mut(id) {
            Some(entry) => {
                entry.push_token = token;
                true
            }
            None => false,
        }
    }

    /// Live connections with `role`, in registration order.
    pub fn find_by_role(&self, role: Role) -> Vec<ConnectionId> {
        let guard = self.inner.lock();
        guard
            .entries
            .values()
            .filter(|entry| entry.role == role)
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn find_by_id(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        self.inner.lock().get(id).map(ConnectionEntry::snapshot)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    pub fn push_token(&self, id: &ConnectionId) -> Option<String> {
        self.inner
            .lock()
            .get(id)
            .and_then(|entry| entry.push_token.clone())
    }

    /// Link `a` and `b` as each other's peer. Any other partner either side
    /// had is unlinked first. Fails for self-pairing or unknown ids.
    pub fn pair(&self, a: &ConnectionId, b: &ConnectionId) -> Option<PairingChange> {
        self.inner.lock().link(a, b)
    }

    /// Pair `sender` with the first connection of `role` that is free (or
    /// already paired with `sender`). When every candidate is busy the first
    /// one is taken over.
    pub fn pair_first_available(
        &self,
        sender: &ConnectionId,
        role: Role,
    ) -> Option<(ConnectionId, PairingChange)> {
        let mut guard = self.inner.lock();
        let candidates: Vec<&ConnectionEntry> = guard
            .entries
            .values()
            .filter(|entry| entry.role == role && &entry.id != sender)
            .collect();
        let chosen = candidates
            .iter()
            .find(|entry| entry.peer.is_none() || entry.peer.as_ref() == Some(sender))
            .or_else(|| candidates.first())
            .map(|entry| entry.id.clone())?;

        let change = guard.link(sender, &chosen)?;
        Some((chosen, change))
    }

    /// Clear the connection's peer link on both sides. Returns the former peer.
    pub fn unpair(&self, id: &ConnectionId) -> Option<ConnectionId> {
        self.inner.lock().detach(id)
    }

    /// The connection's current peer, if it is still live.
    pub fn resolve_peer(&self, id: &ConnectionId) -> Option<ConnectionId> {
        let guard = self.inner.lock();
        let peer = guard.get(id)?.peer.clone()?;
        guard.get(&peer).map(|entry| entry.id.clone())
    }

    /// Queue a message on a live connection. Returns `false` if the
    /// connection is gone or its writer has stopped.
    pub fn deliver(&self, id: &ConnectionId, message: ServerMessage) -> bool {
        let guard = self.inner.lock();
        match guard.get(id) {
            Some(entry) => entry.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Every live connection except `sender`, in registration order.
    pub fn all_except(&self, sender: &ConnectionId) -> Vec<ConnectionId> {
        let guard = self.inner.lock();
        guard
            .entries
            .values()
            .filter(|entry| &entry.id != sender)
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let guard = self.inner.lock();
        guard.entries.values().map(ConnectionEntry::snapshot).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let guard = self.inner.lock();
        let mut stats = RegistryStats {
            connections: guard.entries.len(),
            ..RegistryStats::default()
        };
        let mut linked = 0usize;
        for entry in guard.entries.values() {
            match entry.role {
                Role::Unassigned => stats.unassigned += 1,
                Role::Client => stats.clients += 1,
                Role::Admin => stats.admins += 1,
            }
            if entry.peer.is_some() {
                linked += 1;
            }
        }
        stats.pairings = linked / 2;
        stats
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connect(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(tx), rx)
    }

    fn connect_as(
        registry: &ConnectionRegistry,
        role: Role,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (id, rx) = connect(registry);
        registry.set_role(&id, role);
        (id, rx)
    }

    fn assert_symmetric(registry: &ConnectionRegistry) {
        for entry in registry.snapshot() {
            if let Some(peer) = &entry.peer {
                let other = registry.find_by_id(peer).expect("peer must be live");
                assert_eq!(other.peer.as_ref(), Some(&entry.id));
            }
        }
    }

    #[test]
    fn register_starts_unassigned() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry);

        let snapshot = registry.find_by_id(&id).unwrap();
        assert_eq!(snapshot.role, Role::Unassigned);
        assert_eq!(snapshot.push_token, None);
        assert_eq!(snapshot.peer, None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn caller_supplied_ids_must_be_unique() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry
            .register_with_id("phone-1".into(), tx.clone())
            .unwrap();
        assert_eq!(id.as_str(), "phone-1");

        assert_eq!(
            registry.register_with_id("phone-1".into(), tx.clone()),
            Err(RegistryError::DuplicateId("phone-1".into()))
        );
        assert_eq!(
            registry.register_with_id("  ".into(), tx),
            Err(RegistryError::InvalidId)
        );
    }

    #[test]
    fn rename_moves_connection_and_peer_links() {
        let registry = ConnectionRegistry::new();
        let (caller, _caller_rx) = connect_as(&registry, Role::Client);
        let (admin, mut admin_rx) = connect_as(&registry, Role::Admin);
        registry.set_push_token(&admin, Some("fcm-1".into()));
        registry.pair(&caller, &admin).unwrap();

        let renamed = ConnectionId::from("desk");
        registry.rename(&admin, renamed.clone()).unwrap();

        assert!(!registry.contains(&admin));
        let snapshot = registry.find_by_id(&renamed).unwrap();
        assert_eq!(snapshot.role, Role::Admin);
        assert_eq!(snapshot.push_token.as_deref(), Some("fcm-1"));
        assert_eq!(registry.resolve_peer(&caller), Some(renamed.clone()));
        assert_eq!(registry.find_by_role(Role::Admin), vec![renamed.clone()]);
        assert_symmetric(&registry);

        let message = ServerMessage::Ice {
            candidate: json!("c"),
            from: caller.clone(),
        };
        assert!(registry.deliver(&renamed, message.clone()));
        assert_eq!(admin_rx.try_recv().unwrap(), message);
    }

    #[test]
    fn rename_rejects_taken_and_blank_ids() {
        let registry = ConnectionRegistry::new();
        let (first, _first_rx) = connect(&registry);
        let (second, _second_rx) = connect(&registry);
        registry.rename(&first, "bob".into()).unwrap();

        assert_eq!(
            registry.rename(&second, "bob".into()),
            Err(RegistryError::DuplicateId("bob".into()))
        );
        assert_eq!(
            registry.rename(&second, " ".into()),
            Err(RegistryError::InvalidId)
        );
        assert_eq!(registry.rename(&"bob".into(), "bob".into()), Ok(()));
        assert_eq!(
            registry.rename(&first, "alice".into()),
            Err(RegistryError::NotConnected(first.clone()))
        );
        assert!(registry.contains(&second));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn last_role_wins() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry);

        assert_eq!(registry.set_role(&id, Role::Client), Some(Role::Unassigned));
        assert_eq!(registry.set_role(&id, Role::Admin), Some(Role::Client));
        assert_eq!(registry.find_by_id(&id).unwrap().role, Role::Admin);
    }

    #[test]
    fn updates_on_unknown_connection_are_ignored() {
        let registry = ConnectionRegistry::new();
        let ghost = ConnectionId::from("ghost");

        assert_eq!(registry.set_role(&ghost, Role::Admin), None);
        assert!(!registry.set_push_token(&ghost, Some("token".into())));
        assert!(registry.is_empty());
    }

    #[test]
    fn blank_push_token_clears() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry);

        registry.set_push_token(&id, Some(" fcm-1 ".into()));
        assert_eq!(registry.push_token(&id).as_deref(), Some("fcm-1"));
        registry.set_push_token(&id, Some("fcm-2".into()));
        assert_eq!(registry.push_token(&id).as_deref(), Some("fcm-2"));
        registry.set_push_token(&id, Some("   ".into()));
        assert_eq!(registry.push_token(&id), None);
    }

    #[test]
    fn find_by_role_follows_registration_order() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = connect_as(&registry, Role::Admin);
        let (_c1, _r2) = connect_as(&registry, Role::Client);
        let (a2, _r3) = connect_as(&registry, Role::Admin);
        let (a3, _r4) = connect_as(&registry, Role::Admin);

        assert_eq!(registry.find_by_role(Role::Admin), vec![a1.clone(), a2, a3.clone()]);

        registry.unregister(&a1);
        registry.set_role(&a3, Role::Client);
        assert_eq!(registry.find_by_role(Role::Admin).len(), 1);
    }

    #[test]
    fn pair_is_symmetric() {
        let registry = ConnectionRegistry::new();
        let (c, _r1) = connect_as(&registry, Role::Client);
        let (a, _r2) = connect_as(&registry, Role::Admin);

        let change = registry.pair(&c, &a).unwrap();
        assert!(change.displaced.is_empty());
        assert_eq!(registry.resolve_peer(&c), Some(a.clone()));
        assert_eq!(registry.resolve_peer(&a), Some(c.clone()));

        assert_eq!(registry.unpair(&a), Some(c.clone()));
        assert_eq!(registry.resolve_peer(&c), None);
        assert_eq!(registry.resolve_peer(&a), None);
    }

    #[test]
    fn pair_rejects_self_and_unknown() {
        let registry = ConnectionRegistry::new();
        let (c, _r1) = connect(&registry);

        assert!(registry.pair(&c, &c).is_none());
        assert!(registry.pair(&c, &"ghost".into()).is_none());
        assert_eq!(registry.resolve_peer(&c), None);
    }

    #[test]
    fn repairing_clears_abandoned_partner() {
        let registry = ConnectionRegistry::new();
        let (c1, _r1) = connect_as(&registry, Role::Client);
        let (c2, _r2) = connect_as(&registry, Role::Client);
        let (a, _r3) = connect_as(&registry, Role::Admin);

        registry.pair(&c1, &a).unwrap();
        let change = registry.pair(&c2, &a).unwrap();

        assert_eq!(change.displaced, vec![c1.clone()]);
        assert_eq!(registry.resolve_peer(&c1), None);
        assert_eq!(registry.resolve_peer(&a), Some(c2));
        assert_symmetric(&registry);
    }

    #[test]
    fn pair_first_available_prefers_idle_candidates() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = connect_as(&registry, Role::Admin);
        let (a2, _r2) = connect_as(&registry, Role::Admin);
        let (c1, _r3) = connect_as(&registry, Role::Client);
        let (c2, _r4) = connect_as(&registry, Role::Client);
        let (c3, _r5) = connect_as(&registry, Role::Client);

        let (first, _) = registry.pair_first_available(&c1, Role::Admin).unwrap();
        assert_eq!(first, a1);
        let (again, change) = registry.pair_first_available(&c1, Role::Admin).unwrap();
        assert_eq!(again, a1);
        assert!(change.displaced.is_empty());

        let (second, _) = registry.pair_first_available(&c2, Role::Admin).unwrap();
        assert_eq!(second, a2);

        let (takeover, change) = registry.pair_first_available(&c3, Role::Admin).unwrap();
        assert_eq!(takeover, a1);
        assert_eq!(change.displaced, vec![c1.clone()]);
        assert_eq!(registry.resolve_peer(&c1), None);
        assert_symmetric(&registry);
    }

    #[test]
    fn pair_first_available_without_candidates() {
        let registry = ConnectionRegistry::new();
        let (c, _r) = connect_as(&registry, Role::Client);
        assert!(registry.pair_first_available(&c, Role::Admin).is_none());
    }

    #[test]
    fn unregister_clears_peer_links() {
        let registry = ConnectionRegistry::new();
        let (c, _r1) = connect_as(&registry, Role::Client);
        let (a, _r2) = connect_as(&registry, Role::Admin);
        registry.pair(&c, &a).unwrap();

        let removed = registry.unregister(&a).unwrap();
        assert_eq!(removed.peer, Some(c.clone()));
        assert_eq!(registry.find_by_id(&c).unwrap().peer, None);
        assert_eq!(registry.resolve_peer(&c), None);

        assert!(registry.unregister(&a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deliver_only_reaches_live_connections() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx) = connect(&registry);
        let message = ServerMessage::Ice {
            candidate: json!({"candidate": "a"}),
            from: "c".into(),
        };

        assert!(registry.deliver(&a, message.clone()));
        assert_eq!(rx.try_recv().unwrap(), message);

        registry.unregister(&a);
        assert!(!registry.deliver(&a, message));
    }

    #[test]
    fn stats_count_roles_and_pairings() {
        let registry = ConnectionRegistry::new();
        let (c, _r1) = connect_as(&registry, Role::Client);
        let (a, _r2) = connect_as(&registry, Role::Admin);
        let (_u, _r3) = connect(&registry);
        registry.pair(&c, &a).unwrap();

        assert_eq!(
            registry.stats(),
            RegistryStats {
                connections: 3,
                unassigned: 1,
                clients: 1,
                admins: 1,
                pairings: 1,
            }
        );
    }
}
