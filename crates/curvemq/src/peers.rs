//! Peer bookkeeping: the authoritative pubkey-keyed connection table and the
//! index bookkeeping for the outgoing socket slots.
//!
//! Everything here is owned and mutated by the proxy thread alone; the table
//! needs no locking. The outgoing sockets themselves live next to the proxy's
//! poll loop; this module tracks their slot indices and keeps the
//! peer-to-slot mapping consistent when slots are removed.

use crate::types::{Allow, AuthLevel, Pubkey};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Connection state for one authenticated peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerInfo {
    /// Authenticated as an active service node at handshake time.
    pub service_node: bool,
    /// Auth level granted at handshake; never `Denied` for a stored peer.
    pub auth_level: AuthLevel,
    /// Listener routing prefix when the peer holds a connection into us.
    pub incoming: Option<Vec<u8>>,
    /// Slot index of our outbound connection to the peer, if any.
    pub outgoing: Option<usize>,
    /// Last send or receive touching this peer.
    pub last_activity: Instant,
    /// Idle window for the outgoing side; the largest keep-alive seen.
    pub idle_expiry: Duration,
}

impl PeerInfo {
    fn new(auth_level: AuthLevel, service_node: bool) -> Self {
        PeerInfo {
            service_node,
            auth_level,
            incoming: None,
            outgoing: None,
            last_activity: Instant::now(),
            idle_expiry: Duration::ZERO,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Route selection for a queued send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RoutePlan {
    /// Emit on the listener with this routing prefix.
    Incoming(Vec<u8>),
    /// Emit on the outgoing slot at this index.
    Outgoing(usize),
    /// No usable route.
    None,
}

#[derive(Default)]
pub(crate) struct PeerTable {
    peers: HashMap<Pubkey, PeerInfo>,
}

impl PeerTable {
    pub fn get(&self, pubkey: &Pubkey) -> Option<&PeerInfo> {
        self.peers.get(pubkey)
    }

    pub fn get_mut(&mut self, pubkey: &Pubkey) -> Option<&mut PeerInfo> {
        self.peers.get_mut(pubkey)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Records an authenticated incoming route, creating the peer entry on
    /// first contact. A reconnecting peer replaces its previous route.
    pub fn record_incoming(&mut self, pubkey: Pubkey, route: Vec<u8>, allow: Allow) {
        let peer = self
            .peers
            .entry(pubkey)
            .or_insert_with(|| PeerInfo::new(allow.auth, allow.service_node));
        peer.auth_level = allow.auth;
        peer.service_node = allow.service_node;
        peer.incoming = Some(route);
        peer.touch();
    }

    /// Records a new outbound slot for the peer, creating the entry if we had
    /// no connection. A peer we dialed is treated as a service node.
    pub fn record_outgoing(&mut self, pubkey: Pubkey, slot: usize, keep_alive: Duration) {
        let peer = self
            .peers
            .entry(pubkey)
            .or_insert_with(|| PeerInfo::new(AuthLevel::None, true));
        peer.service_node = true;
        peer.outgoing = Some(slot);
        peer.idle_expiry = keep_alive;
        peer.touch();
    }

    /// Picks the route for a send: an incoming-only send may use nothing but
    /// the listener route; otherwise the outgoing slot wins when both exist.
    pub fn route_for(&self, pubkey: &Pubkey, incoming_only: bool) -> RoutePlan {
        let Some(peer) = self.peers.get(pubkey) else {
            return RoutePlan::None;
        };
        if let Some(route) = &peer.incoming {
            if incoming_only || peer.outgoing.is_none() {
                return RoutePlan::Incoming(route.clone());
            }
        }
        if incoming_only {
            return RoutePlan::None;
        }
        match peer.outgoing {
            Some(slot) => RoutePlan::Outgoing(slot),
            None => RoutePlan::None,
        }
    }

    /// Clears the peer's outgoing side and drops the entry when no incoming
    /// route remains. Returns the freed slot index; the caller removes the
    /// socket and then calls [`PeerTable::slot_removed`].
    pub fn clear_outgoing(&mut self, pubkey: &Pubkey) -> Option<usize> {
        let peer = self.peers.get_mut(pubkey)?;
        let slot = peer.outgoing.take();
        if slot.is_some() && peer.incoming.is_none() {
            self.peers.remove(pubkey);
        }
        slot
    }

    /// Clears the peer's incoming route and drops the entry when no outgoing
    /// remains. Returns true if the peer was removed entirely.
    pub fn clear_incoming(&mut self, pubkey: &Pubkey) -> bool {
        let Some(peer) = self.peers.get_mut(pubkey) else {
            return false;
        };
        peer.incoming = None;
        if peer.outgoing.is_none() {
            self.peers.remove(pubkey);
            return true;
        }
        false
    }

    /// Renumbers slot indices after the slot array removed `removed` and
    /// shifted everything behind it down by one.
    pub fn slot_removed(&mut self, removed: usize) {
        for peer in self.peers.values_mut() {
            if let Some(slot) = peer.outgoing.as_mut() {
                debug_assert_ne!(*slot, removed);
                if *slot > removed {
                    *slot -= 1;
                }
            }
        }
    }

    /// Earliest instant at which some outgoing connection becomes idle-expired.
    pub fn next_idle_deadline(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter(|p| p.outgoing.is_some())
            .map(|p| p.last_activity + p.idle_expiry)
            .min()
    }

    /// Pubkeys whose outgoing connection has outlived its idle window.
    pub fn idle_expired(&self, now: Instant) -> Vec<Pubkey> {
        self.peers
            .iter()
            .filter(|(_, p)| {
                p.outgoing.is_some() && now.saturating_duration_since(p.last_activity) > p.idle_expiry
            })
            .map(|(pk, _)| *pk)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Allow;

    fn pk(id: u8) -> Pubkey {
        let mut key = [0u8; 32];
        key[0] = id;
        key
    }

    fn allow_basic() -> Allow {
        Allow::new(AuthLevel::Basic, false)
    }

    #[test]
    fn every_stored_peer_has_a_route() {
        let mut table = PeerTable::default();
        table.record_incoming(pk(1), b"r1".to_vec(), allow_basic());
        table.record_outgoing(pk(2), 0, Duration::from_secs(30));

        assert!(table.clear_incoming(&pk(1)));
        assert!(table.get(&pk(1)).is_none());

        assert_eq!(table.clear_outgoing(&pk(2)), Some(0));
        assert!(table.get(&pk(2)).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn peer_with_both_routes_survives_losing_one() {
        let mut table = PeerTable::default();
        table.record_incoming(pk(1), b"r1".to_vec(), allow_basic());
        table.record_outgoing(pk(1), 0, Duration::from_secs(30));

        assert!(!table.clear_incoming(&pk(1)));
        let peer = table.get(&pk(1)).unwrap();
        assert!(peer.incoming.is_none());
        assert_eq!(peer.outgoing, Some(0));
    }

    #[test]
    fn outgoing_preferred_when_both_routes_exist() {
        let mut table = PeerTable::default();
        table.record_incoming(pk(1), b"r1".to_vec(), allow_basic());
        table.record_outgoing(pk(1), 3, Duration::from_secs(30));

        assert_eq!(table.route_for(&pk(1), false), RoutePlan::Outgoing(3));
        assert_eq!(
            table.route_for(&pk(1), true),
            RoutePlan::Incoming(b"r1".to_vec())
        );
    }

    #[test]
    fn incoming_used_when_it_is_the_only_route() {
        let mut table = PeerTable::default();
        table.record_incoming(pk(1), b"r1".to_vec(), allow_basic());
        assert_eq!(
            table.route_for(&pk(1), false),
            RoutePlan::Incoming(b"r1".to_vec())
        );
    }

    #[test]
    fn incoming_only_send_needs_an_incoming_route() {
        let mut table = PeerTable::default();
        table.record_outgoing(pk(1), 0, Duration::from_secs(30));
        assert_eq!(table.route_for(&pk(1), true), RoutePlan::None);
        assert_eq!(table.route_for(&pk(2), true), RoutePlan::None);
    }

    #[test]
    fn slot_removal_renumbers_later_slots_only() {
        let mut table = PeerTable::default();
        table.record_outgoing(pk(1), 0, Duration::from_secs(30));
        table.record_outgoing(pk(2), 1, Duration::from_secs(30));
        table.record_outgoing(pk(3), 2, Duration::from_secs(30));

        assert_eq!(table.clear_outgoing(&pk(2)), Some(1));
        table.slot_removed(1);

        assert_eq!(table.get(&pk(1)).unwrap().outgoing, Some(0));
        assert_eq!(table.get(&pk(3)).unwrap().outgoing, Some(1));
    }

    #[test]
    fn dialed_peer_is_marked_service_node() {
        let mut table = PeerTable::default();
        table.record_outgoing(pk(1), 0, Duration::from_secs(30));
        let peer = table.get(&pk(1)).unwrap();
        assert!(peer.service_node);
        assert_eq!(peer.auth_level, AuthLevel::None);
    }

    #[test]
    fn reconnect_replaces_incoming_route_and_auth() {
        let mut table = PeerTable::default();
        table.record_incoming(pk(1), b"old".to_vec(), allow_basic());
        table.record_incoming(pk(1), b"new".to_vec(), Allow::new(AuthLevel::Admin, true));
        let peer = table.get(&pk(1)).unwrap();
        assert_eq!(peer.incoming.as_deref(), Some(b"new".as_ref()));
        assert_eq!(peer.auth_level, AuthLevel::Admin);
        assert!(peer.service_node);
    }

    #[test]
    fn idle_expiry_tracks_the_oldest_outgoing() {
        let mut table = PeerTable::default();
        table.record_outgoing(pk(1), 0, Duration::from_millis(50));
        table.record_outgoing(pk(2), 1, Duration::from_secs(60));
        // Incoming-only peers never participate in the sweep.
        table.record_incoming(pk(3), b"r3".to_vec(), allow_basic());

        let now = Instant::now();
        assert!(table.idle_expired(now).is_empty());

        let later = now + Duration::from_millis(200);
        let expired = table.idle_expired(later);
        assert_eq!(expired, vec![pk(1)]);

        let deadline = table.next_idle_deadline().unwrap();
        assert!(deadline <= now + Duration::from_millis(60));
    }
}
