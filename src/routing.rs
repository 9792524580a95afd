use std::collections::HashMap;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identifier::Identifier;
use crate::node::peer_info::{ConnectionStatus, PeerInfo, Roles};
use crate::reactor::FlowId;

/// One shortcut pointer: the ring position it covers and the peer currently closest at or after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finger {
    pub start: Identifier,
    pub peer: Option<Identifier>,
}

/// A node's view of the ring.
///
/// The peer directory owns every `PeerInfo`; the successor, predecessor and finger tables refer to
/// peers by identifier. The successor and predecessor tables are dense: removal shifts later
/// entries left.
#[derive(Debug)]
pub struct RoutingTable {
    id: Identifier,
    successors: Vec<Identifier>,
    successor_capacity: usize,
    predecessors: Vec<Identifier>,
    predecessor_capacity: usize,
    fingers: Vec<Finger>,
    peers: HashMap<Identifier, PeerInfo>,
    flows: HashMap<FlowId, Identifier>,
}

impl RoutingTable {
    /// Constructs an empty `RoutingTable` for the node `id`.
    pub fn new(id: Identifier, config: &Config) -> Self {
        let shift = config.finger_shift();
        let fingers = (0..config.finger_table_size)
            .map(|i| Finger {
                start: id.add_pow2(i * shift),
                peer: None,
            })
            .collect();
        RoutingTable {
            id,
            successors: Vec::with_capacity(config.successor_table_size),
            successor_capacity: config.successor_table_size,
            predecessors: Vec::with_capacity(config.predecessor_table_size),
            predecessor_capacity: config.predecessor_table_size,
            fingers,
            peers: HashMap::new(),
            flows: HashMap::new(),
        }
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn lookup_by_id(&self, id: &Identifier) -> Option<&PeerInfo> {
        self.peers.get(id)
    }

    pub fn lookup_by_id_mut(&mut self, id: &Identifier) -> Option<&mut PeerInfo> {
        self.peers.get_mut(id)
    }

    pub fn lookup_by_flow(&self, flow: FlowId) -> Option<&PeerInfo> {
        self.flows.get(&flow).and_then(|id| self.peers.get(id))
    }

    pub fn lookup_by_flow_mut(&mut self, flow: FlowId) -> Option<&mut PeerInfo> {
        match self.flows.get(&flow) {
            Some(id) => self.peers.get_mut(id),
            None => None,
        }
    }

    /// Adds a peer to the directory. Each identifier maps to exactly one `PeerInfo`.
    pub fn insert(&mut self, peer: PeerInfo) -> Result<()> {
        if peer.id == self.id || self.peers.contains_key(&peer.id) {
            return Err(Error::DuplicatePeer(peer.id));
        }
        let id = peer.id;
        let flow = peer.flow;
        self.peers.insert(id, peer);
        if let Some(flow) = flow {
            self.bind_flow(&id, flow);
        }
        Ok(())
    }

    /// Returns the peer for `id`, creating it with `status` if it is unknown.
    pub fn get_or_insert(&mut self, id: &Identifier, status: ConnectionStatus) -> &mut PeerInfo {
        self.peers
            .entry(*id)
            .or_insert_with(|| PeerInfo::new(*id, status))
    }

    /// Associates `flow` with the peer `id`, replacing any earlier association of either.
    pub fn bind_flow(&mut self, id: &Identifier, flow: FlowId) {
        if let Some(previous) = self.flows.insert(flow, *id) {
            if previous != *id {
                if let Some(peer) = self.peers.get_mut(&previous) {
                    peer.flow = None;
                }
            }
        }
        if let Some(peer) = self.peers.get_mut(id) {
            if let Some(old_flow) = peer.flow.replace(flow) {
                if old_flow != flow {
                    self.flows.remove(&old_flow);
                }
            }
        }
    }

    /// Forgets `flow`, returning the peer it belonged to.
    pub fn unbind_flow(&mut self, flow: FlowId) -> Option<Identifier> {
        let id = self.flows.remove(&flow)?;
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.flow = None;
        }
        Some(id)
    }

    /// Removes a peer from the directory and from every table slot.
    pub fn evict(&mut self, id: &Identifier) -> Option<PeerInfo> {
        self.remove_successor(id);
        self.remove_predecessor(id);
        self.remove_finger(id);
        let peer = self.peers.remove(id)?;
        if let Some(flow) = peer.flow {
            self.flows.remove(&flow);
        }
        Some(peer)
    }

    /// Evicts every failed peer that no table slot refers to.
    pub fn evict_failed(&mut self) -> Vec<Identifier> {
        let failed: Vec<Identifier> = self
            .peers
            .values()
            .filter(|peer| peer.status == ConnectionStatus::Failed)
            .map(|peer| peer.id)
            .filter(|id| !self.is_referenced(id))
            .collect();
        for id in &failed {
            self.evict(id);
        }
        failed
    }

    fn is_referenced(&self, id: &Identifier) -> bool {
        self.successors.contains(id)
            || self.predecessors.contains(id)
            || self.fingers.iter().any(|finger| finger.peer == Some(*id))
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    /// Places `id` in successor slot `index`, or appends it if `index` is past the end. Returns
    /// `false` if the table is full. The previous occupant of the slot loses its successor role.
    pub fn set_successor(&mut self, index: usize, id: &Identifier) -> bool {
        if self.successors.get(index) == Some(id) {
            self.assign_successor_roles(&[]);
            return true;
        }
        if let Some(position) = self.successors.iter().position(|entry| entry == id) {
            self.successors.remove(position);
        }
        let mut displaced = Vec::new();
        if index < self.successors.len() {
            displaced.push(self.successors[index]);
            self.successors[index] = *id;
        } else if self.successors.len() < self.successor_capacity {
            self.successors.push(*id);
        } else {
            self.assign_successor_roles(&[*id]);
            return false;
        }
        self.assign_successor_roles(&displaced);
        true
    }

    /// Places `id` in predecessor slot `index`, or appends it if `index` is past the end.
    pub fn set_predecessor(&mut self, index: usize, id: &Identifier) -> bool {
        if self.predecessors.get(index) == Some(id) {
            self.assign_predecessor_roles(&[]);
            return true;
        }
        if let Some(position) = self.predecessors.iter().position(|entry| entry == id) {
            self.predecessors.remove(position);
        }
        let mut displaced = Vec::new();
        if index < self.predecessors.len() {
            displaced.push(self.predecessors[index]);
            self.predecessors[index] = *id;
        } else if self.predecessors.len() < self.predecessor_capacity {
            self.predecessors.push(*id);
        } else {
            self.assign_predecessor_roles(&[*id]);
            return false;
        }
        self.assign_predecessor_roles(&displaced);
        true
    }

    /// Removes `id` from the successor table, shifting later entries left. The new front entry
    /// becomes the successor.
    pub fn remove_successor(&mut self, id: &Identifier) -> bool {
        match self.successors.iter().position(|entry| entry == id) {
            Some(position) => {
                self.successors.remove(position);
                self.assign_successor_roles(&[*id]);
                true
            },
            None => false,
        }
    }

    pub fn remove_predecessor(&mut self, id: &Identifier) -> bool {
        match self.predecessors.iter().position(|entry| entry == id) {
            Some(position) => {
                self.predecessors.remove(position);
                self.assign_predecessor_roles(&[*id]);
                true
            },
            None => false,
        }
    }

    pub fn clear_successors(&mut self) {
        let dropped: Vec<Identifier> = self.successors.drain(..).collect();
        self.assign_successor_roles(&dropped);
    }

    pub fn clear_predecessors(&mut self) {
        let dropped: Vec<Identifier> = self.predecessors.drain(..).collect();
        self.assign_predecessor_roles(&dropped);
    }

    /// Makes the roles of `dropped` and of every successor entry agree with the table.
    fn assign_successor_roles(&mut self, dropped: &[Identifier]) {
        for id in dropped {
            if !self.successors.contains(id) {
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.roles.remove(Roles::SUCCESSOR | Roles::SUCCESSOR_BACKUP);
                }
            }
        }
        for (i, id) in self.successors.iter().enumerate() {
            if let Some(peer) = self.peers.get_mut(id) {
                if i == 0 {
                    peer.roles.remove(Roles::SUCCESSOR_BACKUP);
                    peer.roles.insert(Roles::SUCCESSOR);
                } else {
                    peer.roles.remove(Roles::SUCCESSOR);
                    peer.roles.insert(Roles::SUCCESSOR_BACKUP);
                }
            }
        }
    }

    fn assign_predecessor_roles(&mut self, dropped: &[Identifier]) {
        for id in dropped {
            if !self.predecessors.contains(id) {
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.roles.remove(Roles::PREDECESSOR);
                }
            }
        }
        for id in &self.predecessors {
            if let Some(peer) = self.peers.get_mut(id) {
                peer.roles.insert(Roles::PREDECESSOR);
            }
        }
    }

    pub fn successors(&self) -> &[Identifier] {
        &self.successors
    }

    pub fn predecessors(&self) -> &[Identifier] {
        &self.predecessors
    }

    pub fn front_successor(&self) -> Option<&PeerInfo> {
        self.successors.first().and_then(|id| self.peers.get(id))
    }

    pub fn front_predecessor(&self) -> Option<&PeerInfo> {
        self.predecessors.first().and_then(|id| self.peers.get(id))
    }

    /// Returns the connected prefix of the successor table. The scan stops at the first entry that
    /// is not connected, so index 0 is always the current successor.
    pub fn connected_successors(&self) -> Vec<&PeerInfo> {
        self.connected_prefix(&self.successors)
    }

    pub fn connected_predecessors(&self) -> Vec<&PeerInfo> {
        self.connected_prefix(&self.predecessors)
    }

    fn connected_prefix<'a>(&'a self, table: &[Identifier]) -> Vec<&'a PeerInfo> {
        table
            .iter()
            .map(|id| self.peers.get(id))
            .take_while(|peer| peer.map_or(false, PeerInfo::is_connected))
            .flatten()
            .collect()
    }

    /// Returns `true` if `key` falls in `(predecessor, self]`. Without a predecessor only the
    /// node's own identifier is local.
    pub fn in_local_range(&self, key: &Identifier) -> bool {
        if *key == self.id {
            return true;
        }
        match self.predecessors.first() {
            Some(predecessor) => Identifier::between(predecessor, &self.id, key),
            None => false,
        }
    }

    pub fn fingers(&self) -> &[Finger] {
        &self.fingers
    }

    /// Returns the peer in finger slot `index` if it is connected.
    pub fn finger_at(&self, index: usize) -> Option<&PeerInfo> {
        self.fingers
            .get(index)
            .and_then(|finger| finger.peer.as_ref())
            .and_then(|id| self.peers.get(id))
            .filter(|peer| peer.is_connected())
    }

    /// Scans forward from slot `from`, wrapping, for the first connected finger.
    pub fn next_connected_finger(&self, from: usize) -> Option<(usize, &PeerInfo)> {
        let len = self.fingers.len();
        (0..len)
            .map(|offset| (from + offset) % len)
            .find_map(|index| self.finger_at(index).map(|peer| (index, peer)))
    }

    /// Offers `id` to every finger slot. A slot takes the peer if it is clockwise-closer to the
    /// slot's start than the current occupant. Returns the number of slots the peer now holds.
    pub fn update_fingers(&mut self, id: &Identifier) -> usize {
        if *id == self.id {
            return 0;
        }
        let mut displaced = Vec::new();
        let mut held = 0;
        for finger in &mut self.fingers {
            let closer = match finger.peer {
                Some(current) if current == *id => {
                    held += 1;
                    continue;
                },
                Some(current) => finger.start.distance_to(id) < finger.start.distance_to(&current),
                None => true,
            };
            if closer {
                if let Some(current) = finger.peer.replace(*id) {
                    displaced.push(current);
                }
                held += 1;
            }
        }
        if held > 0 {
            if let Some(peer) = self.peers.get_mut(id) {
                peer.roles.insert(Roles::FINGER);
            }
        }
        for id in displaced {
            self.release_finger_role(&id);
        }
        held
    }

    /// Clears every finger slot held by `id`.
    pub fn remove_finger(&mut self, id: &Identifier) {
        for finger in &mut self.fingers {
            if finger.peer == Some(*id) {
                finger.peer = None;
            }
        }
        self.release_finger_role(id);
    }

    fn release_finger_role(&mut self, id: &Identifier) {
        if self.fingers.iter().any(|finger| finger.peer == Some(*id)) {
            return;
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.roles.remove(Roles::FINGER);
        }
    }

    /// Picks the next hop toward `destination`.
    ///
    /// Callers check local responsibility first. The current successor is used if it spans the
    /// destination; otherwise, with `finger_routing`, the connected finger that most closely
    /// precedes the destination; otherwise the current successor anyway.
    pub fn route_for(&self, destination: &Identifier, finger_routing: bool) -> Option<&PeerInfo> {
        let successor = *self.connected_successors().first()?;
        if successor.id == *destination
            || Identifier::between(&self.id, &successor.id, destination)
        {
            return Some(successor);
        }
        if finger_routing {
            let closest = self
                .fingers
                .iter()
                .filter_map(|finger| finger.peer.as_ref())
                .filter(|id| Identifier::between(&self.id, destination, id))
                .filter_map(|id| self.peers.get(id))
                .filter(|peer| peer.is_connected())
                .max_by_key(|peer| self.id.distance_to(&peer.id));
            if let Some(peer) = closest {
                return Some(peer);
            }
        }
        Some(successor)
    }
}

#[cfg(test)]
mod tests {
    use super::RoutingTable;
    use crate::config::Config;
    use crate::error::Error;
    use crate::identifier::Identifier;
    use crate::node::peer_info::{ConnectionStatus, PeerInfo, Roles};
    use crate::reactor::FlowId;

    fn connected(table: &mut RoutingTable, id: u64) -> Identifier {
        let id = Identifier::from(id);
        let mut peer = PeerInfo::new(id, ConnectionStatus::Connected);
        peer.flow = Some(FlowId(id.0[19] as u32 + 10));
        table.insert(peer).unwrap();
        id
    }

    fn pending(table: &mut RoutingTable, id: u64) -> Identifier {
        let id = Identifier::from(id);
        table
            .insert(PeerInfo::new(id, ConnectionStatus::IssuedConnect))
            .unwrap();
        id
    }

    fn roles(table: &RoutingTable, id: &Identifier) -> Roles {
        table.lookup_by_id(id).unwrap().roles
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        connected(&mut table, 5);
        match table.insert(PeerInfo::new(Identifier::from(5), ConnectionStatus::Disconnected)) {
            Err(Error::DuplicatePeer(id)) => assert_eq!(id, Identifier::from(5)),
            other => panic!("expected duplicate peer, got {:?}", other),
        }
        assert!(table.lookup_by_flow(FlowId(15)).is_some());
    }

    #[test]
    fn test_set_successor_demotes_previous() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        let a = connected(&mut table, 110);
        let b = connected(&mut table, 105);

        assert!(table.set_successor(0, &a));
        assert!(table.set_successor(0, &a));
        assert_eq!(table.successors(), &[a]);
        assert!(roles(&table, &a).contains(Roles::SUCCESSOR));

        table.set_successor(0, &b);
        assert_eq!(table.successors(), &[b]);
        assert!(roles(&table, &b).contains(Roles::SUCCESSOR));
        assert!(roles(&table, &a).is_empty());

        table.set_successor(5, &a);
        assert_eq!(table.successors(), &[b, a]);
        assert!(roles(&table, &a).contains(Roles::SUCCESSOR_BACKUP));
    }

    #[test]
    fn test_remove_successor_promotes_backup() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        let a = connected(&mut table, 110);
        let b = connected(&mut table, 120);
        let c = connected(&mut table, 130);
        for (i, id) in [a, b, c].iter().enumerate() {
            table.set_successor(i, id);
        }

        assert!(table.remove_successor(&a));
        assert_eq!(table.successors(), &[b, c]);
        assert!(roles(&table, &b).contains(Roles::SUCCESSOR));
        assert!(!roles(&table, &b).contains(Roles::SUCCESSOR_BACKUP));
        assert!(roles(&table, &a).is_empty());
        assert!(!table.remove_successor(&a));
    }

    #[test]
    fn test_connected_prefix_stops_at_first_gap() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        let a = connected(&mut table, 110);
        let b = pending(&mut table, 120);
        let c = connected(&mut table, 130);
        for (i, id) in [a, b, c].iter().enumerate() {
            table.set_successor(i, id);
        }
        let ids: Vec<Identifier> = table.connected_successors().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a]);

        table.remove_successor(&a);
        assert!(table.connected_successors().is_empty());
        assert!(table.route_for(&Identifier::from(125), false).is_none());
    }

    #[test]
    fn test_predecessor_capacity() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        let a = connected(&mut table, 90);
        let b = connected(&mut table, 95);
        assert!(table.set_predecessor(0, &a));
        assert!(!table.set_predecessor(1, &b));
        assert!(table.set_predecessor(0, &b));
        assert_eq!(table.predecessors(), &[b]);
        assert!(roles(&table, &b).contains(Roles::PREDECESSOR));
        assert!(!roles(&table, &a).contains(Roles::PREDECESSOR));
    }

    #[test]
    fn test_local_range() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        assert!(table.in_local_range(&Identifier::from(100)));
        assert!(!table.in_local_range(&Identifier::from(99)));
        let pred = connected(&mut table, 50);
        table.set_predecessor(0, &pred);
        assert!(table.in_local_range(&Identifier::from(51)));
        assert!(!table.in_local_range(&Identifier::from(50)));
        assert!(!table.in_local_range(&Identifier::from(101)));
    }

    #[test]
    fn test_route_for_successor_only() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        let a = connected(&mut table, 110);
        let far = connected(&mut table, 200);
        table.set_successor(0, &a);
        table.update_fingers(&far);

        assert_eq!(table.route_for(&Identifier::from(105), false).unwrap().id, a);
        assert_eq!(table.route_for(&Identifier::from(110), false).unwrap().id, a);
        assert_eq!(table.route_for(&Identifier::from(250), false).unwrap().id, a);
        assert_eq!(table.route_for(&Identifier::from(250), true).unwrap().id, far);
        assert_eq!(table.route_for(&Identifier::from(150), true).unwrap().id, a);
    }

    #[test]
    fn test_fingers_prefer_closest_peer() {
        let mut config = Config::default();
        config.finger_table_size = 160;
        let mut table = RoutingTable::new(Identifier::from(0), &config);
        let far = connected(&mut table, 1 << 20);
        let near = connected(&mut table, 1 << 4);

        let held_far = table.update_fingers(&far);
        assert_eq!(held_far, 160);
        let held_near = table.update_fingers(&near);
        // starts 2^0 ..= 2^4 precede `near`; starts past 2^20 wrap around to it
        assert_eq!(held_near, 5 + 139);
        assert_eq!(table.fingers()[4].peer, Some(near));
        assert_eq!(table.fingers()[5].peer, Some(far));
        assert_eq!(table.fingers()[20].peer, Some(far));
        assert_eq!(table.fingers()[21].peer, Some(near));
        assert_eq!(table.finger_at(0).unwrap().id, near);
        assert_eq!(table.next_connected_finger(3).unwrap().0, 3);

        table.remove_finger(&near);
        assert!(!roles(&table, &near).contains(Roles::FINGER));
        assert!(roles(&table, &far).contains(Roles::FINGER));
        assert_eq!(table.next_connected_finger(0).unwrap().0, 5);
    }

    #[test]
    fn test_flow_rebinding() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        let a = pending(&mut table, 110);
        table.bind_flow(&a, FlowId(7));
        table.bind_flow(&a, FlowId(8));
        assert!(table.lookup_by_flow(FlowId(7)).is_none());
        assert_eq!(table.lookup_by_flow(FlowId(8)).unwrap().id, a);
        assert_eq!(table.unbind_flow(FlowId(8)), Some(a));
        assert_eq!(table.lookup_by_id(&a).unwrap().flow, None);
    }

    #[test]
    fn test_evict_failed_keeps_referenced_peers() {
        let mut table = RoutingTable::new(Identifier::from(100), &Config::default());
        let a = connected(&mut table, 110);
        let b = connected(&mut table, 120);
        table.set_successor(0, &a);
        for id in &[a, b] {
            table.lookup_by_id_mut(id).unwrap().status = ConnectionStatus::Failed;
        }
        assert_eq!(table.evict_failed(), vec![b]);
        assert!(table.lookup_by_id(&b).is_none());
        assert!(table.lookup_by_flow(FlowId(130)).is_none());
        assert!(table.lookup_by_id(&a).is_some());
    }
}
