mod data;
mod membership;
pub mod peer_info;

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::config::Config;
use crate::envelope::LabelStack;
use crate::error::{Error, Result};
use crate::forwarding::{Delivery, Forwarder};
use crate::identifier::Identifier;
use crate::node::peer_info::PeerInfo;
use crate::protocol::{Command, ListEntry, Message, TransactionId, TransactionIds};
use crate::reactor::{Event, FlowId, Timer, TimerKind, Transport};
use crate::routing::RoutingTable;
use crate::storage::{DataObject, Storage};

/// The number of recent transaction ids a node avoids reissuing.
const RECENT_TRANSACTION_IDS: usize = 1024;

/// Where a node stands in joining the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Connecting to a known node to learn who it is.
    Bootstrapping,
    /// Waiting for the node responsible for our identifier to describe its neighborhood.
    Joining,
    Joined,
    /// Alone on a ring of one. Every key is local.
    Root,
}

/// What `ping` is aimed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingTarget {
    /// Routed to whichever node is responsible for the identifier.
    Identifier(Identifier),
    /// A discovery ping on one connection, answered by whoever is at the other end.
    Flow(FlowId),
}

/// The result of `fetch`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// This node is responsible for the key; these are its matching objects.
    Local(Vec<DataObject>),
    /// The request was sent toward the responsible node. Answers arrive as `Outcome::Retrieved`.
    Routed,
}

/// Answers to routed requests, collected until the application drains them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Retrieved(DataObject),
    Listed(Vec<ListEntry>),
    Pong(Identifier),
}

/// A node on the ring.
///
/// A `Node` is driven entirely by `handle_event`: the reactor feeds it transport and timer events
/// one at a time, and it answers through its `Transport` and `Timer`.
pub struct Node {
    id: Identifier,
    listen_addr: SocketAddr,
    config: Config,
    state: NodeState,
    routing_table: RoutingTable,
    storage: Storage,
    forwarder: Forwarder,
    timer: Box<dyn Timer>,
    transaction_ids: TransactionIds,
    /// Outbound connections opened for a known peer that have not been identified yet.
    pending_connects: HashMap<FlowId, Identifier>,
    bootstrap_flow: Option<FlowId>,
    listener: Option<FlowId>,
    stabilize_armed: bool,
    outcomes: Vec<Outcome>,
}

impl Node {
    /// Constructs a `Node` with identifier `id` that will listen on `listen_addr`. The node starts
    /// out as the root of its own ring; call `listen` or `bootstrap` next.
    pub fn configure(
        id: Identifier,
        listen_addr: SocketAddr,
        config: Config,
        transport: Box<dyn Transport>,
        timer: Box<dyn Timer>,
    ) -> Self {
        if id.is_zero() {
            warn!("{} - the all-zero identifier is reserved", id);
        }
        Node {
            id,
            listen_addr,
            routing_table: RoutingTable::new(id, &config),
            storage: Storage::new(config.storage_sweep_period),
            forwarder: Forwarder::new(transport, &config),
            timer,
            config,
            state: NodeState::Root,
            transaction_ids: TransactionIds::new(RECENT_TRANSACTION_IDS),
            pending_connects: HashMap::new(),
            bootstrap_flow: None,
            listener: None,
            stabilize_armed: false,
            outcomes: Vec::new(),
        }
    }

    /// Starts a new ring: accepts connections and becomes its root.
    pub fn listen(&mut self) -> Result<()> {
        self.open_listener()?;
        self.state = NodeState::Root;
        info!("{} - listening on {} as root", self.id, self.listen_addr);
        Ok(())
    }

    /// Joins the ring that the node at `addr` belongs to.
    pub fn bootstrap(&mut self, addr: &SocketAddr) -> Result<()> {
        let flow = self.forwarder.connect(addr)?;
        self.bootstrap_flow = Some(flow);
        self.state = NodeState::Bootstrapping;
        info!("{} - bootstrapping through {} on flow {}", self.id, addr, flow);
        Ok(())
    }

    /// Feeds one reactor event to the node. Errors are logged, never returned.
    pub fn handle_event(&mut self, event: Event) {
        let result = match event {
            Event::ConnectComplete(flow) => self.on_connect_complete(flow),
            Event::Accepted { listener, flow } => {
                debug!("{} - accepted flow {} on listener {}", self.id, flow, listener);
                Ok(())
            },
            Event::Received { flow, bytes } => self.on_received(flow, &bytes),
            Event::WriteComplete(_) => Ok(()),
            Event::Failure(flow) => self.on_failure(flow),
            Event::Timer(TimerKind::Stabilize) => self.on_stabilize_timer(),
            Event::Timer(TimerKind::StorageSweep) => {
                let now = self.timer.now();
                let removed = self.storage.sweep(now, &mut *self.timer);
                if removed > 0 {
                    debug!("{} - expired {} objects", self.id, removed);
                }
                Ok(())
            },
        };
        if let Err(err) = result {
            warn!("{} - {}", self.id, err);
        }
    }

    /// Sends `Ping` to a flow or toward an identifier. Answers arrive as `Outcome::Pong`.
    pub fn ping(&mut self, target: PingTarget) -> Result<()> {
        match target {
            PingTarget::Flow(flow) => self.send_discovery(flow),
            PingTarget::Identifier(id) => self.ping_identifier(&id),
        }
    }

    /// Drains the answers to routed requests received so far.
    pub fn take_outcomes(&mut self) -> Vec<Outcome> {
        std::mem::replace(&mut self.outcomes, Vec::new())
    }

    /// Logs the node's neighborhood.
    pub fn print_state(&self) {
        info!("{} - state {:?}", self.id, self.state);
        for (i, peer) in self.routing_table.connected_successors().iter().enumerate() {
            info!("{} -     successor[{}] = {:?}", self.id, i, peer);
        }
        for (i, peer) in self.routing_table.connected_predecessors().iter().enumerate() {
            info!("{} -     predecessor[{}] = {:?}", self.id, i, peer);
        }
        let fingers = self
            .routing_table
            .fingers()
            .iter()
            .filter(|finger| finger.peer.is_some())
            .count();
        info!(
            "{} -     {} peers known, {} fingers set, {} objects stored",
            self.id,
            self.routing_table.peers().count(),
            fingers,
            self.storage.len()
        );
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn listen_addr(&self) -> &SocketAddr {
        &self.listen_addr
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// The current successor, whether or not it is connected yet.
    pub fn successor(&self) -> Option<Identifier> {
        self.routing_table.successors().first().cloned()
    }

    pub fn predecessor(&self) -> Option<Identifier> {
        self.routing_table.predecessors().first().cloned()
    }

    pub fn peer(&self, id: &Identifier) -> Option<&PeerInfo> {
        self.routing_table.lookup_by_id(id)
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Returns `true` if this node currently owns `key`. A root owns every key. A joined node owns
    /// `(predecessor, self]`, and only its own identifier while it has no predecessor, e.g. right
    /// after its predecessor failed. Other keys are routed until a stabilize fills the gap.
    pub fn is_responsible(&self, key: &Identifier) -> bool {
        match self.state {
            NodeState::Root => true,
            NodeState::Bootstrapping | NodeState::Joining => false,
            NodeState::Joined => self.routing_table.in_local_range(key),
        }
    }

    fn ensure_joined(&self) -> Result<()> {
        match self.state {
            NodeState::Bootstrapping | NodeState::Joining => Err(Error::NotJoined),
            NodeState::Joined | NodeState::Root => Ok(()),
        }
    }

    fn open_listener(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.listener = Some(self.forwarder.listen(&self.listen_addr)?);
        }
        Ok(())
    }

    fn on_received(&mut self, flow: FlowId, bytes: &[u8]) -> Result<()> {
        match self.forwarder.receive(flow, bytes)? {
            Some(delivery) => self.dispatch(delivery),
            None => Ok(()),
        }
    }

    /// Decides whether a delivery is for this node or must travel on toward its head identifier.
    fn dispatch(&mut self, mut delivery: Delivery) -> Result<()> {
        let head = match delivery.dst.peek_identifier() {
            Some(head) => head,
            None if delivery.dst.is_empty() => return self.handle_message(delivery),
            None => return self.forwarder.relay(delivery),
        };
        if head == self.id {
            if delivery.dst.is_single_identifier() {
                return self.handle_message(delivery);
            }
            delivery.dst.pop_identifier();
            return self.dispatch(delivery);
        }
        if self.is_responsible(&head) {
            return self.handle_message(delivery);
        }
        let next = self.next_hop(&head, Some(delivery.flow))?;
        trace!("{} - forwarding toward {} on flow {}", self.id, head, next);
        self.forwarder.forward(delivery, next)
    }

    /// The connection to use toward `destination`: the peer itself if it is directly connected
    /// (and is not `exclude`), otherwise the routing table's choice.
    fn next_hop(&self, destination: &Identifier, exclude: Option<FlowId>) -> Result<FlowId> {
        let direct = self
            .routing_table
            .lookup_by_id(destination)
            .and_then(PeerInfo::connected_flow);
        if let Some(flow) = direct {
            if Some(flow) != exclude {
                return Ok(flow);
            }
        }
        self.routing_table
            .route_for(destination, self.config.finger_routing)
            .and_then(PeerInfo::connected_flow)
            .ok_or_else(|| Error::NoRoute(format!("no connected successor toward {}", destination)))
    }

    fn handle_message(&mut self, delivery: Delivery) -> Result<()> {
        let message = Message::decode(&delivery.body)?;
        trace!(
            "{} - received {:?} on flow {}",
            self.id,
            message.command.command_type(),
            delivery.flow
        );
        let transaction_id = message.transaction_id;
        match message.command {
            Command::Join(join) => self.on_join(join, delivery),
            Command::Ping(ping) => self.on_ping(ping, transaction_id, delivery),
            Command::Connect(connect) => self.on_connect(connect, transaction_id, delivery),
            Command::Notify(notify) => self.on_notify(notify, delivery),
            Command::Stabilize(stabilize) => self.on_stabilize(stabilize, delivery),
            Command::Store(store) => {
                self.on_store(store);
                Ok(())
            },
            Command::Fetch(fetch) => self.on_fetch(fetch, transaction_id, delivery),
            Command::Retrieved(retrieved) => {
                self.on_retrieved(retrieved);
                Ok(())
            },
            Command::Directory(directory) => self.on_directory(directory, transaction_id, delivery),
            Command::List(list) => {
                info!("{} - listed {} keys", self.id, list.entries.len());
                self.outcomes.push(Outcome::Listed(list.entries));
                Ok(())
            },
        }
    }

    fn self_label(&self) -> LabelStack {
        LabelStack::to_identifier(&self.id)
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        self.transaction_ids.next_id()
    }

    /// Answers a delivery along the path it took to get here.
    fn reply(
        &mut self,
        delivery: &Delivery,
        transaction_id: TransactionId,
        command: Command,
    ) -> Result<()> {
        let src = self.self_label();
        self.forwarder.send(
            delivery.flow,
            delivery.src.clone(),
            src,
            &Message::new(transaction_id, command),
        )
    }

    /// Sends a fresh request on `flow` addressed to `dst`.
    fn send_on(&mut self, flow: FlowId, dst: LabelStack, command: Command) -> Result<()> {
        let transaction_id = self.next_transaction_id();
        let src = self.self_label();
        self.forwarder
            .send(flow, dst, src, &Message::new(transaction_id, command))
    }

    /// Sends a fresh request to a directly connected peer.
    fn send_to_peer(&mut self, id: &Identifier, command: Command) -> Result<()> {
        let flow = self
            .routing_table
            .lookup_by_id(id)
            .and_then(PeerInfo::connected_flow)
            .ok_or_else(|| Error::NoRoute(format!("peer {} is not connected", id)))?;
        self.send_on(flow, LabelStack::to_identifier(id), command)
    }

    /// Sends a fresh request toward the identifier at the head of `dst`.
    fn route(&mut self, dst: LabelStack, command: Command) -> Result<()> {
        let head = dst
            .peek_identifier()
            .ok_or_else(|| Error::NoRoute("destination has no identifier".to_string()))?;
        let flow = self.next_hop(&head, None)?;
        self.send_on(flow, dst, command)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration as StdDuration;
    use time::OffsetDateTime;

    use super::{FetchOutcome, Node, NodeState, Outcome};
    use crate::config::Config;
    use crate::envelope::{Frame, LabelStack};
    use crate::error::Error;
    use crate::forwarding::tests::RecordingTransport;
    use crate::identifier::Identifier;
    use crate::node::peer_info::{ConnectionStatus, PeerInfo, Roles};
    use crate::protocol::{Command, Fetch, Message, Ping, PingKind, Store, StoreKind};
    use crate::reactor::{Event, FlowId, Timer, TimerKind};

    struct NullTimer;

    impl Timer for NullTimer {
        fn schedule(&mut self, _delay: StdDuration, _kind: TimerKind) {}

        fn now(&self) -> OffsetDateTime {
            OffsetDateTime::UNIX_EPOCH
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn node(id: u64, transport: &RecordingTransport) -> Node {
        Node::configure(
            Identifier::from(id),
            addr(id as u16),
            Config::default(),
            Box::new(transport.clone()),
            Box::new(NullTimer),
        )
    }

    /// Puts `id` in the routing table as a connected peer on flow `flow`.
    fn connect_peer(node: &mut Node, id: u64, flow: u32) -> Identifier {
        let id = Identifier::from(id);
        let mut peer = PeerInfo::new(id, ConnectionStatus::Connected);
        peer.flow = Some(FlowId(flow));
        peer.listening_addr = Some(addr(flow as u16));
        node.routing_table.insert(peer).unwrap();
        id
    }

    fn frame_bytes(src: LabelStack, dst: LabelStack, command: Command) -> Vec<u8> {
        Frame {
            ttl: 8,
            network_id: Config::default().network_id,
            network_version: 1,
            src,
            dst,
            body: Message::new(42, command).encode().unwrap(),
        }
        .encode()
        .unwrap()
    }

    fn replica_targets(transport: &RecordingTransport) -> Vec<FlowId> {
        transport
            .messages()
            .into_iter()
            .filter(|(_, message)| match &message.command {
                Command::Store(store) => store.kind == StoreKind::Replica,
                _ => false,
            })
            .map(|(flow, _)| flow)
            .collect()
    }

    #[test]
    fn test_root_stores_locally() {
        let transport = RecordingTransport::with_live(&[]);
        let mut node = node(100, &transport);
        node.store(Identifier::from(7), 1, 60, b"hello".to_vec()).unwrap();
        match node.fetch(Identifier::from(7), 1).unwrap() {
            FetchOutcome::Local(objects) => {
                assert_eq!(objects.len(), 1);
                assert_eq!(objects[0].payload, b"hello".to_vec());
            },
            FetchOutcome::Routed => panic!("root must answer locally"),
        }
        assert!(transport.sent.borrow().is_empty());
    }

    #[test]
    fn test_joining_node_rejects_requests() {
        let transport = RecordingTransport::with_live(&[]);
        let mut node = node(100, &transport);
        node.bootstrap(&addr(1)).unwrap();
        assert_eq!(node.state(), NodeState::Bootstrapping);
        match node.store(Identifier::from(7), 1, 60, Vec::new()) {
            Err(Error::NotJoined) => {},
            other => panic!("expected not joined, got {:?}", other),
        }
    }

    #[test]
    fn test_original_store_replicates_to_connected_successors() {
        let transport = RecordingTransport::with_live(&[11, 12, 13, 14]);
        let mut node = node(100, &transport);
        node.state = NodeState::Joined;
        let pred = connect_peer(&mut node, 50, 10);
        node.routing_table.set_predecessor(0, &pred);
        for (i, (id, flow)) in [(110, 11), (120, 12), (130, 13), (140, 14)].iter().enumerate() {
            let id = connect_peer(&mut node, *id, *flow);
            node.routing_table.set_successor(i, &id);
        }

        node.store(Identifier::from(75), 0, 60, b"x".to_vec()).unwrap();
        assert_eq!(replica_targets(&transport), vec![FlowId(11), FlowId(12), FlowId(13)]);
        assert_eq!(node.storage().len(), 1);
    }

    #[test]
    fn test_pending_replica_flushes_on_discovery() {
        let transport = RecordingTransport::with_live(&[11, 12]);
        let mut node = node(100, &transport);
        node.state = NodeState::Joined;
        let pred = connect_peer(&mut node, 50, 10);
        node.routing_table.set_predecessor(0, &pred);
        let first = connect_peer(&mut node, 110, 11);
        node.routing_table.set_successor(0, &first);
        let second = Identifier::from(120);
        node.routing_table
            .insert(PeerInfo::new(second, ConnectionStatus::IssuedConnect))
            .unwrap();
        node.routing_table.set_successor(1, &second);

        node.store(Identifier::from(75), 0, 60, b"x".to_vec()).unwrap();
        assert_eq!(replica_targets(&transport), vec![FlowId(11)]);
        assert_eq!(node.peer(&second).unwrap().pending_stores.len(), 1);

        let ping = Command::Ping(Ping {
            peer_id: second,
            kind: PingKind::DiscoverRequest,
        });
        node.handle_event(Event::Received {
            flow: FlowId(12),
            bytes: frame_bytes(LabelStack::to_identifier(&second), LabelStack::new(), ping),
        });

        assert_eq!(replica_targets(&transport), vec![FlowId(11), FlowId(12)]);
        let peer = node.peer(&second).unwrap();
        assert!(peer.pending_stores.is_empty());
        assert_eq!(peer.status, ConnectionStatus::Connected);
        assert!(peer.roles.contains(Roles::SUCCESSOR_BACKUP));
    }

    #[test]
    fn test_routed_fetch_is_answered_along_source_path() {
        let transport = RecordingTransport::with_live(&[10, 11]);
        let mut node = node(100, &transport);
        node.state = NodeState::Joined;
        let pred = connect_peer(&mut node, 50, 10);
        node.routing_table.set_predecessor(0, &pred);
        let succ = connect_peer(&mut node, 110, 11);
        node.routing_table.set_successor(0, &succ);
        node.store(Identifier::from(75), 3, 60, b"v".to_vec()).unwrap();
        transport.sent.borrow_mut().clear();

        let mut src = LabelStack::to_identifier(&Identifier::from(300));
        src.push_label(FlowId(77));
        let fetch = Command::Fetch(Fetch {
            key: Identifier::from(75),
            data_type: 3,
        });
        node.handle_event(Event::Received {
            flow: FlowId(10),
            bytes: frame_bytes(
                src.clone(),
                LabelStack::to_identifier(&Identifier::from(75)),
                fetch,
            ),
        });

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, FlowId(10));
        assert_eq!(frames[0].1.dst, src);
        match Message::decode(&frames[0].1.body).unwrap().command {
            Command::Retrieved(retrieved) => {
                assert_eq!(retrieved.payload, b"v".to_vec());
                assert_eq!(retrieved.ttl, 60);
            },
            other => panic!("expected retrieved, got {:?}", other),
        }
    }

    #[test]
    fn test_foreign_key_is_forwarded() {
        let transport = RecordingTransport::with_live(&[10, 11]);
        let mut node = node(100, &transport);
        node.state = NodeState::Joined;
        let pred = connect_peer(&mut node, 50, 10);
        node.routing_table.set_predecessor(0, &pred);
        let succ = connect_peer(&mut node, 110, 11);
        node.routing_table.set_successor(0, &succ);

        let store = Command::Store(Store {
            key: Identifier::from(200),
            data_type: 0,
            payload: Vec::new(),
            ttl: 10,
            kind: StoreKind::Original,
        });
        node.handle_event(Event::Received {
            flow: FlowId(10),
            bytes: frame_bytes(
                LabelStack::to_identifier(&pred),
                LabelStack::to_identifier(&Identifier::from(200)),
                store,
            ),
        });

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, FlowId(11));
        assert_eq!(frames[0].1.ttl, 7);
        assert_eq!(frames[0].1.src.peek_label(), Some(FlowId(10)));
        assert!(node.storage().is_empty());
    }

    #[test]
    fn test_ping_response_becomes_outcome() {
        let transport = RecordingTransport::with_live(&[10]);
        let mut node = node(100, &transport);
        let peer = connect_peer(&mut node, 50, 10);
        let pong = Command::Ping(Ping {
            peer_id: peer,
            kind: PingKind::Response,
        });
        node.handle_event(Event::Received {
            flow: FlowId(10),
            bytes: frame_bytes(LabelStack::to_identifier(&peer), node.self_label(), pong),
        });
        assert_eq!(node.take_outcomes(), vec![Outcome::Pong(peer)]);
        assert!(node.take_outcomes().is_empty());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let transport = RecordingTransport::with_live(&[10]);
        let mut node = node(100, &transport);
        node.handle_event(Event::Received {
            flow: FlowId(10),
            bytes: vec![0x10, 0, 0],
        });
        node.handle_event(Event::Received {
            flow: FlowId(10),
            bytes: vec![0xFF; 40],
        });
        assert_eq!(node.state(), NodeState::Root);
        assert!(transport.sent.borrow().is_empty());
    }
}
