//! A deterministic in-memory reactor for running many nodes in one process.
//!
//! Every node gets a `Transport` and a `Timer` backed by one shared fabric: a virtual clock, an
//! ordered event queue and a heap of pending timers. Nothing happens until `run` or `advance` is
//! called, so tests can step a ring through exact interleavings.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration as StdDuration;
use time::OffsetDateTime;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identifier::Identifier;
use crate::node::Node;
use crate::reactor::{Event, FlowId, Timer, TimerKind, Transport, FIRST_FLOW_ID};

/// Events processed by one `run` before the fabric assumes the ring is livelocked.
const MAX_EVENTS_PER_RUN: usize = 1_000_000;

type Endpoint = (usize, FlowId);

struct Fabric {
    now: OffsetDateTime,
    queue: VecDeque<(usize, Event)>,
    timers: BinaryHeap<Reverse<(OffsetDateTime, u64, usize, TimerKind)>>,
    timer_sequence: u64,
    links: BTreeMap<Endpoint, Endpoint>,
    listeners: HashMap<SocketAddr, Endpoint>,
    next_flows: Vec<u32>,
    dead: HashSet<usize>,
}

impl Fabric {
    fn new() -> Self {
        Fabric {
            now: OffsetDateTime::UNIX_EPOCH,
            queue: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_sequence: 0,
            links: BTreeMap::new(),
            listeners: HashMap::new(),
            next_flows: Vec::new(),
            dead: HashSet::new(),
        }
    }

    fn allocate_flow(&mut self, node: usize) -> FlowId {
        let next = &mut self.next_flows[node];
        let flow = FlowId(*next);
        *next += 1;
        flow
    }

    /// Tears down the connection at `endpoint`, telling the far end.
    fn break_link(&mut self, endpoint: Endpoint) -> Option<Endpoint> {
        let far = self.links.remove(&endpoint)?;
        self.links.remove(&far);
        self.queue.push_back((far.0, Event::Failure(far.1)));
        Some(far)
    }
}

struct SimTransport {
    node: usize,
    fabric: Rc<RefCell<Fabric>>,
}

impl Transport for SimTransport {
    fn connect(&mut self, addr: &SocketAddr) -> Result<FlowId> {
        let mut fabric = self.fabric.borrow_mut();
        let flow = fabric.allocate_flow(self.node);
        let listener = fabric.listeners.get(addr).cloned();
        match listener {
            Some((peer, listener)) if !fabric.dead.contains(&peer) => {
                let accepted = fabric.allocate_flow(peer);
                fabric.links.insert((self.node, flow), (peer, accepted));
                fabric.links.insert((peer, accepted), (self.node, flow));
                fabric.queue.push_back((peer, Event::Accepted { listener, flow: accepted }));
                fabric.queue.push_back((self.node, Event::ConnectComplete(flow)));
                trace!(
                    "sim - node {} flow {} linked to node {} flow {}",
                    self.node,
                    flow,
                    peer,
                    accepted
                );
            },
            _ => {
                debug!("sim - nothing listens on {}", addr);
                fabric.queue.push_back((self.node, Event::Failure(flow)));
            },
        }
        Ok(flow)
    }

    fn listen(&mut self, addr: &SocketAddr) -> Result<FlowId> {
        let mut fabric = self.fabric.borrow_mut();
        if fabric.listeners.contains_key(addr) {
            return Err(Error::TransportFailure(format!("{} is already in use", addr)));
        }
        let flow = fabric.allocate_flow(self.node);
        fabric.listeners.insert(*addr, (self.node, flow));
        Ok(flow)
    }

    fn send(&mut self, flow: FlowId, bytes: Vec<u8>) -> Result<()> {
        let mut fabric = self.fabric.borrow_mut();
        let (peer, peer_flow) = fabric
            .links
            .get(&(self.node, flow))
            .cloned()
            .ok_or_else(|| Error::TransportFailure(format!("flow {} is not connected", flow)))?;
        fabric.queue.push_back((peer, Event::Received { flow: peer_flow, bytes }));
        fabric.queue.push_back((self.node, Event::WriteComplete(flow)));
        Ok(())
    }

    fn disconnect(&mut self, flow: FlowId) {
        self.fabric.borrow_mut().break_link((self.node, flow));
    }

    fn is_live(&self, flow: FlowId) -> bool {
        self.fabric.borrow().links.contains_key(&(self.node, flow))
    }
}

struct SimTimer {
    node: usize,
    fabric: Rc<RefCell<Fabric>>,
}

impl Timer for SimTimer {
    fn schedule(&mut self, delay: StdDuration, kind: TimerKind) {
        let mut fabric = self.fabric.borrow_mut();
        let deadline = fabric.now + delay;
        let sequence = fabric.timer_sequence;
        fabric.timer_sequence += 1;
        fabric.timers.push(Reverse((deadline, sequence, self.node, kind)));
    }

    fn now(&self) -> OffsetDateTime {
        self.fabric.borrow().now
    }
}

/// Nodes wired together through the in-memory fabric.
pub struct SimNetwork {
    fabric: Rc<RefCell<Fabric>>,
    nodes: Vec<Node>,
}

impl SimNetwork {
    pub fn new() -> Self {
        SimNetwork {
            fabric: Rc::new(RefCell::new(Fabric::new())),
            nodes: Vec::new(),
        }
    }

    /// Creates a node and returns its index. The node does nothing until it is told to `listen` or
    /// `bootstrap`.
    pub fn add_node(&mut self, id: Identifier, addr: SocketAddr, config: Config) -> usize {
        let index = self.nodes.len();
        self.fabric.borrow_mut().next_flows.push(FIRST_FLOW_ID);
        let transport = SimTransport {
            node: index,
            fabric: Rc::clone(&self.fabric),
        };
        let timer = SimTimer {
            node: index,
            fabric: Rc::clone(&self.fabric),
        };
        self.nodes.push(Node::configure(id, addr, config, Box::new(transport), Box::new(timer)));
        index
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_alive(&self, index: usize) -> bool {
        !self.fabric.borrow().dead.contains(&index)
    }

    pub fn now(&self) -> OffsetDateTime {
        self.fabric.borrow().now
    }

    /// Delivers queued events until the queue is empty. Returns the number delivered.
    pub fn run(&mut self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_EVENTS_PER_RUN {
            let next = {
                let mut fabric = self.fabric.borrow_mut();
                loop {
                    match fabric.queue.pop_front() {
                        Some((node, _)) if fabric.dead.contains(&node) => continue,
                        next => break next,
                    }
                }
            };
            match next {
                Some((node, event)) => {
                    self.nodes[node].handle_event(event);
                    delivered += 1;
                },
                None => return delivered,
            }
        }
        warn!("sim - still busy after {} events", delivered);
        delivered
    }

    /// Moves the clock forward by `duration`, firing every timer that falls due in deadline order
    /// and draining the queue after each.
    pub fn advance(&mut self, duration: StdDuration) {
        self.run();
        let target = self.now() + duration;
        loop {
            let due = {
                let mut fabric = self.fabric.borrow_mut();
                let ready = match fabric.timers.peek() {
                    Some(Reverse((deadline, ..))) => *deadline <= target,
                    None => false,
                };
                if ready {
                    fabric.timers.pop().map(|Reverse(timer)| timer)
                } else {
                    None
                }
            };
            let (deadline, _, node, kind) = match due {
                Some(timer) => timer,
                None => break,
            };
            self.fabric.borrow_mut().now = deadline;
            if self.is_alive(node) {
                self.nodes[node].handle_event(Event::Timer(kind));
            }
            self.run();
        }
        self.fabric.borrow_mut().now = target;
    }

    /// Crashes node `index`: every connection it holds fails and it receives no further events.
    pub fn kill(&mut self, index: usize) {
        let mut fabric = self.fabric.borrow_mut();
        fabric.dead.insert(index);
        fabric.listeners.retain(|_, (node, _)| *node != index);
        let endpoints: Vec<Endpoint> = fabric
            .links
            .keys()
            .filter(|(node, _)| *node == index)
            .cloned()
            .collect();
        for endpoint in endpoints {
            fabric.break_link(endpoint);
        }
        info!("sim - killed node {}", index);
    }

    /// Fails one connection of node `index`. Both ends are told.
    pub fn sever(&mut self, index: usize, flow: FlowId) {
        let mut fabric = self.fabric.borrow_mut();
        if fabric.break_link((index, flow)).is_some() {
            fabric.queue.push_back((index, Event::Failure(flow)));
        }
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        SimNetwork::new()
    }
}
