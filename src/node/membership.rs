//! Ring membership: discovery, joining, stabilization, the connect handshake and failure handling.

use std::net::SocketAddr;

use super::{Node, NodeState, Outcome};
use crate::envelope::LabelStack;
use crate::error::{Error, Result};
use crate::forwarding::Delivery;
use crate::identifier::Identifier;
use crate::node::peer_info::{ConnectionStatus, PeerInfo, Roles};
use crate::protocol::{
    Command, Connect, Join, Notify, PeerParameter, Ping, PingKind, Stabilize, TransactionId,
};
use crate::reactor::{FlowId, TimerKind};

/// Stands in for the address of a peer whose listening address is not known yet.
fn unspecified_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

impl Node {
    pub(super) fn on_connect_complete(&mut self, flow: FlowId) -> Result<()> {
        debug!("{} - connection complete on flow {}", self.id, flow);
        self.send_discovery(flow)
    }

    /// Sends an unrouted discovery ping; whoever is at the other end answers with its identifier.
    pub(super) fn send_discovery(&mut self, flow: FlowId) -> Result<()> {
        let ping = Command::Ping(Ping {
            peer_id: self.id,
            kind: PingKind::DiscoverRequest,
        });
        self.send_on(flow, LabelStack::new(), ping)
    }

    pub(super) fn ping_identifier(&mut self, id: &Identifier) -> Result<()> {
        self.ensure_joined()?;
        if self.is_responsible(id) {
            info!("{} - this node is responsible for ping {}", self.id, id);
            return Ok(());
        }
        let ping = Command::Ping(Ping {
            peer_id: self.id,
            kind: PingKind::Request,
        });
        self.route(LabelStack::to_identifier(id), ping)
    }

    pub(super) fn on_ping(
        &mut self,
        ping: Ping,
        transaction_id: TransactionId,
        delivery: Delivery,
    ) -> Result<()> {
        match ping.kind {
            PingKind::DiscoverRequest | PingKind::DiscoverResponse => {
                self.on_discovery(ping, transaction_id, delivery)
            },
            PingKind::Request => {
                let pong = Command::Ping(Ping {
                    peer_id: self.id,
                    kind: PingKind::Response,
                });
                self.reply(&delivery, transaction_id, pong)
            },
            PingKind::Response => {
                info!("{} - ping response from {}", self.id, ping.peer_id);
                self.outcomes.push(Outcome::Pong(ping.peer_id));
                Ok(())
            },
        }
    }

    /// Binds the delivering flow to the identifier the other end reports. This is the only way an
    /// accepted connection gets a peer.
    fn on_discovery(
        &mut self,
        ping: Ping,
        transaction_id: TransactionId,
        delivery: Delivery,
    ) -> Result<()> {
        let flow = delivery.flow;
        let id = ping.peer_id;
        if id == self.id {
            return Err(Error::malformed(format!("flow {} leads back to this node", flow)));
        }
        if let Some(expected) = self.pending_connects.remove(&flow) {
            if expected != id {
                warn!(
                    "{} - connected to {} on flow {} while expecting {}",
                    self.id, id, flow, expected
                );
            }
        }

        self.routing_table
            .get_or_insert(&id, ConnectionStatus::Connected)
            .status = ConnectionStatus::Connected;
        self.routing_table.bind_flow(&id, flow);
        debug!("{} - flow {} is peer {}", self.id, flow, id);
        let is_successor = self
            .routing_table
            .lookup_by_id(&id)
            .map_or(false, |peer| peer.roles.contains(Roles::SUCCESSOR));
        if is_successor {
            self.flush_pending_stores(&id)?;
        }
        self.routing_table.update_fingers(&id);

        match ping.kind {
            PingKind::DiscoverRequest => {
                let response = Command::Ping(Ping {
                    peer_id: self.id,
                    kind: PingKind::DiscoverResponse,
                });
                self.reply(&delivery, transaction_id, response)?;
                if self.state == NodeState::Joined {
                    self.stabilize_if_successor(&id)?;
                }
                Ok(())
            },
            _ => match self.state {
                NodeState::Bootstrapping => {
                    self.state = NodeState::Joining;
                    if let Some(peer) = self.routing_table.lookup_by_id_mut(&id) {
                        peer.roles.insert(Roles::BOOTSTRAP);
                    }
                    info!("{} - bootstrap node is {}, joining", self.id, id);
                    self.join(flow)
                },
                NodeState::Joining => {
                    let pending_successor = self
                        .routing_table
                        .lookup_by_id(&id)
                        .map_or(false, |peer| peer.roles.contains(Roles::SUCCESSOR));
                    if pending_successor {
                        info!("{} - reached future successor {}, joining again", self.id, id);
                        self.join(flow)
                    } else {
                        Ok(())
                    }
                },
                NodeState::Joined => self.stabilize_if_successor(&id),
                NodeState::Root => Ok(()),
            },
        }
    }

    /// Stabilizes right away with a successor whose connection just completed, instead of
    /// waiting for the next round.
    fn stabilize_if_successor(&mut self, id: &Identifier) -> Result<()> {
        let is_front = self
            .routing_table
            .front_successor()
            .map_or(false, |peer| peer.id == *id);
        if !is_front {
            return Ok(());
        }
        let stabilize = self.stabilize_command();
        self.send_to_peer(id, stabilize)
    }

    /// Asks whoever owns this node's identifier to take it in.
    fn join(&mut self, flow: FlowId) -> Result<()> {
        let join = Command::Join(Join {
            peer_id: self.id,
            user_id: self.listen_addr.to_string(),
        });
        let dst = self.self_label();
        self.send_on(flow, dst, join)
    }

    pub(super) fn on_join(&mut self, join: Join, delivery: Delivery) -> Result<()> {
        if self.routing_table.lookup_by_flow(delivery.flow).is_none() {
            return Err(Error::UnknownPeer(delivery.flow));
        }
        if join.peer_id == self.id {
            return Err(Error::malformed("join from this node's own identifier"));
        }
        let addr: SocketAddr = join.user_id.parse()?;
        // The joiner earns its key range when it later stabilizes with us directly.
        let peer = self
            .routing_table
            .get_or_insert(&join.peer_id, ConnectionStatus::Disconnected);
        peer.roles.insert(Roles::JOINING);
        if peer.listening_addr.is_none() {
            peer.listening_addr = Some(addr);
        }
        info!("{} - {} ({}) is joining", self.id, join.peer_id, join.user_id);
        let notify = Command::Notify(self.notify_command());
        let transaction_id = self.next_transaction_id();
        self.reply(&delivery, transaction_id, notify)
    }

    fn peer_parameter(peer: &PeerInfo) -> PeerParameter {
        PeerParameter {
            id: peer.id,
            addr: peer.listening_addr.unwrap_or_else(unspecified_addr),
        }
    }

    /// Describes this node and its neighborhood.
    fn notify_command(&self) -> Notify {
        Notify {
            peer_id: self.id,
            listening_addr: self.listen_addr,
            predecessor: self
                .routing_table
                .connected_predecessors()
                .first()
                .map(|peer| Node::peer_parameter(peer)),
            successors: self
                .routing_table
                .connected_successors()
                .iter()
                .map(|peer| Node::peer_parameter(peer))
                .collect(),
        }
    }

    fn stabilize_command(&self) -> Command {
        Command::Stabilize(Stabilize {
            peer_id: self.id,
            listening_addr: self.listen_addr,
        })
    }

    fn connect_command(&self, response: bool) -> Command {
        Command::Connect(Connect {
            peer_id: self.id,
            response,
            candidates: vec![self.listen_addr],
            username: self.id.to_string(),
            password: self.config.password.clone(),
            role: self.config.role.clone(),
            fingerprint: self.config.fingerprint,
        })
    }

    pub(super) fn on_notify(&mut self, notify: Notify, delivery: Delivery) -> Result<()> {
        match self.state {
            NodeState::Joining => self.notify_while_joining(notify, delivery),
            NodeState::Joined => self.notify_while_joined(notify, delivery),
            state => {
                debug!("{} - ignoring notify from {} in {:?}", self.id, notify.peer_id, state);
                Ok(())
            },
        }
    }

    fn notify_while_joining(&mut self, notify: Notify, delivery: Delivery) -> Result<()> {
        let sender = notify.peer_id;
        let connected = self
            .routing_table
            .lookup_by_id(&sender)
            .map_or(false, PeerInfo::is_connected);

        if !connected {
            // The answer came from a node we only reach through relays. Connect to it first and
            // join again once it is a direct peer.
            info!("{} - future successor {} is not a direct peer, connecting", self.id, sender);
            let peer = self
                .routing_table
                .get_or_insert(&sender, ConnectionStatus::IssuedConnect);
            peer.status = ConnectionStatus::IssuedConnect;
            peer.listening_addr = Some(notify.listening_addr);
            self.routing_table.clear_successors();
            self.routing_table.set_successor(0, &sender);
            let connect = self.connect_command(false);
            return self.send_on(delivery.flow, delivery.src, connect);
        }

        self.state = NodeState::Joined;
        if let Some(peer) = self.routing_table.lookup_by_id_mut(&sender) {
            peer.listening_addr = Some(notify.listening_addr);
        }
        self.routing_table.clear_successors();
        self.routing_table.set_successor(0, &sender);
        info!("{} - joined, successor is {}", self.id, sender);
        if notify.predecessor.is_none() {
            // the ring had a single node
            self.routing_table.set_predecessor(0, &sender);
            info!("{} - {} is also the predecessor", self.id, sender);
        }
        let flow = self
            .routing_table
            .lookup_by_id(&sender)
            .and_then(PeerInfo::connected_flow)
            .unwrap_or(delivery.flow);
        self.adopt_successors(&sender, &notify.successors, flow)?;
        self.open_listener()?;
        self.print_state();

        let stabilize = self.stabilize_command();
        self.send_to_peer(&sender, stabilize)?;
        self.arm_stabilize();
        Ok(())
    }

    fn notify_while_joined(&mut self, notify: Notify, delivery: Delivery) -> Result<()> {
        let sender = notify.peer_id;
        if self.routing_table.lookup_by_id(&sender).is_none() {
            return Err(Error::UnknownPeer(delivery.flow));
        }
        if let Some(peer) = self.routing_table.lookup_by_id_mut(&sender) {
            peer.listening_addr = Some(notify.listening_addr);
        }

        let new_successor = match notify.predecessor {
            Some(predecessor) if predecessor.id != self.id => predecessor,
            _ => {
                // our successor is unchanged; refresh the backups it reports
                self.routing_table.clear_successors();
                self.routing_table.set_successor(0, &sender);
                return self.adopt_successors(&sender, &notify.successors, delivery.flow);
            },
        };

        info!("{} - new successor is {}", self.id, new_successor.id);
        // the old successor now follows the new one
        let mut backups = vec![PeerParameter {
            id: sender,
            addr: notify.listening_addr,
        }];
        backups.extend(notify.successors.iter().cloned());
        self.routing_table.clear_successors();

        let status = self
            .routing_table
            .lookup_by_id(&new_successor.id)
            .map(|peer| peer.status);
        match status {
            Some(ConnectionStatus::Connected) => {
                if let Some(peer) = self.routing_table.lookup_by_id_mut(&new_successor.id) {
                    peer.listening_addr = Some(new_successor.addr);
                }
                self.routing_table.set_successor(0, &new_successor.id);
                self.adopt_successors(&new_successor.id, &backups, delivery.flow)?;
                self.print_state();
                info!(
                    "{} - stabilizing with already connected successor {}",
                    self.id, new_successor.id
                );
                let stabilize = self.stabilize_command();
                self.send_to_peer(&new_successor.id, stabilize)
            },
            Some(ConnectionStatus::WaitingAccept) | Some(ConnectionStatus::IssuedConnect) => {
                debug!(
                    "{} - already waiting on a connection with successor {}",
                    self.id, new_successor.id
                );
                self.routing_table.set_successor(0, &new_successor.id);
                self.adopt_successors(&new_successor.id, &backups, delivery.flow)?;
                self.print_state();
                Ok(())
            },
            _ => {
                let peer = self
                    .routing_table
                    .get_or_insert(&new_successor.id, ConnectionStatus::IssuedConnect);
                peer.status = ConnectionStatus::IssuedConnect;
                peer.listening_addr = Some(new_successor.addr);
                self.routing_table.set_successor(0, &new_successor.id);
                self.adopt_successors(&new_successor.id, &backups, delivery.flow)?;
                debug!(
                    "{} - connecting to new successor {} through {}",
                    self.id, new_successor.id, sender
                );
                let mut dst = LabelStack::to_identifier(&new_successor.id);
                dst.push_identifier(&sender);
                let connect = self.connect_command(false);
                self.send_on(delivery.flow, dst, connect)
            },
        }
    }

    /// Fills successor slots 1.. from `candidates`, stopping at this node. Candidates we have no
    /// connection to are sent a `Connect` relayed through `via`, reached on `flow`.
    fn adopt_successors(
        &mut self,
        via: &Identifier,
        candidates: &[PeerParameter],
        flow: FlowId,
    ) -> Result<()> {
        for (i, candidate) in candidates.iter().enumerate() {
            if candidate.id == self.id {
                break;
            }
            if candidate.id == *via {
                continue;
            }
            let status = self
                .routing_table
                .lookup_by_id(&candidate.id)
                .map(|peer| peer.status);
            let needs_connect = match status {
                None | Some(ConnectionStatus::Disconnected) | Some(ConnectionStatus::Failed) => {
                    let peer = self
                        .routing_table
                        .get_or_insert(&candidate.id, ConnectionStatus::IssuedConnect);
                    peer.status = ConnectionStatus::IssuedConnect;
                    peer.listening_addr = Some(candidate.addr);
                    true
                },
                Some(_) => false,
            };
            if !self.routing_table.set_successor(i + 1, &candidate.id) {
                break;
            }
            if needs_connect {
                debug!(
                    "{} - backup successor {} has not connected, sending connect",
                    self.id, candidate.id
                );
                let mut dst = LabelStack::to_identifier(&candidate.id);
                dst.push_identifier(via);
                let connect = self.connect_command(false);
                if let Err(err) = self.send_on(flow, dst, connect) {
                    warn!("{} - connect to {} failed: {}", self.id, candidate.id, err);
                }
            }
        }
        Ok(())
    }

    pub(super) fn on_stabilize(&mut self, stabilize: Stabilize, delivery: Delivery) -> Result<()> {
        let sender = match self.routing_table.lookup_by_flow(delivery.flow) {
            Some(peer) => peer.id,
            None => return Err(Error::UnknownPeer(delivery.flow)),
        };
        if sender != stabilize.peer_id {
            return Err(Error::malformed(format!(
                "stabilize from {} arrived on the flow of {}",
                stabilize.peer_id, sender
            )));
        }
        if let Some(peer) = self.routing_table.lookup_by_id_mut(&sender) {
            peer.listening_addr = Some(stabilize.listening_addr);
        }

        match self.state {
            NodeState::Root => {
                self.state = NodeState::Joined;
                self.admit_predecessor(&sender, None)?;
                self.routing_table.set_successor(0, &sender);
                info!(
                    "{} - root now joined, {} is successor and predecessor",
                    self.id, sender
                );
                self.arm_stabilize();
                Ok(())
            },
            NodeState::Bootstrapping | NodeState::Joining => {
                debug!("{} - ignoring stabilize from {} while joining", self.id, sender);
                Ok(())
            },
            NodeState::Joined => {
                match self.predecessor() {
                    None => {
                        self.admit_predecessor(&sender, None)?;
                        info!("{} - new predecessor set to {}", self.id, sender);
                    },
                    Some(old) if Identifier::between(&old, &self.id, &sender) => {
                        info!("{} - new predecessor {} replaces {}", self.id, sender, old);
                        self.admit_predecessor(&sender, Some(old))?;
                        // tell the old predecessor about its new successor
                        let notify = Command::Notify(self.notify_command());
                        if let Err(err) = self.send_to_peer(&old, notify) {
                            warn!("{} - could not notify old predecessor: {}", self.id, err);
                        }
                    },
                    Some(_) => {},
                }
                let notify = Command::Notify(self.notify_command());
                let transaction_id = self.next_transaction_id();
                self.reply(&delivery, transaction_id, notify)
            },
        }
    }

    /// Makes `id` the predecessor, handing it the keys it now owns if it is joining.
    fn admit_predecessor(&mut self, id: &Identifier, old: Option<Identifier>) -> Result<()> {
        let joining = self
            .routing_table
            .lookup_by_id(id)
            .map_or(false, |peer| peer.roles.contains(Roles::JOINING));
        if joining {
            let low = old.unwrap_or(self.id);
            self.hand_off(id, &low)?;
            if let Some(peer) = self.routing_table.lookup_by_id_mut(id) {
                peer.roles.remove(Roles::JOINING);
            }
        }
        self.routing_table.clear_predecessors();
        self.routing_table.set_predecessor(0, id);
        Ok(())
    }

    pub(super) fn on_connect(
        &mut self,
        connect: Connect,
        transaction_id: TransactionId,
        delivery: Delivery,
    ) -> Result<()> {
        if self.state == NodeState::Bootstrapping {
            debug!("{} - ignoring connect from {} while bootstrapping", self.id, connect.peer_id);
            return Ok(());
        }
        if connect.peer_id == self.id {
            return Err(Error::malformed("connect from this node's own identifier"));
        }
        let addr = *connect
            .candidates
            .first()
            .ok_or_else(|| Error::malformed("connect without candidate addresses"))?;
        if connect.response {
            self.on_connect_response(&connect.peer_id, addr)
        } else {
            self.on_connect_request(&connect.peer_id, addr)?;
            let response = self.connect_command(true);
            self.reply(&delivery, transaction_id, response)
        }
    }

    fn on_connect_request(&mut self, id: &Identifier, addr: SocketAddr) -> Result<()> {
        let self_id = self.id;
        match self.routing_table.lookup_by_id_mut(id) {
            Some(peer) => {
                // Both sides issued a connect: only the smaller identifier opens the connection.
                if peer.status == ConnectionStatus::IssuedConnect && *id < self_id {
                    peer.status = ConnectionStatus::WaitingAccept;
                }
                peer.listening_addr = Some(addr);
                debug!("{} - connect received, updating peer {:?}", self_id, peer);
            },
            None => {
                let mut peer = PeerInfo::new(*id, ConnectionStatus::WaitingAccept);
                peer.listening_addr = Some(addr);
                self.routing_table.insert(peer)?;
                debug!("{} - received connect for first time from {}", self_id, id);
            },
        }
        Ok(())
    }

    fn on_connect_response(&mut self, id: &Identifier, addr: SocketAddr) -> Result<()> {
        let status = self.routing_table.lookup_by_id(id).map(|peer| peer.status);
        if let Some(peer) = self.routing_table.lookup_by_id_mut(id) {
            peer.listening_addr = Some(addr);
        }
        match status {
            Some(ConnectionStatus::Connected) => {
                let is_successor = self
                    .routing_table
                    .lookup_by_id(id)
                    .map_or(false, |peer| peer.roles.contains(Roles::SUCCESSOR));
                if self.state == NodeState::Joining && is_successor {
                    let flow = self
                        .routing_table
                        .lookup_by_id(id)
                        .and_then(PeerInfo::connected_flow)
                        .ok_or_else(|| Error::NoRoute(format!("peer {} has no flow", id)))?;
                    self.join(flow)
                } else {
                    Ok(())
                }
            },
            Some(ConnectionStatus::WaitingAccept) => {
                debug!("{} - waiting for {} to connect to us", self.id, id);
                Ok(())
            },
            _ => {
                if self.pending_connects.values().any(|pending| pending == id) {
                    return Ok(());
                }
                self.routing_table
                    .get_or_insert(id, ConnectionStatus::IssuedConnect)
                    .status = ConnectionStatus::IssuedConnect;
                if let Some(peer) = self.routing_table.lookup_by_id_mut(id) {
                    peer.listening_addr = Some(addr);
                }
                let flow = self.forwarder.connect(&addr)?;
                self.pending_connects.insert(flow, *id);
                debug!("{} - connecting to {} at {} on flow {}", self.id, id, addr, flow);
                Ok(())
            },
        }
    }

    pub(super) fn on_failure(&mut self, flow: FlowId) -> Result<()> {
        self.forwarder.disconnect(flow);
        let id = match self.pending_connects.remove(&flow) {
            Some(id) => Some(id),
            None => self.routing_table.lookup_by_flow(flow).map(|peer| peer.id),
        };
        match id {
            Some(id) => {
                info!("{} - flow {} to {} failed", self.id, flow, id);
                self.on_peer_failed(&id);
                Ok(())
            },
            None if self.bootstrap_flow == Some(flow) && self.state == NodeState::Bootstrapping => {
                warn!("{} - bootstrap connection failed, reverting to root", self.id);
                self.bootstrap_flow = None;
                self.state = NodeState::Root;
                Ok(())
            },
            None => {
                debug!("{} - flow {} failed with no peer associated", self.id, flow);
                Ok(())
            },
        }
    }

    /// Strips a failed peer of its roles and promotes the next successor.
    pub(super) fn on_peer_failed(&mut self, id: &Identifier) {
        let roles = match self.routing_table.lookup_by_id(id) {
            Some(peer) => peer.roles,
            None => return,
        };

        if roles.contains(Roles::SUCCESSOR) || roles.contains(Roles::SUCCESSOR_BACKUP) {
            self.routing_table.remove_successor(id);
            if roles.contains(Roles::SUCCESSOR) {
                info!("{} - successor {} failed", self.id, id);
                self.promote_successor();
            }
        }
        if roles.contains(Roles::PREDECESSOR) {
            info!("{} - predecessor {} failed", self.id, id);
            self.routing_table.remove_predecessor(id);
        }
        self.routing_table.remove_finger(id);

        let flow = self.routing_table.lookup_by_id(id).and_then(|peer| peer.flow);
        if let Some(flow) = flow {
            self.routing_table.unbind_flow(flow);
        }
        if let Some(peer) = self.routing_table.lookup_by_id_mut(id) {
            peer.status = ConnectionStatus::Failed;
            peer.roles = Roles::UNKNOWN;
            peer.pending_stores.clear();
        }
    }

    fn promote_successor(&mut self) {
        let next = match self.routing_table.front_successor() {
            Some(peer) => (peer.id, peer.is_connected()),
            None => {
                if self.state == NodeState::Joined {
                    info!("{} - no more successors, reverting to root", self.id);
                    self.state = NodeState::Root;
                }
                return;
            },
        };
        match next {
            (id, true) => {
                info!("{} - stabilizing with backup successor {}", self.id, id);
                let stabilize = self.stabilize_command();
                if let Err(err) = self.send_to_peer(&id, stabilize) {
                    warn!("{} - {}", self.id, err);
                }
            },
            (id, false) => debug!("{} - new successor {} is not connected yet", self.id, id),
        }
    }

    pub(super) fn arm_stabilize(&mut self) {
        if !self.stabilize_armed {
            self.timer
                .schedule(self.config.stabilize_period, TimerKind::Stabilize);
            self.stabilize_armed = true;
        }
    }

    pub(super) fn on_stabilize_timer(&mut self) -> Result<()> {
        self.stabilize_armed = false;
        if self.state == NodeState::Root {
            return Ok(());
        }
        for id in self.routing_table.evict_failed() {
            debug!("{} - evicted failed peer {}", self.id, id);
        }
        self.arm_stabilize();

        let successor = match self.routing_table.front_successor() {
            Some(peer) if peer.is_connected() => peer.id,
            _ => {
                debug!("{} - stabilizing, but no connected successor", self.id);
                return Ok(());
            },
        };
        let stabilize = self.stabilize_command();
        self.send_to_peer(&successor, stabilize)
    }
}
