//! Hop-by-hop relay of forwarding frames over a `Transport`.
//!
//! The forwarder understands only opaque relay handles. Frames whose destination is empty or starts
//! with an identifier are handed up as a `Delivery`; the node decides what to do with those.

use std::net::SocketAddr;

use crate::config::Config;
use crate::envelope::{Frame, LabelStack};
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::reactor::{FlowId, Transport};

/// A frame addressed to this node, or to an identifier this node must resolve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// The connection the frame arrived on.
    pub flow: FlowId,
    pub ttl: u8,
    pub src: LabelStack,
    pub dst: LabelStack,
    pub body: Vec<u8>,
}

pub struct Forwarder {
    transport: Box<dyn Transport>,
    network_id: u32,
    network_version: u8,
    default_ttl: u8,
}

impl Forwarder {
    pub fn new(transport: Box<dyn Transport>, config: &Config) -> Self {
        Forwarder {
            transport,
            network_id: config.network_id & 0x00FF_FFFF,
            network_version: config.network_version,
            default_ttl: config.default_ttl,
        }
    }

    /// Processes one inbound frame. Frames that only pass through this node are relayed here and
    /// yield `None`, as do expired frames and frames for another overlay.
    pub fn receive(&mut self, flow: FlowId, bytes: &[u8]) -> Result<Option<Delivery>> {
        let mut frame = Frame::decode(bytes)?;
        if frame.network_id != self.network_id {
            debug!(
                "flow {} - dropping frame for network {:06x}",
                flow, frame.network_id
            );
            return Ok(None);
        }
        if frame.ttl == 0 {
            trace!("flow {} - dropping frame with expired ttl", flow);
            return Ok(None);
        }
        if frame.dst.is_empty() || frame.dst.has_identifier_head() {
            return Ok(Some(Delivery {
                flow,
                ttl: frame.ttl,
                src: frame.src,
                dst: frame.dst,
                body: frame.body,
            }));
        }
        self.relay_frame(&mut frame, flow)?;
        Ok(None)
    }

    /// Relays a delivery whose destination head is an opaque handle.
    pub fn relay(&mut self, delivery: Delivery) -> Result<()> {
        let mut frame = Frame {
            ttl: delivery.ttl,
            network_id: self.network_id,
            network_version: self.network_version,
            src: delivery.src,
            dst: delivery.dst,
            body: delivery.body,
        };
        self.relay_frame(&mut frame, delivery.flow)
    }

    fn relay_frame(&mut self, frame: &mut Frame, inbound: FlowId) -> Result<()> {
        let next = match frame.dst.peek_label() {
            Some(next) if self.transport.is_live(next) => next,
            Some(next) => return Err(Error::NoRoute(format!("relay handle {} is not live", next))),
            None => return Err(Error::NoRoute("destination has no relay handle".to_string())),
        };
        frame.dst.pop_label();
        frame.src.push_label(inbound);
        frame.ttl -= 1;
        trace!("flow {} - relaying frame to flow {}", inbound, next);
        self.transport.send(next, frame.encode()?)
    }

    /// Sends a delivery on toward an identifier over `next`, leaving the inbound handle on the
    /// source stack so the reply can find its way back.
    pub fn forward(&mut self, delivery: Delivery, next: FlowId) -> Result<()> {
        let mut src = delivery.src;
        src.push_label(delivery.flow);
        let frame = Frame {
            ttl: delivery.ttl.saturating_sub(1),
            network_id: self.network_id,
            network_version: self.network_version,
            src,
            dst: delivery.dst,
            body: delivery.body,
        };
        self.transport.send(next, frame.encode()?)
    }

    /// Originates `message` on `flow` with a fresh hop budget.
    pub fn send(
        &mut self,
        flow: FlowId,
        dst: LabelStack,
        src: LabelStack,
        message: &Message,
    ) -> Result<()> {
        let frame = Frame {
            ttl: self.default_ttl,
            network_id: self.network_id,
            network_version: self.network_version,
            src,
            dst,
            body: message.encode()?,
        };
        self.transport.send(flow, frame.encode()?)
    }

    pub fn connect(&mut self, addr: &SocketAddr) -> Result<FlowId> {
        self.transport.connect(addr)
    }

    pub fn listen(&mut self, addr: &SocketAddr) -> Result<FlowId> {
        self.transport.listen(addr)
    }

    pub fn disconnect(&mut self, flow: FlowId) {
        self.transport.disconnect(flow)
    }

    pub fn is_live(&self, flow: FlowId) -> bool {
        self.transport.is_live(flow)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::rc::Rc;

    use super::{Delivery, Forwarder};
    use crate::config::Config;
    use crate::envelope::{Frame, LabelStack};
    use crate::error::{Error, Result};
    use crate::identifier::Identifier;
    use crate::protocol::{Command, Message, Ping, PingKind};
    use crate::reactor::{FlowId, Transport};

    /// A transport that records every send and treats a fixed set of flows as live.
    #[derive(Clone, Default)]
    pub struct RecordingTransport {
        pub sent: Rc<RefCell<Vec<(FlowId, Vec<u8>)>>>,
        pub live: Rc<RefCell<HashSet<FlowId>>>,
        pub next_flow: Rc<RefCell<u32>>,
    }

    impl RecordingTransport {
        pub fn with_live(flows: &[u32]) -> Self {
            let ret = RecordingTransport::default();
            ret.live.borrow_mut().extend(flows.iter().map(|flow| FlowId(*flow)));
            *ret.next_flow.borrow_mut() = 100;
            ret
        }

        pub fn frames(&self) -> Vec<(FlowId, Frame)> {
            self.sent
                .borrow()
                .iter()
                .map(|(flow, bytes)| (*flow, Frame::decode(bytes).unwrap()))
                .collect()
        }

        pub fn messages(&self) -> Vec<(FlowId, Message)> {
            self.frames()
                .into_iter()
                .map(|(flow, frame)| (flow, Message::decode(&frame.body).unwrap()))
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn connect(&mut self, _addr: &SocketAddr) -> Result<FlowId> {
            let mut next = self.next_flow.borrow_mut();
            *next += 1;
            Ok(FlowId(*next))
        }

        fn listen(&mut self, _addr: &SocketAddr) -> Result<FlowId> {
            Ok(FlowId(99))
        }

        fn send(&mut self, flow: FlowId, bytes: Vec<u8>) -> Result<()> {
            self.sent.borrow_mut().push((flow, bytes));
            Ok(())
        }

        fn disconnect(&mut self, flow: FlowId) {
            self.live.borrow_mut().remove(&flow);
        }

        fn is_live(&self, flow: FlowId) -> bool {
            self.live.borrow().contains(&flow)
        }
    }

    fn ping_body() -> Vec<u8> {
        Message::new(
            1,
            Command::Ping(Ping {
                peer_id: Identifier::from(1),
                kind: PingKind::Request,
            }),
        )
        .encode()
        .unwrap()
    }

    fn frame(ttl: u8, dst: LabelStack) -> Vec<u8> {
        Frame {
            ttl,
            network_id: Config::default().network_id,
            network_version: 1,
            src: LabelStack::to_identifier(&Identifier::from(1)),
            dst,
            body: ping_body(),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_expired_frames_have_no_effect() {
        let transport = RecordingTransport::with_live(&[7]);
        let mut forwarder = Forwarder::new(Box::new(transport.clone()), &Config::default());

        let mut dst = LabelStack::new();
        dst.push_label(FlowId(7));
        assert_eq!(forwarder.receive(FlowId(3), &frame(0, dst)).unwrap(), None);
        assert_eq!(
            forwarder
                .receive(FlowId(3), &frame(0, LabelStack::new()))
                .unwrap(),
            None
        );
        assert!(transport.sent.borrow().is_empty());
    }

    #[test]
    fn test_identifier_heads_are_delivered() {
        let transport = RecordingTransport::with_live(&[]);
        let mut forwarder = Forwarder::new(Box::new(transport.clone()), &Config::default());
        let dst = LabelStack::to_identifier(&Identifier::from(2));

        let delivery = forwarder.receive(FlowId(3), &frame(5, dst.clone())).unwrap().unwrap();
        assert_eq!(delivery.flow, FlowId(3));
        assert_eq!(delivery.ttl, 5);
        assert_eq!(delivery.dst, dst);
        assert_eq!(delivery.body, ping_body());
        assert!(transport.sent.borrow().is_empty());
    }

    #[test]
    fn test_relay_leaves_breadcrumb() {
        let transport = RecordingTransport::with_live(&[7]);
        let mut forwarder = Forwarder::new(Box::new(transport.clone()), &Config::default());

        let mut dst = LabelStack::to_identifier(&Identifier::from(2));
        dst.push_label(FlowId(7));
        assert_eq!(forwarder.receive(FlowId(3), &frame(5, dst)).unwrap(), None);

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        let (flow, relayed) = &frames[0];
        assert_eq!(*flow, FlowId(7));
        assert_eq!(relayed.ttl, 4);
        assert_eq!(relayed.src.peek_label(), Some(FlowId(3)));
        assert_eq!(relayed.dst.peek_identifier(), Some(Identifier::from(2)));
        assert_eq!(relayed.body, ping_body());
    }

    #[test]
    fn test_dead_relay_handle() {
        let transport = RecordingTransport::with_live(&[]);
        let mut forwarder = Forwarder::new(Box::new(transport.clone()), &Config::default());
        let mut dst = LabelStack::new();
        dst.push_label(FlowId(7));
        match forwarder.receive(FlowId(3), &frame(5, dst)) {
            Err(Error::NoRoute(_)) => {},
            other => panic!("expected no route, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_decrements_ttl() {
        let transport = RecordingTransport::with_live(&[8]);
        let mut forwarder = Forwarder::new(Box::new(transport.clone()), &Config::default());
        let delivery = Delivery {
            flow: FlowId(3),
            ttl: 2,
            src: LabelStack::to_identifier(&Identifier::from(1)),
            dst: LabelStack::to_identifier(&Identifier::from(9)),
            body: ping_body(),
        };
        forwarder.forward(delivery, FlowId(8)).unwrap();
        let frames = transport.frames();
        assert_eq!(frames[0].0, FlowId(8));
        assert_eq!(frames[0].1.ttl, 1);
        assert_eq!(frames[0].1.src.peek_label(), Some(FlowId(3)));
    }

    #[test]
    fn test_foreign_network_is_dropped() {
        let transport = RecordingTransport::with_live(&[]);
        let mut config = Config::default();
        config.network_id = 0x123456;
        let mut forwarder = Forwarder::new(Box::new(transport), &config);
        assert_eq!(
            forwarder.receive(FlowId(3), &frame(5, LabelStack::new())).unwrap(),
            None
        );
    }
}
