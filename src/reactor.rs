//! The interfaces between the ring core and the single-threaded reactor that drives it.
//!
//! The reactor owns sockets and timers. It turns readiness into `Event`s and feeds them to
//! `Node::handle_event` one at a time; the node talks back through `Transport` and `Timer`.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::net::SocketAddr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::Result;

/// An opaque handle naming one live transport connection.
///
/// Flow ids double as relay labels in the forwarding envelope, so `0` and `1` (the identifier
/// sentinel) are never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u32);

/// The first flow id a transport may issue.
pub const FIRST_FLOW_ID: u32 = 2;

impl Display for FlowId {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

/// A byte-message transport. TCP and UDP implementations frame raw socket I/O into whole
/// messages; the core never sees the difference.
pub trait Transport {
    /// Starts connecting to `addr`. Completion is reported later as `Event::ConnectComplete`.
    fn connect(&mut self, addr: &SocketAddr) -> Result<FlowId>;

    /// Starts accepting connections on `addr`. Each one is reported as `Event::Accepted`.
    fn listen(&mut self, addr: &SocketAddr) -> Result<FlowId>;

    /// Queues one whole message on `flow`.
    fn send(&mut self, flow: FlowId, bytes: Vec<u8>) -> Result<()>;

    /// Tears down `flow`.
    fn disconnect(&mut self, flow: FlowId);

    /// Returns `true` if `flow` names a connection that can carry data.
    fn is_live(&self, flow: FlowId) -> bool;
}

/// The timers the core arms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    Stabilize,
    StorageSweep,
}

/// One-shot timers plus the clock they run on. There is no cancellation: a timer that is no
/// longer wanted fires and is ignored.
pub trait Timer {
    fn schedule(&mut self, delay: Duration, kind: TimerKind);

    fn now(&self) -> OffsetDateTime;
}

/// Everything the reactor can tell the core.
#[derive(Debug)]
pub enum Event {
    ConnectComplete(FlowId),
    Accepted { listener: FlowId, flow: FlowId },
    Received { flow: FlowId, bytes: Vec<u8> },
    WriteComplete(FlowId),
    Failure(FlowId),
    Timer(TimerKind),
}
