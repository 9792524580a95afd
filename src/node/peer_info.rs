use std::fmt::{Debug, Formatter, Result};
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};

use crate::identifier::Identifier;
use crate::reactor::FlowId;
use crate::storage::DataObject;

/// The parts a peer plays for this node. A peer may hold several at once, e.g. successor and
/// predecessor in a two-node ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Roles(u8);

impl Roles {
    pub const UNKNOWN: Roles = Roles(0);
    pub const SUCCESSOR: Roles = Roles(1);
    pub const SUCCESSOR_BACKUP: Roles = Roles(1 << 1);
    pub const PREDECESSOR: Roles = Roles(1 << 2);
    pub const FINGER: Roles = Roles(1 << 3);
    pub const JOINING: Roles = Roles(1 << 4);
    pub const BOOTSTRAP: Roles = Roles(1 << 5);

    const NAMES: [(Roles, &'static str); 6] = [
        (Roles::SUCCESSOR, "successor"),
        (Roles::SUCCESSOR_BACKUP, "successor-backup"),
        (Roles::PREDECESSOR, "predecessor"),
        (Roles::FINGER, "finger"),
        (Roles::JOINING, "joining"),
        (Roles::BOOTSTRAP, "bootstrap"),
    ];

    pub fn contains(self, other: Roles) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Roles) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Roles) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Roles {
    type Output = Roles;

    fn bitor(self, rhs: Roles) -> Roles {
        Roles(self.0 | rhs.0)
    }
}

impl BitOrAssign for Roles {
    fn bitor_assign(&mut self, rhs: Roles) {
        self.0 |= rhs.0;
    }
}

impl Debug for Roles {
    fn fmt(&self, f: &mut Formatter) -> Result {
        if self.is_empty() {
            return write!(f, "unknown");
        }
        let names: Vec<&str> = Roles::NAMES
            .iter()
            .filter(|(role, _)| self.contains(*role))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    /// We sent a `Connect` and will open the transport connection once it is answered.
    IssuedConnect,
    /// The other side opens the transport connection.
    WaitingAccept,
    Connected,
    Failed,
}

/// Everything a node knows about one remote node.
#[derive(Clone)]
pub struct PeerInfo {
    pub id: Identifier,
    pub flow: Option<FlowId>,
    pub listening_addr: Option<SocketAddr>,
    pub roles: Roles,
    pub status: ConnectionStatus,
    /// Replicas waiting for this peer's connection to complete.
    pub pending_stores: Vec<DataObject>,
}

impl PeerInfo {
    pub fn new(id: Identifier, status: ConnectionStatus) -> Self {
        PeerInfo {
            id,
            flow: None,
            listening_addr: None,
            roles: Roles::UNKNOWN,
            status,
            pending_stores: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.flow.is_some()
    }

    /// The flow to reach this peer on, if it is connected.
    pub fn connected_flow(&self) -> Option<FlowId> {
        if self.status == ConnectionStatus::Connected {
            self.flow
        } else {
            None
        }
    }
}

impl Debug for PeerInfo {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self.listening_addr {
            Some(addr) => write!(f, "{} - {}", addr, self.id)?,
            None => write!(f, "? - {}", self.id)?,
        }
        write!(f, " [{:?}, {:?}", self.status, self.roles)?;
        if let Some(flow) = self.flow {
            write!(f, ", flow {}", flow)?;
        }
        write!(f, "]")
    }
}
