#[macro_use]
extern crate log;

mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod forwarding;
pub mod identifier;
pub mod node;
pub mod protocol;
pub mod reactor;
pub mod routing;
pub mod sim;
pub mod storage;

pub use self::config::Config;
pub use self::error::{Error, Result};
pub use self::identifier::Identifier;
pub use self::node::peer_info::{ConnectionStatus, PeerInfo, Roles};
pub use self::node::{FetchOutcome, Node, NodeState, Outcome, PingTarget};
pub use self::reactor::{Event, FlowId, Timer, TimerKind, Transport};
pub use self::storage::{DataObject, Origin};

/// The number of bytes in an identifier.
const IDENTIFIER_LENGTH: usize = 20;

/// The capacity of the successor list.
const SUCCESSOR_TABLE_SIZE: usize = 32;

/// The capacity of the predecessor list.
const PREDECESSOR_TABLE_SIZE: usize = 1;

/// The number of fingers in the finger table.
const FINGER_TABLE_SIZE: usize = 32;

/// The number of successors an original store is replicated to.
const NUM_REPLICAS: usize = 3;

/// Stabilize interval in seconds
const STABILIZE_PERIOD: u64 = 5;

/// Storage expiration sweep interval in seconds
const STORAGE_SWEEP_PERIOD: u64 = 10;

/// Initial hop budget of a forwarded frame.
const DEFAULT_TTL: u8 = 32;

/// The 24-bit overlay id stamped on every frame.
const NETWORK_ID: u32 = 0x00_52_44;

/// The overlay protocol revision stamped on every frame.
const NETWORK_VERSION: u8 = 1;
