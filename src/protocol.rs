//! Command messages and their wire form.
//!
//! A command is an 8-byte header (extension flags, type tag, body length, transaction id) followed
//! by a body of type-length-value parameters. Decoding dispatches on the type tag and skips
//! parameter types it does not know.

use rand::Rng;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::net::SocketAddr;

use crate::codec::{Reader, Writer};
use crate::error::{Error, Result};
use crate::identifier::Identifier;

pub type TransactionId = u32;

/// The size of the fixed command header.
pub const HEADER_LENGTH: usize = 8;

/// Type tag of each command on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandType {
    Join = 0,
    Ping = 1,
    Fetch = 2,
    Store = 3,
    Connect = 4,
    Notify = 5,
    Stabilize = 6,
    Retrieved = 7,
    Directory = 8,
    List = 9,
}

impl TryFrom<u8> for CommandType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => CommandType::Join,
            1 => CommandType::Ping,
            2 => CommandType::Fetch,
            3 => CommandType::Store,
            4 => CommandType::Connect,
            5 => CommandType::Notify,
            6 => CommandType::Stabilize,
            7 => CommandType::Retrieved,
            8 => CommandType::Directory,
            9 => CommandType::List,
            _ => return Err(Error::malformed(format!("unknown command type {}", tag))),
        })
    }
}

mod param {
    pub const PEER_ID: u8 = 0x01;
    pub const USER_ID: u8 = 0x02;
    pub const SUBTYPE: u8 = 0x03;
    pub const RESPONSE: u8 = 0x04;
    pub const CANDIDATE: u8 = 0x05;
    pub const USERNAME: u8 = 0x06;
    pub const PASSWORD: u8 = 0x07;
    pub const ROLE: u8 = 0x08;
    pub const FINGERPRINT: u8 = 0x09;
    pub const LISTENING_ADDRESS: u8 = 0x0A;
    pub const PREDECESSOR: u8 = 0x0B;
    pub const SUCCESSOR: u8 = 0x0C;
    pub const KEY: u8 = 0x0D;
    pub const DATA_TYPE: u8 = 0x0E;
    pub const PAYLOAD: u8 = 0x0F;
    pub const TTL: u8 = 0x10;
    pub const RANGE_LOW: u8 = 0x11;
    pub const RANGE_HIGH: u8 = 0x12;
    pub const LIST_ENTRY: u8 = 0x13;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingKind {
    Request = 0,
    Response = 1,
    DiscoverRequest = 2,
    DiscoverResponse = 3,
}

impl TryFrom<u8> for PingKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => PingKind::Request,
            1 => PingKind::Response,
            2 => PingKind::DiscoverRequest,
            3 => PingKind::DiscoverResponse,
            _ => return Err(Error::malformed(format!("unknown ping subtype {}", value))),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Original = 0,
    Replica = 1,
}

impl TryFrom<u8> for StoreKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StoreKind::Original),
            1 => Ok(StoreKind::Replica),
            _ => Err(Error::malformed(format!("unknown store subtype {}", value))),
        }
    }
}

/// A peer as advertised in a `Notify`: where it sits on the ring and where it listens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerParameter {
    pub id: Identifier,
    pub addr: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Join {
    pub peer_id: Identifier,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub peer_id: Identifier,
    pub kind: PingKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub peer_id: Identifier,
    pub response: bool,
    pub candidates: Vec<SocketAddr>,
    pub username: String,
    pub password: String,
    pub role: String,
    pub fingerprint: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notify {
    pub peer_id: Identifier,
    pub listening_addr: SocketAddr,
    /// `None` goes on the wire as the all-zero identifier.
    pub predecessor: Option<PeerParameter>,
    pub successors: Vec<PeerParameter>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stabilize {
    pub peer_id: Identifier,
    pub listening_addr: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Store {
    pub key: Identifier,
    pub data_type: u32,
    pub payload: Vec<u8>,
    pub ttl: u32,
    pub kind: StoreKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetch {
    pub key: Identifier,
    pub data_type: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Retrieved {
    pub key: Identifier,
    pub data_type: u32,
    pub payload: Vec<u8>,
    pub ttl: u32,
}

/// Asks the node responsible for `high` which keys it holds in `(low, high]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directory {
    pub peer_id: Identifier,
    pub low: Identifier,
    pub high: Identifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListEntry {
    pub key: Identifier,
    pub data_type: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct List {
    pub entries: Vec<ListEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Join(Join),
    Ping(Ping),
    Fetch(Fetch),
    Store(Store),
    Connect(Connect),
    Notify(Notify),
    Stabilize(Stabilize),
    Retrieved(Retrieved),
    Directory(Directory),
    List(List),
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Join(_) => CommandType::Join,
            Command::Ping(_) => CommandType::Ping,
            Command::Fetch(_) => CommandType::Fetch,
            Command::Store(_) => CommandType::Store,
            Command::Connect(_) => CommandType::Connect,
            Command::Notify(_) => CommandType::Notify,
            Command::Stabilize(_) => CommandType::Stabilize,
            Command::Retrieved(_) => CommandType::Retrieved,
            Command::Directory(_) => CommandType::Directory,
            Command::List(_) => CommandType::List,
        }
    }
}

/// A command together with the transaction id that pairs requests and responses on one hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub transaction_id: TransactionId,
    pub command: Command,
}

impl Message {
    pub fn new(transaction_id: TransactionId, command: Command) -> Self {
        Message {
            transaction_id,
            command,
        }
    }

    /// Encodes the message. Length fields are always computed from the content.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Writer::new();
        encode_body(&mut body, &self.command)?;
        if body.len() > usize::from(u16::MAX) {
            return Err(Error::MessageTooLarge(body.len()));
        }

        // The length field counts the body only, not the transaction id that follows it.
        let mut writer = Writer::new();
        writer.put_u8(0);
        writer.put_u8(self.command.command_type() as u8);
        writer.put_u16(body.len() as u16);
        writer.put_u32(self.transaction_id);
        writer.put_bytes(&body.into_inner());
        Ok(writer.into_inner())
    }

    /// Decodes exactly one message occupying the whole of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Message> {
        let mut reader = Reader::new(bytes);
        let _ext = reader.read_u8()?;
        let command_type = CommandType::try_from(reader.read_u8()?)?;
        let body_len = usize::from(reader.read_u16()?);
        let transaction_id = reader.read_u32()?;
        let body = reader.read_bytes(body_len)?;
        reader.finish("command body")?;

        let params = Params::parse(body)?;
        let command = match command_type {
            CommandType::Join => Command::Join(Join {
                peer_id: params.identifier(param::PEER_ID, "Join")?,
                user_id: params.string(param::USER_ID)?.unwrap_or_default(),
            }),
            CommandType::Ping => Command::Ping(Ping {
                peer_id: params.identifier(param::PEER_ID, "Ping")?,
                kind: PingKind::try_from(params.u8(param::SUBTYPE, "Ping")?)?,
            }),
            CommandType::Fetch => Command::Fetch(Fetch {
                key: params.identifier(param::KEY, "Fetch")?,
                data_type: params.u32(param::DATA_TYPE, "Fetch")?,
            }),
            CommandType::Store => Command::Store(Store {
                key: params.identifier(param::KEY, "Store")?,
                data_type: params.u32(param::DATA_TYPE, "Store")?,
                payload: params.bytes(param::PAYLOAD).unwrap_or_default(),
                ttl: params.u32(param::TTL, "Store")?,
                kind: StoreKind::try_from(params.u8(param::SUBTYPE, "Store")?)?,
            }),
            CommandType::Connect => {
                let candidates = params
                    .all(param::CANDIDATE)
                    .map(|value| read_whole(value, Reader::read_addr))
                    .collect::<Result<Vec<_>>>()?;
                Command::Connect(Connect {
                    peer_id: params.identifier(param::PEER_ID, "Connect")?,
                    response: params.u8(param::RESPONSE, "Connect")? != 0,
                    candidates,
                    username: params.string(param::USERNAME)?.unwrap_or_default(),
                    password: params.string(param::PASSWORD)?.unwrap_or_default(),
                    role: params.string(param::ROLE)?.unwrap_or_default(),
                    fingerprint: params.u32(param::FINGERPRINT, "Connect")?,
                })
            },
            CommandType::Notify => {
                let predecessor = match params.first(param::PREDECESSOR) {
                    Some(value) => {
                        let peer = read_whole(value, read_peer)?;
                        if peer.id.is_zero() {
                            None
                        } else {
                            Some(peer)
                        }
                    },
                    None => return Err(missing("predecessor", "Notify")),
                };
                let successors = params
                    .all(param::SUCCESSOR)
                    .map(|value| read_whole(value, read_peer))
                    .collect::<Result<Vec<_>>>()?;
                Command::Notify(Notify {
                    peer_id: params.identifier(param::PEER_ID, "Notify")?,
                    listening_addr: params.addr(param::LISTENING_ADDRESS, "Notify")?,
                    predecessor,
                    successors,
                })
            },
            CommandType::Stabilize => Command::Stabilize(Stabilize {
                peer_id: params.identifier(param::PEER_ID, "Stabilize")?,
                listening_addr: params.addr(param::LISTENING_ADDRESS, "Stabilize")?,
            }),
            CommandType::Retrieved => Command::Retrieved(Retrieved {
                key: params.identifier(param::KEY, "Retrieved")?,
                data_type: params.u32(param::DATA_TYPE, "Retrieved")?,
                payload: params.bytes(param::PAYLOAD).unwrap_or_default(),
                ttl: params.u32(param::TTL, "Retrieved")?,
            }),
            CommandType::Directory => Command::Directory(Directory {
                peer_id: params.identifier(param::PEER_ID, "Directory")?,
                low: params.identifier(param::RANGE_LOW, "Directory")?,
                high: params.identifier(param::RANGE_HIGH, "Directory")?,
            }),
            CommandType::List => {
                let entries = params
                    .all(param::LIST_ENTRY)
                    .map(|value| {
                        read_whole(value, |reader| {
                            Ok(ListEntry {
                                key: reader.read_identifier()?,
                                data_type: reader.read_u32()?,
                            })
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Command::List(List { entries })
            },
        };

        Ok(Message {
            transaction_id,
            command,
        })
    }
}

fn encode_body(writer: &mut Writer, command: &Command) -> Result<()> {
    match command {
        Command::Join(join) => {
            put_param(writer, param::PEER_ID, |w| w.put_identifier(&join.peer_id))?;
            put_param(writer, param::USER_ID, |w| w.put_bytes(join.user_id.as_bytes()))?;
        },
        Command::Ping(ping) => {
            put_param(writer, param::PEER_ID, |w| w.put_identifier(&ping.peer_id))?;
            put_param(writer, param::SUBTYPE, |w| w.put_u8(ping.kind as u8))?;
        },
        Command::Fetch(fetch) => {
            put_param(writer, param::KEY, |w| w.put_identifier(&fetch.key))?;
            put_param(writer, param::DATA_TYPE, |w| w.put_u32(fetch.data_type))?;
        },
        Command::Store(store) => {
            put_param(writer, param::KEY, |w| w.put_identifier(&store.key))?;
            put_param(writer, param::DATA_TYPE, |w| w.put_u32(store.data_type))?;
            put_param(writer, param::PAYLOAD, |w| w.put_bytes(&store.payload))?;
            put_param(writer, param::TTL, |w| w.put_u32(store.ttl))?;
            put_param(writer, param::SUBTYPE, |w| w.put_u8(store.kind as u8))?;
        },
        Command::Connect(connect) => {
            put_param(writer, param::PEER_ID, |w| w.put_identifier(&connect.peer_id))?;
            put_param(writer, param::RESPONSE, |w| w.put_u8(connect.response as u8))?;
            for candidate in &connect.candidates {
                put_param(writer, param::CANDIDATE, |w| w.put_addr(candidate))?;
            }
            put_param(writer, param::USERNAME, |w| w.put_bytes(connect.username.as_bytes()))?;
            put_param(writer, param::PASSWORD, |w| w.put_bytes(connect.password.as_bytes()))?;
            put_param(writer, param::ROLE, |w| w.put_bytes(connect.role.as_bytes()))?;
            put_param(writer, param::FINGERPRINT, |w| w.put_u32(connect.fingerprint))?;
        },
        Command::Notify(notify) => {
            put_param(writer, param::PEER_ID, |w| w.put_identifier(&notify.peer_id))?;
            put_param(writer, param::LISTENING_ADDRESS, |w| w.put_addr(&notify.listening_addr))?;
            let predecessor = notify.predecessor.unwrap_or(PeerParameter {
                id: Identifier::zero(),
                addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            });
            put_param(writer, param::PREDECESSOR, |w| put_peer(w, &predecessor))?;
            for successor in &notify.successors {
                put_param(writer, param::SUCCESSOR, |w| put_peer(w, successor))?;
            }
        },
        Command::Stabilize(stabilize) => {
            put_param(writer, param::PEER_ID, |w| w.put_identifier(&stabilize.peer_id))?;
            put_param(writer, param::LISTENING_ADDRESS, |w| {
                w.put_addr(&stabilize.listening_addr)
            })?;
        },
        Command::Retrieved(retrieved) => {
            put_param(writer, param::KEY, |w| w.put_identifier(&retrieved.key))?;
            put_param(writer, param::DATA_TYPE, |w| w.put_u32(retrieved.data_type))?;
            put_param(writer, param::PAYLOAD, |w| w.put_bytes(&retrieved.payload))?;
            put_param(writer, param::TTL, |w| w.put_u32(retrieved.ttl))?;
        },
        Command::Directory(directory) => {
            put_param(writer, param::PEER_ID, |w| w.put_identifier(&directory.peer_id))?;
            put_param(writer, param::RANGE_LOW, |w| w.put_identifier(&directory.low))?;
            put_param(writer, param::RANGE_HIGH, |w| w.put_identifier(&directory.high))?;
        },
        Command::List(list) => {
            for entry in &list.entries {
                put_param(writer, param::LIST_ENTRY, |w| {
                    w.put_identifier(&entry.key);
                    w.put_u32(entry.data_type);
                })?;
            }
        },
    }
    Ok(())
}

fn put_param<F>(writer: &mut Writer, param_type: u8, value: F) -> Result<()>
where
    F: FnOnce(&mut Writer),
{
    writer.put_u8(0);
    writer.put_u8(param_type);
    let len = writer.reserve_u16();
    value(writer);
    writer.fill_u16(len)
}

fn put_peer(writer: &mut Writer, peer: &PeerParameter) {
    writer.put_identifier(&peer.id);
    writer.put_addr(&peer.addr);
}

fn read_peer(reader: &mut Reader) -> Result<PeerParameter> {
    Ok(PeerParameter {
        id: reader.read_identifier()?,
        addr: reader.read_addr()?,
    })
}

/// Parses a parameter value with `parse` and requires that it consumes every byte.
fn read_whole<'a, T, F>(value: &'a [u8], parse: F) -> Result<T>
where
    F: FnOnce(&mut Reader<'a>) -> Result<T>,
{
    let mut reader = Reader::new(value);
    let ret = parse(&mut reader)?;
    reader.finish("parameter value")?;
    Ok(ret)
}

fn missing(what: &str, command: &str) -> Error {
    Error::malformed(format!("{} is missing its {} parameter", command, what))
}

/// The parameters of one body, in wire order.
struct Params<'a> {
    entries: Vec<(u8, &'a [u8])>,
}

impl<'a> Params<'a> {
    fn parse(body: &'a [u8]) -> Result<Self> {
        let mut reader = Reader::new(body);
        let mut entries = Vec::new();
        while !reader.is_empty() {
            let _ext = reader.read_u8()?;
            let param_type = reader.read_u8()?;
            let len = usize::from(reader.read_u16()?);
            entries.push((param_type, reader.read_bytes(len)?));
        }
        Ok(Params { entries })
    }

    fn first(&self, param_type: u8) -> Option<&'a [u8]> {
        self.all(param_type).next()
    }

    fn all(&self, param_type: u8) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.entries
            .iter()
            .filter(move |(t, _)| *t == param_type)
            .map(|(_, value)| *value)
    }

    fn required(&self, param_type: u8, command: &str) -> Result<&'a [u8]> {
        self.first(param_type)
            .ok_or_else(|| missing(&format!("0x{:02x}", param_type), command))
    }

    fn identifier(&self, param_type: u8, command: &str) -> Result<Identifier> {
        read_whole(self.required(param_type, command)?, Reader::read_identifier)
    }

    fn addr(&self, param_type: u8, command: &str) -> Result<SocketAddr> {
        read_whole(self.required(param_type, command)?, Reader::read_addr)
    }

    fn u8(&self, param_type: u8, command: &str) -> Result<u8> {
        read_whole(self.required(param_type, command)?, Reader::read_u8)
    }

    fn u32(&self, param_type: u8, command: &str) -> Result<u32> {
        read_whole(self.required(param_type, command)?, Reader::read_u32)
    }

    fn bytes(&self, param_type: u8) -> Option<Vec<u8>> {
        self.first(param_type).map(<[u8]>::to_vec)
    }

    fn string(&self, param_type: u8) -> Result<Option<String>> {
        match self.first(param_type) {
            Some(value) => read_whole(value, Reader::read_string).map(Some),
            None => Ok(None),
        }
    }
}

/// Issues random transaction ids that do not collide with any of the most recent ones.
pub struct TransactionIds {
    recent: VecDeque<TransactionId>,
    capacity: usize,
}

/// Random draws attempted before accepting a colliding id.
const MAX_ID_ATTEMPTS: usize = 8;

impl TransactionIds {
    pub fn new(capacity: usize) -> Self {
        TransactionIds {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn next_id(&mut self) -> TransactionId {
        let mut rng = rand::thread_rng();
        let mut id = rng.gen::<TransactionId>();
        let mut attempts = 1;
        while self.recent.contains(&id) && attempts < MAX_ID_ATTEMPTS {
            id = rng.gen::<TransactionId>();
            attempts += 1;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(id);
        id
    }
}
