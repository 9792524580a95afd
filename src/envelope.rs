//! The forwarding frame that wraps every encoded command.
//!
//! ```text
//! ver+resv(1) | src_count(1) | dst_count(1) | ttl(1) | network_id(3) | network_ver(1)
//! src_count label words | dst_count label words | command body
//! ```

use std::collections::VecDeque;

use crate::codec::{Reader, Writer};
use crate::error::{Error, Result};
use crate::identifier::{Identifier, IDENTIFIER_WORDS};
use crate::reactor::FlowId;

/// The label word that introduces an identifier run.
pub const IDENTIFIER_SENTINEL: u32 = 1;

/// The frame format revision, carried in the high nibble of the first byte.
pub const FRAME_VERSION: u8 = 1;

/// The size of the fixed frame header.
pub const FRAME_HEADER_LENGTH: usize = 8;

/// A head-first sequence of route labels.
///
/// A label is either an identifier run (the sentinel followed by `IDENTIFIER_WORDS` words) or a
/// single opaque relay handle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelStack {
    words: VecDeque<u32>,
}

impl LabelStack {
    pub fn new() -> Self {
        LabelStack {
            words: VecDeque::new(),
        }
    }

    /// A stack holding exactly one identifier.
    pub fn to_identifier(id: &Identifier) -> Self {
        let mut ret = LabelStack::new();
        ret.push_identifier(id);
        ret
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// The number of 32-bit words on the stack.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn push_identifier(&mut self, id: &Identifier) {
        for word in id.to_words().iter().rev() {
            self.words.push_front(*word);
        }
        self.words.push_front(IDENTIFIER_SENTINEL);
    }

    pub fn peek_identifier(&self) -> Option<Identifier> {
        if self.words.front() != Some(&IDENTIFIER_SENTINEL) {
            return None;
        }
        let words: Vec<u32> = self
            .words
            .iter()
            .skip(1)
            .take(IDENTIFIER_WORDS)
            .cloned()
            .collect();
        Identifier::from_words(&words)
    }

    pub fn pop_identifier(&mut self) -> Option<Identifier> {
        let id = self.peek_identifier()?;
        self.words.drain(..=IDENTIFIER_WORDS);
        Some(id)
    }

    pub fn push_label(&mut self, flow: FlowId) {
        self.words.push_front(flow.0);
    }

    /// Returns the head if it is an opaque relay handle.
    pub fn peek_label(&self) -> Option<FlowId> {
        match self.words.front() {
            Some(&word) if word != IDENTIFIER_SENTINEL => Some(FlowId(word)),
            _ => None,
        }
    }

    pub fn pop_label(&mut self) -> Option<FlowId> {
        let ret = self.peek_label()?;
        self.words.pop_front();
        Some(ret)
    }

    /// Returns `true` if the head is an identifier run.
    pub fn has_identifier_head(&self) -> bool {
        self.words.front() == Some(&IDENTIFIER_SENTINEL)
    }

    /// Returns `true` if the stack is exactly one identifier run and nothing else.
    pub fn is_single_identifier(&self) -> bool {
        self.has_identifier_head() && self.words.len() == IDENTIFIER_WORDS + 1
    }

    /// Builds a stack from wire words, rejecting identifier runs cut short by the end of the stack.
    fn from_words(words: Vec<u32>) -> Result<Self> {
        let mut i = 0;
        while i < words.len() {
            if words[i] == IDENTIFIER_SENTINEL {
                if i + IDENTIFIER_WORDS >= words.len() {
                    return Err(Error::malformed("label stack ends inside an identifier"));
                }
                i += IDENTIFIER_WORDS;
            }
            i += 1;
        }
        Ok(LabelStack {
            words: words.into_iter().collect(),
        })
    }
}

/// One forwarding frame. `body` is an encoded `protocol::Message`; relays never re-encode it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub ttl: u8,
    pub network_id: u32,
    pub network_version: u8,
    pub src: LabelStack,
    pub dst: LabelStack,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let src_count = label_count(&self.src)?;
        let dst_count = label_count(&self.dst)?;
        let mut writer = Writer::new();
        writer.put_u8(FRAME_VERSION << 4);
        writer.put_u8(src_count);
        writer.put_u8(dst_count);
        writer.put_u8(self.ttl);
        writer.put_u24(self.network_id & 0x00FF_FFFF);
        writer.put_u8(self.network_version);
        for word in self.src.words.iter().chain(self.dst.words.iter()) {
            writer.put_u32(*word);
        }
        writer.put_bytes(&self.body);
        Ok(writer.into_inner())
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let mut reader = Reader::new(bytes);
        let version = reader.read_u8()? >> 4;
        if version != FRAME_VERSION {
            return Err(Error::malformed(format!("unsupported frame version {}", version)));
        }
        let src_count = usize::from(reader.read_u8()?);
        let dst_count = usize::from(reader.read_u8()?);
        let ttl = reader.read_u8()?;
        let network_id = reader.read_u24()?;
        let network_version = reader.read_u8()?;
        let src = read_stack(&mut reader, src_count)?;
        let dst = read_stack(&mut reader, dst_count)?;
        let body = reader.read_bytes(reader.remaining())?.to_vec();
        Ok(Frame {
            ttl,
            network_id,
            network_version,
            src,
            dst,
            body,
        })
    }
}

fn label_count(stack: &LabelStack) -> Result<u8> {
    if stack.len() > usize::from(u8::MAX) {
        return Err(Error::MessageTooLarge(stack.len()));
    }
    Ok(stack.len() as u8)
}

fn read_stack(reader: &mut Reader, count: usize) -> Result<LabelStack> {
    let words = (0..count)
        .map(|_| reader.read_u32())
        .collect::<Result<Vec<_>>>()?;
    LabelStack::from_words(words)
}

#[cfg(test)]
mod tests {
    use super::{Frame, LabelStack, FRAME_HEADER_LENGTH};
    use crate::identifier::{Identifier, IDENTIFIER_WORDS};
    use crate::reactor::FlowId;

    #[test]
    fn test_identifier_and_label_runs() {
        let id = Identifier::rand();
        let mut stack = LabelStack::new();
        stack.push_identifier(&id);
        stack.push_label(FlowId(7));
        stack.push_label(FlowId(9));

        assert_eq!(stack.len(), IDENTIFIER_WORDS + 3);
        assert_eq!(stack.peek_identifier(), None);
        assert_eq!(stack.pop_label(), Some(FlowId(9)));
        assert_eq!(stack.pop_label(), Some(FlowId(7)));
        assert_eq!(stack.pop_label(), None);
        assert!(stack.is_single_identifier());
        assert_eq!(stack.pop_identifier(), Some(id));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_frame_layout() {
        let mut src = LabelStack::new();
        src.push_label(FlowId(5));
        let frame = Frame {
            ttl: 32,
            network_id: 0x00AB_CDEF,
            network_version: 1,
            src,
            dst: LabelStack::to_identifier(&Identifier::from(2)),
            body: vec![0xEE; 3],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..FRAME_HEADER_LENGTH], &[0x10, 1, 6, 32, 0xAB, 0xCD, 0xEF, 1]);
        assert_eq!(&bytes[FRAME_HEADER_LENGTH..FRAME_HEADER_LENGTH + 4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[FRAME_HEADER_LENGTH + 4..FRAME_HEADER_LENGTH + 8], &[0, 0, 0, 1]);
        assert_eq!(bytes.len(), FRAME_HEADER_LENGTH + 7 * 4 + 3);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_truncated_identifier_run() {
        // one destination word holding only the sentinel
        let bytes = [0x10, 0, 1, 8, 0, 0, 1, 1, 0, 0, 0, 1];
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_wrong_version() {
        let bytes = [0x20, 0, 0, 8, 0, 0, 1, 1];
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_short_label_words() {
        let bytes = [0x10, 2, 0, 8, 0, 0, 1, 1, 0, 0, 0, 9];
        assert!(Frame::decode(&bytes).is_err());
    }
}
