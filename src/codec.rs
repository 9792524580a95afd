//! Bounds-checked cursor and writer over wire buffers. Every read past the end of the buffer is a
//! `MalformedMessage`, never a panic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};
use crate::identifier::Identifier;
use crate::IDENTIFIER_LENGTH;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

pub(crate) struct Reader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Reader {
            buffer,
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::malformed(format!(
                "needed {} bytes at offset {}, only {} left",
                len,
                self.position,
                self.remaining()
            )));
        }
        let bytes = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(3)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_identifier(&mut self) -> Result<Identifier> {
        let bytes = self.read_bytes(IDENTIFIER_LENGTH)?;
        Identifier::from_slice(bytes).ok_or_else(|| Error::malformed("short identifier"))
    }

    pub fn read_addr(&mut self) -> Result<SocketAddr> {
        let ip = match self.read_u8()? {
            FAMILY_V4 => {
                let b = self.read_bytes(4)?;
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            },
            FAMILY_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.read_bytes(16)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            },
            family => return Err(Error::malformed(format!("unknown address family {}", family))),
        };
        let port = self.read_u16()?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Reads the rest of the buffer as UTF-8.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes(self.remaining())?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::malformed("string is not UTF-8"))
    }

    /// Fails unless the whole buffer was consumed.
    pub fn finish(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::malformed(format!("{} trailing bytes after {}", self.remaining(), what)))
        }
    }
}

#[derive(Default)]
pub(crate) struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buffer: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn put_u24(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes()[1..]);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn put_identifier(&mut self, id: &Identifier) {
        self.put_bytes(&id.0);
    }

    pub fn put_addr(&mut self, addr: &SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.put_u8(FAMILY_V4);
                self.put_bytes(&ip.octets());
            },
            IpAddr::V6(ip) => {
                self.put_u8(FAMILY_V6);
                self.put_bytes(&ip.octets());
            },
        }
        self.put_u16(addr.port());
    }

    /// Reserves a big-endian `u16` length slot and returns its offset.
    pub fn reserve_u16(&mut self) -> usize {
        let offset = self.buffer.len();
        self.put_u16(0);
        offset
    }

    /// Fills the slot at `offset` with the number of bytes written after it.
    pub fn fill_u16(&mut self, offset: usize) -> Result<()> {
        let len = self.buffer.len() - offset - 2;
        if len > usize::from(u16::MAX) {
            return Err(Error::MessageTooLarge(len));
        }
        self.buffer[offset..offset + 2].copy_from_slice(&(len as u16).to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Reader, Writer};
    use crate::error::Error;
    use crate::identifier::Identifier;

    #[test]
    fn test_reader_bounds() {
        let mut reader = Reader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        match reader.read_u16() {
            Err(Error::MalformedMessage(_)) => {},
            other => panic!("expected malformed message, got {:?}", other),
        }
        assert_eq!(reader.read_u8().unwrap(), 0x03);
        assert!(reader.finish("test").is_ok());
    }

    #[test]
    fn test_addresses() {
        let v4 = "10.1.2.3:8900".parse().unwrap();
        let v6 = "[::1]:9000".parse().unwrap();
        let mut writer = Writer::new();
        writer.put_addr(&v4);
        writer.put_addr(&v6);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 7 + 19);
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_addr().unwrap(), v4);
        assert_eq!(reader.read_addr().unwrap(), v6);
    }

    #[test]
    fn test_unknown_address_family() {
        let mut reader = Reader::new(&[9, 0, 0]);
        assert!(reader.read_addr().is_err());
    }

    #[test]
    fn test_length_slot() {
        let mut writer = Writer::new();
        let slot = writer.reserve_u16();
        writer.put_identifier(&Identifier::from(5));
        writer.fill_u16(slot).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(&bytes[..2], &[0, 20]);
    }

    #[test]
    fn test_length_slot_overflow() {
        let mut writer = Writer::new();
        let slot = writer.reserve_u16();
        writer.put_bytes(&vec![0; 70_000]);
        match writer.fill_u16(slot) {
            Err(Error::MessageTooLarge(70_000)) => {},
            other => panic!("expected oversized error, got {:?}", other),
        }
    }
}
