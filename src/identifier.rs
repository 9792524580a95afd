use num_bigint::BigUint;
use sha3::{Digest, Sha3_256};
use std::fmt::{Debug, Display, Formatter, Result};

use crate::IDENTIFIER_LENGTH;

/// The number of 32-bit label words needed to carry one identifier on a label stack.
pub const IDENTIFIER_WORDS: usize = (IDENTIFIER_LENGTH * 8 + 31) / 32;

/// A position on the ring, used for both nodes and data.
///
/// Identifiers are 160-bit unsigned integers ordered by big-endian comparison. They can be derived
/// by hashing a string (usually `host:port`) or assigned directly.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Default, Copy)]
pub struct Identifier(pub [u8; IDENTIFIER_LENGTH]);

impl Debug for Identifier {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", hex_vec.join(""))
    }
}

impl Display for Identifier {
    /// Prints the identifier without its leading zero bytes, which keeps small test identifiers
    /// readable in logs.
    fn fmt(&self, f: &mut Formatter) -> Result {
        let start = self.0.iter().position(|b| *b != 0).unwrap_or(IDENTIFIER_LENGTH - 1);
        for byte in &self.0[start..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<u64> for Identifier {
    fn from(value: u64) -> Self {
        let mut ret = [0; IDENTIFIER_LENGTH];
        ret[IDENTIFIER_LENGTH - 8..].copy_from_slice(&value.to_be_bytes());
        Identifier(ret)
    }
}

impl Identifier {
    /// Constructs a new `Identifier` from a byte array.
    pub fn new(data: [u8; IDENTIFIER_LENGTH]) -> Self {
        Identifier(data)
    }

    /// The all-zero identifier. On the wire it stands for "no predecessor".
    pub fn zero() -> Self {
        Identifier([0; IDENTIFIER_LENGTH])
    }

    /// Returns `true` if every bit of `self` is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    /// Constructs a new, random `Identifier`.
    pub fn rand() -> Self {
        let mut ret = Identifier::zero();
        for byte in &mut ret.0 {
            *byte = rand::random::<u8>();
        }
        ret
    }

    /// Derives an `Identifier` from the leading 160 bits of the SHA3-256 digest of `input`.
    pub fn hash(input: &str) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(input.as_bytes());
        let digest = hasher.finalize();
        let mut ret = [0; IDENTIFIER_LENGTH];
        ret.copy_from_slice(&digest[..IDENTIFIER_LENGTH]);
        Identifier(ret)
    }

    /// Constructs an `Identifier` from exactly `IDENTIFIER_LENGTH` bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != IDENTIFIER_LENGTH {
            return None;
        }
        let mut ret = [0; IDENTIFIER_LENGTH];
        ret.copy_from_slice(bytes);
        Some(Identifier(ret))
    }

    /// Returns `true` if `x` lies strictly inside the clockwise arc from `low` to `high`.
    ///
    /// When `low < high` this is the ordinary open interval. Otherwise the arc wraps past the
    /// largest identifier and `x` is inside if it is above `low` or below `high`. Neither endpoint
    /// is ever inside.
    pub fn between(low: &Identifier, high: &Identifier, x: &Identifier) -> bool {
        if low < high {
            x > low && x < high
        } else {
            x > low || x < high
        }
    }

    /// Returns `(self + 2^exponent) mod 2^160`.
    pub fn add_pow2(&self, exponent: usize) -> Identifier {
        let modulus = BigUint::from(1u8) << (IDENTIFIER_LENGTH * 8);
        let sum = (BigUint::from_bytes_be(&self.0) + (BigUint::from(1u8) << exponent)) % modulus;
        let bytes = sum.to_bytes_be();
        let mut ret = [0; IDENTIFIER_LENGTH];
        ret[IDENTIFIER_LENGTH - bytes.len()..].copy_from_slice(&bytes);
        Identifier(ret)
    }

    /// Clockwise distance from `self` to `other`, i.e. `(other - self) mod 2^160`.
    pub fn distance_to(&self, other: &Identifier) -> Identifier {
        let mut ret = [0; IDENTIFIER_LENGTH];
        let mut borrow = 0i16;
        for i in (0..IDENTIFIER_LENGTH).rev() {
            let mut diff = i16::from(other.0[i]) - i16::from(self.0[i]) - borrow;
            borrow = 0;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            }
            ret[i] = diff as u8;
        }
        Identifier(ret)
    }

    /// Splits `self` into big-endian 32-bit label words.
    pub fn to_words(&self) -> [u32; IDENTIFIER_WORDS] {
        let mut ret = [0; IDENTIFIER_WORDS];
        for (i, chunk) in self.0.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            ret[i] = u32::from_be_bytes(word);
        }
        ret
    }

    /// Reassembles an identifier from the words produced by `to_words`.
    pub fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() != IDENTIFIER_WORDS {
            return None;
        }
        let mut ret = [0; IDENTIFIER_LENGTH];
        for (i, word) in words.iter().enumerate() {
            let bytes = word.to_be_bytes();
            let start = i * 4;
            let end = std::cmp::min(start + 4, IDENTIFIER_LENGTH);
            ret[start..end].copy_from_slice(&bytes[..end - start]);
        }
        Some(Identifier(ret))
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use super::Identifier;
    use crate::IDENTIFIER_LENGTH;

    #[test]
    fn test_between_endpoints_excluded() {
        let low = Identifier::from(10);
        let high = Identifier::from(20);
        assert!(!Identifier::between(&low, &high, &low));
        assert!(!Identifier::between(&low, &high, &high));
        assert!(!Identifier::between(&high, &low, &low));
        assert!(!Identifier::between(&high, &low, &high));
    }

    #[test]
    fn test_between_wraps() {
        let low = Identifier::from(200);
        let high = Identifier::from(5);
        assert!(Identifier::between(&low, &high, &Identifier::from(201)));
        assert!(Identifier::between(&low, &high, &Identifier::from(0)));
        assert!(Identifier::between(&low, &high, &Identifier::new([0xFF; IDENTIFIER_LENGTH])));
        assert!(!Identifier::between(&low, &high, &Identifier::from(100)));
    }

    #[test]
    fn test_between_partitions_ring() {
        for _ in 0..200 {
            let low = Identifier::rand();
            let high = Identifier::rand();
            let x = Identifier::rand();
            if low == high || x == low || x == high {
                continue;
            }
            let forward = Identifier::between(&low, &high, &x);
            let backward = Identifier::between(&high, &low, &x);
            assert!(forward != backward);
        }
    }

    #[test]
    fn test_between_same_endpoints_covers_rest_of_ring() {
        let point = Identifier::from(7);
        assert!(!Identifier::between(&point, &point, &point));
        assert!(Identifier::between(&point, &point, &Identifier::from(8)));
        assert!(Identifier::between(&point, &point, &Identifier::from(6)));
    }

    #[test]
    fn test_add_pow2() {
        let modulus = BigUint::from(1u8) << (IDENTIFIER_LENGTH * 8);
        for i in 0..IDENTIFIER_LENGTH * 8 {
            let id = Identifier::rand();
            let expected = (BigUint::from_bytes_be(&id.0) + (BigUint::from(1u8) << i)) % &modulus;
            assert_eq!(BigUint::from_bytes_be(&id.add_pow2(i).0), expected);
        }
    }

    #[test]
    fn test_add_pow2_wraps_to_zero() {
        let max = Identifier::new([0xFF; IDENTIFIER_LENGTH]);
        assert_eq!(max.add_pow2(0), Identifier::zero());
    }

    #[test]
    fn test_distance_to() {
        let a = Identifier::from(250);
        let b = Identifier::from(4);
        assert_eq!(b.distance_to(&a), Identifier::from(246));
        let wrapped = BigUint::from_bytes_be(&a.distance_to(&b).0);
        let expected = (BigUint::from(1u8) << (IDENTIFIER_LENGTH * 8)) - BigUint::from(246u32);
        assert_eq!(wrapped, expected);
    }

    #[test]
    fn test_words() {
        let id = Identifier::rand();
        assert_eq!(Identifier::from_words(&id.to_words()), Some(id));
        assert_eq!(Identifier::from_words(&[1, 2]), None);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(Identifier::hash("127.0.0.1:8900"), Identifier::hash("127.0.0.1:8900"));
        assert_ne!(Identifier::hash("127.0.0.1:8900"), Identifier::hash("127.0.0.1:8901"));
    }

    #[test]
    fn test_display_trims_leading_zeros() {
        assert_eq!(Identifier::from(0x1F).to_string(), "1f");
        assert_eq!(Identifier::zero().to_string(), "00");
    }
}
