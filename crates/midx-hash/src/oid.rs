use std::fmt;
use std::str::FromStr;

use crate::hex::{hex_decode, hex_to_string, nibble};
use crate::HashError;

/// An object identifier: the 20-byte hash of an object's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// Raw digest length in bytes.
    pub const RAW_SIZE: usize = 20;
    /// Hex representation length in nibbles.
    pub const HEX_SIZE: usize = 40;
    /// The null OID (all zeros).
    pub const NULL: Self = Self([0u8; 20]);

    /// Create an ObjectId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != Self::RAW_SIZE {
            return Err(HashError::InvalidHashLength {
                expected: Self::RAW_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; Self::RAW_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Create an ObjectId from a 40-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let mut bytes = [0u8; Self::RAW_SIZE];
        hex_decode(hex, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Parse a hex prefix of 1..=40 nibbles, zero-filling the rest.
    ///
    /// Returns the padded id together with the prefix length in nibbles,
    /// ready to feed a prefix lookup.
    pub fn from_hex_prefix(hex: &str) -> Result<(Self, usize), HashError> {
        if hex.is_empty() || hex.len() > Self::HEX_SIZE {
            return Err(HashError::InvalidHexLength {
                expected: Self::HEX_SIZE,
                actual: hex.len(),
            });
        }
        let mut bytes = [0u8; Self::RAW_SIZE];
        for (i, &c) in hex.as_bytes().iter().enumerate() {
            let v = nibble(c).ok_or(HashError::InvalidHex {
                position: i,
                character: c as char,
            })?;
            bytes[i / 2] |= if i % 2 == 0 { v << 4 } else { v };
        }
        Ok((Self(bytes), hex.len()))
    }

    /// Get the raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Check if this is the null (all-zeros) OID.
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Get the hex string representation (lowercase).
    pub fn to_hex(&self) -> String {
        hex_to_string(&self.0)
    }

    /// Get the first byte of the hash (for fan-out table indexing).
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// Whether `self` and `other` agree on their first `nibbles` hex digits.
    pub fn shares_prefix_nibbles(&self, other: &ObjectId, nibbles: usize) -> bool {
        let n = nibbles.min(Self::HEX_SIZE);
        let full = n / 2;
        if self.0[..full] != other.0[..full] {
            return false;
        }
        if n % 2 == 1 && (self.0[full] >> 4) != (other.0[full] >> 4) {
            return false;
        }
        true
    }
}

impl From<[u8; 20]> for ObjectId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..8])
    }
}

impl FromStr for ObjectId {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
