//! Prime field elements used for every hash, root and leaf in the forest
//!
//! All values are residues modulo the BN254 scalar field prime. The type keeps
//! the canonical (fully reduced) representative, so equality and ordering are
//! exact and the big-endian byte encoding is unique.

use anyhow::{anyhow, Result};
use ruint::aliases::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// BN254 scalar field modulus
/// `0x30644e72e131a029b85045b68181585d2833e84879b9709143e1f593f0000001`
pub const MODULUS: U256 = U256::from_limbs([
    0x43e1f593f0000001,
    0x2833e84879b97091,
    0xb85045b68181585d,
    0x30644e72e131a029,
]);

/// Number of significant bits of [`MODULUS`]
pub const MODULUS_BITS: usize = 254;

/// A canonical element of the BN254 scalar field
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Field(U256);

impl Field {
    pub const ZERO: Field = Field(U256::ZERO);

    /// Reduces an arbitrary 256-bit integer into the field
    pub fn new(value: U256) -> Self {
        Field(value.reduce_mod(MODULUS))
    }

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn one() -> Self {
        Field(U256::from(1u64))
    }

    pub fn from_u64(value: u64) -> Self {
        Field(U256::from(value))
    }

    /// Interprets 32 big-endian bytes as an integer and reduces it
    pub fn from_be_bytes_reduced(bytes: [u8; 32]) -> Self {
        Self::new(U256::from_be_bytes::<32>(bytes))
    }

    /// Strict decoding: rejects encodings that are not canonical
    pub fn from_be_slice(bytes: &[u8]) -> Result<Self> {
        let value = U256::try_from_be_slice(bytes)
            .ok_or_else(|| anyhow!("field encoding too long: {} bytes", bytes.len()))?;
        if value >= MODULUS {
            return Err(anyhow!("value 0x{:x} is not a canonical field element", value));
        }
        Ok(Field(value))
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes::<32>()
    }

    pub fn as_uint(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == U256::ZERO
    }

    /// Bit `index` of the canonical representative (bit 0 is least significant)
    pub fn bit(&self, index: usize) -> bool {
        index < 256 && self.0.bit(index)
    }

    /// The lowest `bits` bits, used to map a value into a tree's index space
    pub fn low_bits(&self, bits: usize) -> U256 {
        if bits >= 256 {
            return self.0;
        }
        let mask = (U256::from(1u64) << bits) - U256::from(1u64);
        self.0 & mask
    }

    /// Lossless conversion to `u64`, failing when the value does not fit
    pub fn to_u64(&self) -> Result<u64> {
        u64::try_from(self.0).map_err(|_| anyhow!("field element 0x{:x} exceeds u64", self.0))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_be_bytes()))
    }
}

impl From<u64> for Field {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl FromStr for Field {
    type Err = anyhow::Error;

    /// Accepts `0x`-prefixed hex or a plain decimal literal
    fn from_str(s: &str) -> Result<Self> {
        if let Some(stripped) = s.strip_prefix("0x") {
            let bytes = hex::decode(stripped)?;
            if bytes.len() > 32 {
                return Err(anyhow!("hex literal longer than 32 bytes"));
            }
            let mut padded = [0u8; 32];
            padded[32 - bytes.len()..].copy_from_slice(&bytes);
            Field::from_be_slice(&padded)
        } else {
            let value = U256::from_str_radix(s, 10).map_err(|e| anyhow!("invalid decimal {}: {}", s, e))?;
            if value >= MODULUS {
                return Err(anyhow!("decimal {} is outside the field", s));
            }
            Ok(Field(value))
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field({})", self.to_hex())
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Field::from_str(&s).map_err(serde::de::Error::custom)
    }
}
