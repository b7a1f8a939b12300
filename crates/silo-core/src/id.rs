use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::SiloError;

/// Size of an [`Id`] in bytes.
pub const ID_SIZE: usize = 32;

/// A 256-bit content identifier: the SHA-256 of an object's defining bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// Hash `data` and return its identifier.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(&digest);
        Id(out)
    }

    /// The all-zero null sentinel.
    pub fn null() -> Self {
        Id([0u8; ID_SIZE])
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; ID_SIZE]
    }

    /// A randomly generated identifier, for tie-breakers and test fixtures.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Id(bytes)
    }

    /// Parse a 64-character lowercase hex string.
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        let bytes = hex::decode(s).map_err(|_| SiloError::InvalidId(s.to_string()))?;
        if bytes.len() != ID_SIZE {
            return Err(SiloError::InvalidId(s.to_string()));
        }
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(&bytes);
        Ok(Id(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Shortened rendering for log and error messages.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// First byte as a two-char hex string, used as the `data/<xx>/` shard key.
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short())
    }
}

impl FromStr for Id {
    type Err = SiloError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::parse(s)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::parse(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sha256() {
        // SHA-256("a")
        let id = Id::hash(b"a");
        assert_eq!(
            id.to_hex(),
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
    }

    #[test]
    fn parse_roundtrip() {
        let id = Id::hash(b"roundtrip");
        let parsed = Id::parse(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Id::parse("zz").is_err());
        assert!(Id::parse("abcd").is_err());
        assert!(Id::parse("").is_err());
    }

    #[test]
    fn null_sentinel() {
        assert!(Id::null().is_null());
        assert!(!Id::hash(b"x").is_null());
    }

    #[test]
    fn prefix_is_first_byte() {
        let id = Id([0xAB; 32]);
        assert_eq!(id.prefix(), "ab");
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn serde_as_hex_string() {
        let id = Id::hash(b"serde");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
