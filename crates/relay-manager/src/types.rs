use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Length of a network destination hash in bytes.
pub const NODE_ID_LEN: usize = 16;

/// Number of hex characters kept by [`NodeId::short`].
const SHORT_HEX_LEN: usize = 16;

/// Network address of a node: a fixed-length destination hash.
///
/// Displayed, parsed and serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Truncated hex form, the last-resort display name for a relay.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(SHORT_HEX_LEN);
        hex
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}...)", self.short())
    }
}

impl FromStr for NodeId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; NODE_ID_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|_| RelayError::InvalidNodeId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Current time as Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = NodeId::from_bytes([0xab; NODE_ID_LEN]);
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), NODE_ID_LEN * 2);
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        assert!("abcd".parse::<NodeId>().is_err());
        assert!("zz".repeat(NODE_ID_LEN).parse::<NodeId>().is_err());
        assert!("00".repeat(NODE_ID_LEN + 1).parse::<NodeId>().is_err());
    }

    #[test]
    fn short_keeps_prefix() {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = 0x12;
        bytes[1] = 0x34;
        let id = NodeId::from_bytes(bytes);
        assert_eq!(id.short(), "1234000000000000");
        assert!(id.to_hex().starts_with(&id.short()));
    }

    #[test]
    fn serde_as_hex_string() {
        let id = NodeId::from_bytes([7; NODE_ID_LEN]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
