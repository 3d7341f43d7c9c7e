//! Branded identifiers.
//!
//! Every id in the core is an opaque, structurally-equal wrapper around a ULID.
//! The core never mints one of these from user input; generators are injected
//! via `IdGenerator` (see `crate::gen`).

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use crate::error::DecodeError;

/// Defines a branded id type backed by a ULID, with base64 text representation
/// for human-readable encodings (JSON) and raw bytes for binary ones (bincode).
macro_rules! branded_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Ulid);

        impl $name {
            pub fn new_from(ulid: Ulid) -> Self { Self(ulid) }

            pub fn from_bytes(bytes: [u8; 16]) -> Self { Self(Ulid::from_bytes(bytes)) }

            pub fn to_bytes(&self) -> [u8; 16] { self.0.to_bytes() }

            pub fn to_base64(&self) -> String { general_purpose::URL_SAFE_NO_PAD.encode(self.0.to_bytes()) }

            pub fn from_base64<T: AsRef<[u8]>>(input: T) -> Result<Self, DecodeError> {
                let decoded = general_purpose::URL_SAFE_NO_PAD.decode(input)?;
                let bytes: [u8; 16] = decoded[..].try_into().map_err(|_| DecodeError::InvalidLength)?;
                Ok(Self(Ulid::from_bytes(bytes)))
            }

            pub fn to_ulid(&self) -> Ulid { self.0 }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.to_base64()) }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}({})", stringify!($name), self.to_base64()) }
        }

        impl std::str::FromStr for $name {
            type Err = DecodeError;
            fn from_str(s: &str) -> Result<Self, Self::Err> { Self::from_base64(s) }
        }

        impl TryFrom<&str> for $name {
            type Error = DecodeError;
            fn try_from(s: &str) -> Result<Self, Self::Error> { Self::from_base64(s) }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String { id.to_base64() }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where S: serde::Serializer {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_base64())
                } else {
                    self.0.to_bytes().serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where D: serde::Deserializer<'de> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    Self::from_base64(s).map_err(serde::de::Error::custom)
                } else {
                    let bytes = <[u8; 16]>::deserialize(deserializer)?;
                    Ok(Self::from_bytes(bytes))
                }
            }
        }
    };
}

branded_id!(TreeId);
branded_id!(NodeId);
branded_id!(EntityId);
branded_id!(WorkingCopyId);
branded_id!(CommandId);
branded_id!(CommandGroupId);
branded_id!(SubscriptionId);

/// Monotonically increasing counter defining the canonical order of commands
/// processed by one facade instance. Never reused across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Seq(u64);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub fn next(self) -> Seq { Seq(self.0 + 1) }

    pub fn get(self) -> u64 { self.0 }

    /// Constructs a `Seq` from a raw counter value, used by the command
    /// processor's atomic counter rather than repeated `next()` calls.
    pub fn from_u64(value: u64) -> Self { Seq(value) }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_through_json() {
        let id = NodeId::from_bytes([1; 16]);
        let json = serde_json::to_string(&id).unwrap();
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn node_id_round_trips_through_bincode_like_bytes() {
        let id = NodeId::from_bytes([7; 16]);
        assert_eq!(NodeId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn seq_is_monotonic() {
        let a = Seq::ZERO;
        let b = a.next();
        assert!(b > a);
    }

    #[test]
    fn distinct_brands_are_distinct_types() {
        // This is a compile-time property; NodeId and TreeId cannot be compared
        // or substituted for one another even though both wrap a Ulid.
        let node = NodeId::from_bytes([1; 16]);
        let tree = TreeId::from_bytes([1; 16]);
        assert_eq!(node.to_bytes(), tree.to_bytes());
    }
}
