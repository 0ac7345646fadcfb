//! Byte encodings for values sent over the wire.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{Error, Result};

/// List of possible formats for encoding data sent over the network.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum Encoding {
    /// Fast binary format, useful for communicating directly between Rust apps
    Bincode,
    /// Binary format with implementations in many different languages
    MsgPack,
    /// Very common but more verbose format
    Json,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Bincode
    }
}

impl FromStr for Encoding {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let e = match s.to_lowercase().as_str() {
            "bincode" | "bin" => Self::Bincode,
            "msgpack" | "messagepack" | "rmp" => Self::MsgPack,
            "json" => Self::Json,
            _ => return Err(Error::InvalidEncoding(s.to_string())),
        };
        e.check_available()?;
        Ok(e)
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bincode => write!(f, "bincode"),
            Self::MsgPack => write!(f, "msgpack"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl Encoding {
    /// Errors if the encoding was compiled out.
    pub fn check_available(&self) -> Result<()> {
        match self {
            Self::Bincode => Ok(()),
            Self::MsgPack => {
                #[cfg(feature = "msgpack_encoding")]
                return Ok(());
                #[cfg(not(feature = "msgpack_encoding"))]
                return Err(Error::Unsupported(
                    "msgpack encoding requires crate feature msgpack_encoding".to_string(),
                ));
            }
            Self::Json => {
                #[cfg(feature = "json_encoding")]
                return Ok(());
                #[cfg(not(feature = "json_encoding"))]
                return Err(Error::Unsupported(
                    "json encoding requires crate feature json_encoding".to_string(),
                ));
            }
        }
    }
}

/// Packs serializable object to bytes based on selected encoding.
pub fn pack<S: Serialize>(obj: &S, encoding: Encoding) -> Result<Vec<u8>> {
    encoding.check_available()?;
    let packed: Vec<u8> = match encoding {
        Encoding::Bincode => bincode::serialize(obj)
            .map_err(|e| Error::SerializationError(e.to_string()))?,
        Encoding::MsgPack => {
            #[cfg(not(feature = "msgpack_encoding"))]
            unreachable!();
            #[cfg(feature = "msgpack_encoding")]
            {
                rmp_serde::to_vec(obj).map_err(|e| Error::SerializationError(e.to_string()))?
            }
        }
        Encoding::Json => {
            #[cfg(not(feature = "json_encoding"))]
            unreachable!();
            #[cfg(feature = "json_encoding")]
            {
                serde_json::to_vec(obj).map_err(|e| Error::SerializationError(e.to_string()))?
            }
        }
    };
    Ok(packed)
}

/// Unpacks object from bytes based on selected encoding.
pub fn unpack<'de, P: Deserialize<'de>>(bytes: &'de [u8], encoding: Encoding) -> Result<P> {
    encoding.check_available()?;
    let unpacked = match encoding {
        Encoding::Bincode => bincode::deserialize(bytes)
            .map_err(|e| Error::DeserializationError(e.to_string()))?,
        Encoding::MsgPack => {
            #[cfg(not(feature = "msgpack_encoding"))]
            unreachable!();
            #[cfg(feature = "msgpack_encoding")]
            {
                let mut de = rmp_serde::Deserializer::new(bytes).with_binary();
                Deserialize::deserialize(&mut de)
                    .map_err(|e: rmp_serde::decode::Error| {
                        Error::DeserializationError(e.to_string())
                    })?
            }
        }
        Encoding::Json => {
            #[cfg(not(feature = "json_encoding"))]
            unreachable!();
            #[cfg(feature = "json_encoding")]
            {
                serde_json::from_slice(bytes)
                    .map_err(|e| Error::DeserializationError(e.to_string()))?
            }
        }
    };
    Ok(unpacked)
}
