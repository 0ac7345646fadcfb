//! Pluggable conversion between values and frame payloads.

use crate::encoding::{pack, unpack, Encoding};
use crate::error::{Error, Result};
use crate::value::{Args, Kwargs, Value};

/// Converts call arguments and results to and from frame payloads.
///
/// Failures on the decoding side are reported as
/// [`Error::DeserializationError`] so callers can tell malformed input apart
/// from other failures.
pub trait Serializer: Send + Sync {
    fn serialize_args(&self, args: &Args, kwargs: &Kwargs) -> Result<(Vec<u8>, Vec<u8>)>;
    fn deserialize_args(&self, args: &[u8], kwargs: &[u8]) -> Result<(Args, Kwargs)>;
    /// Result payload as a list of frames appended after the reply type.
    fn serialize_result(&self, value: &Value) -> Result<Vec<Vec<u8>>>;
    fn deserialize_result(&self, frames: &[Vec<u8>]) -> Result<Value>;
}

/// Default serializer, encoding everything with a single [`Encoding`].
#[derive(Debug, Copy, Clone, Default)]
pub struct EncodingSerializer {
    pub encoding: Encoding,
}

impl EncodingSerializer {
    pub fn new(encoding: Encoding) -> Result<Self> {
        encoding.check_available()?;
        Ok(Self { encoding })
    }
}

impl Serializer for EncodingSerializer {
    fn serialize_args(&self, args: &Args, kwargs: &Kwargs) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((pack(args, self.encoding)?, pack(kwargs, self.encoding)?))
    }

    fn deserialize_args(&self, args: &[u8], kwargs: &[u8]) -> Result<(Args, Kwargs)> {
        Ok((unpack(args, self.encoding)?, unpack(kwargs, self.encoding)?))
    }

    fn serialize_result(&self, value: &Value) -> Result<Vec<Vec<u8>>> {
        Ok(vec![pack(value, self.encoding)?])
    }

    fn deserialize_result(&self, frames: &[Vec<u8>]) -> Result<Value> {
        match frames {
            [single] => unpack(single, self.encoding),
            _ => Err(Error::DeserializationError(format!(
                "expected a single result frame, got {}",
                frames.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_and_kwargs_survive_the_trip() {
        let ser = EncodingSerializer::default();
        let args = vec![Value::Int(1), Value::Str("two".to_string())];
        let mut kwargs = Kwargs::new();
        kwargs.insert("three".to_string(), Value::Float(3.0));
        let (a, k) = ser.serialize_args(&args, &kwargs).unwrap();
        assert_eq!(ser.deserialize_args(&a, &k).unwrap(), (args, kwargs));
    }

    #[test]
    fn garbage_is_reported_as_deserialization_error() {
        let ser = EncodingSerializer::default();
        assert!(matches!(
            ser.deserialize_args(b"\xff\xff\xff", b""),
            Err(Error::DeserializationError(_))
        ));
        assert!(matches!(
            ser.deserialize_result(&[]),
            Err(Error::DeserializationError(_))
        ));
    }
}
