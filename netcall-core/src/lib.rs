//! This library implements the transport-independent parts of `netcall`.
//!
//! Everything here operates on plain multipart frames (`Vec<Vec<u8>>`) and
//! owned values, with no sockets or threads involved. Networking constructs
//! built on top of it live in `netcall-net`.
//!
//! # Wire protocol
//!
//! A request travels as
//!
//! ```text
//! [route..., SEP, req_id, proc_name, args, kwargs, ignore]
//! ```
//!
//! and every reply as
//!
//! ```text
//! [route..., SEP, req_id, type, payload...]
//! ```
//!
//! where `type` is one of `ACK`, `OK`, `YIELD` or `FAIL`. The `route` prefix
//! is whatever routing identities the transport prepends on the way in, and
//! is echoed back verbatim so the reply finds its way home through any
//! number of intermediaries. See [`proto`] for the codec.
//!
//! # Contents
//!
//! - [`value`]: the dynamically typed [`Value`] carried as arguments and
//!   results
//! - [`encoding`] and [`serializer`]: byte encodings of values
//! - [`remote`]: errors raised on the far side of a call
//! - [`gen`]: server-side generator state machine used for streaming
//!   results
//! - [`pqueue`]: priority dictionary used by the load balancer

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod encoding;
pub mod error;
pub mod gen;
pub mod pqueue;
pub mod proto;
pub mod remote;
pub mod serializer;
pub mod value;

pub use encoding::Encoding;
pub use error::{Error, Result};
pub use gen::{GenState, Generator, GeneratorSlot, Resume, Step};
pub use pqueue::PriorityDict;
pub use proto::{Frames, Reply, ReplyType, Request};
pub use remote::RemoteError;
pub use serializer::{EncodingSerializer, Serializer};
pub use value::{Args, Kwargs, Value};
