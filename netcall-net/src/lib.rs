//! This library provides the networking constructs of `netcall`.
//!
//! Three constructs talk to each other over message sockets:
//!
//! - [`Client`] issues calls and correlates the replies, either blocking,
//!   through a future, or fire-and-forget. Streaming results are consumed
//!   through a [`RemoteGenerator`].
//! - [`Service`] exposes named procedures and runs them on request,
//!   driving generators for procedures that stream.
//! - [`Balancer`] sits between many clients and a changing set of
//!   services, forwarding each request to the least loaded one.
//!
//! All three are built from loops stepped by a [`Scheduler`]. The same
//! logic runs with a thread per loop ([`ThreadScheduler`]) or with all
//! loops multiplexed on whichever thread is waiting
//! ([`CoopScheduler`]). The scheduler is chosen once by the application
//! and handed to every construct.
//!
//!
//! # Transports
//!
//! The in-process transport (`inproc://` addresses) is always available
//! and is what the tests use. ZeroMQ `tcp://` and `ipc://` addresses need
//! the `zmq_transport` feature:
//!
//! ```toml
//! netcall-net = { version = "*", features = ["zmq_transport"] }
//! ```
//!
//! Asking for a transport that wasn't compiled in returns
//! [`Error::TransportUnavailable`].

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod balancer;
pub mod client;
pub mod discovery;
pub mod future;
pub mod sched;
pub mod service;
pub mod socket;

mod error;

pub use balancer::{Balancer, BalancerConfig, BalancerHandle, Stats};
pub use client::{CallMode, CallResult, Client, ClientConfig, RemoteGenerator, Response};
pub use discovery::{Discovery, StaticDiscovery, WorkerId};
pub use future::RpcFuture;
pub use sched::{CoopScheduler, Scheduler, ThreadScheduler};
pub use service::{
    ExposeProcedures, Handler, Outcome, ProcError, Service, ServiceConfig, ServiceHandle,
};
pub use socket::{Context, Transport};

pub use error::{Error, Result};
