//! Socket abstraction over the available transports.
//!
//! Sockets follow the router/dealer/pub/sub model. A router prepends the
//! sender's identity to every message it receives and takes the first frame
//! of every message it sends as the destination identity. A dealer sends to
//! its peers in turn. A publisher copies each message to every subscriber
//! whose subscription prefix matches the first frame.
//!
//! Every socket is owned by exactly one loop. Nothing here is meant to be
//! shared between threads without the owner's knowledge.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Select;
use rand::Rng;
use serde_repr::{Deserialize_repr, Serialize_repr};

use netcall_core::Frames;

use crate::error::{Error, Result};

pub(crate) mod inproc;
#[cfg(feature = "zmq_transport")]
pub(crate) mod zmq;

/// List of possible network transports.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum Transport {
    /// In-process transport built on channels, always available
    Inproc,
    /// ZeroMQ based TCP transport
    ZmqTcp,
    /// ZeroMQ based IPC transport
    ZmqIpc,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Inproc
    }
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inproc => write!(f, "inproc"),
            Self::ZmqTcp => write!(f, "zmq_tcp"),
            Self::ZmqIpc => write!(f, "zmq_ipc"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let transport = match s.to_lowercase().as_str() {
            "inproc" => Transport::Inproc,
            "zmq_tcp" | "zmq" | "zeromq" | "tcp" => Transport::ZmqTcp,
            "zmq_ipc" | "ipc" => Transport::ZmqIpc,
            _ => {
                return Err(Error::Other(format!(
                    "failed parsing transport from string: {}",
                    s
                )))
            }
        };
        transport.check_available()?;
        Ok(transport)
    }
}

impl Transport {
    /// Picks the transport matching the scheme of the given url.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url
            .split("://")
            .next()
            .filter(|_| url.contains("://"))
            .ok_or_else(|| Error::InvalidAddress(url.to_string()))?;
        let transport = match scheme {
            "inproc" => Transport::Inproc,
            "tcp" => Transport::ZmqTcp,
            "ipc" => Transport::ZmqIpc,
            _ => return Err(Error::InvalidAddress(url.to_string())),
        };
        transport.check_available()?;
        Ok(transport)
    }

    /// Errors if the transport was compiled out.
    pub fn check_available(&self) -> Result<()> {
        match self {
            Transport::Inproc => Ok(()),
            Transport::ZmqTcp | Transport::ZmqIpc => {
                #[cfg(feature = "zmq_transport")]
                return Ok(());
                #[cfg(not(feature = "zmq_transport"))]
                return Err(Error::TransportUnavailable(*self));
            }
        }
    }

    fn is_zmq(&self) -> bool {
        matches!(self, Transport::ZmqTcp | Transport::ZmqIpc)
    }
}

/// Messaging pattern implemented by a socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SocketType {
    Router,
    Dealer,
    Pub,
    Sub,
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Defines the possible behavior of the socket
    pub type_: SocketType,
    pub transport: Transport,
    /// Routing identity presented to peers, random if not set
    pub identity: Option<Vec<u8>>,
    /// Make routers fail sends to unknown identities instead of dropping
    pub router_mandatory: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            type_: SocketType::Dealer,
            transport: Transport::Inproc,
            identity: None,
            router_mandatory: true,
        }
    }
}

/// Shared state sockets need to find each other.
///
/// Sockets can only talk over `inproc` if they were created from the same
/// context.
#[derive(Clone)]
pub struct Context {
    pub(crate) inproc: Arc<inproc::Registry>,
    #[cfg(feature = "zmq_transport")]
    zmq: ::zmq::Context,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            inproc: Arc::new(inproc::Registry::default()),
            #[cfg(feature = "zmq_transport")]
            zmq: ::zmq::Context::new(),
        }
    }
}

/// Main socket abstraction.
pub struct Socket {
    inner: InnerSocket,
    type_: SocketType,
    transport: Transport,
}

/// Wrapper over different socket types by transport.
pub(crate) enum InnerSocket {
    Inproc(inproc::InprocSocket),
    #[cfg(feature = "zmq_transport")]
    Zmq(zmq::ZmqSocket),
}

impl Socket {
    pub fn new(ctx: &Context, type_: SocketType, transport: Transport) -> Result<Self> {
        Self::new_with_config(
            ctx,
            SocketConfig {
                type_,
                transport,
                ..SocketConfig::default()
            },
        )
    }

    pub fn new_with_config(ctx: &Context, config: SocketConfig) -> Result<Self> {
        config.transport.check_available()?;
        let identity = config.identity.clone().unwrap_or_else(random_identity);
        let inner = match config.transport {
            Transport::Inproc => InnerSocket::Inproc(inproc::InprocSocket::new(
                ctx.inproc.clone(),
                config.type_,
                identity,
                config.router_mandatory,
            )),
            Transport::ZmqTcp | Transport::ZmqIpc => {
                #[cfg(not(feature = "zmq_transport"))]
                return Err(Error::TransportUnavailable(config.transport));
                #[cfg(feature = "zmq_transport")]
                InnerSocket::Zmq(zmq::ZmqSocket::new(
                    &ctx.zmq,
                    config.type_,
                    &identity,
                    config.router_mandatory,
                )?)
            }
        };
        Ok(Self {
            inner,
            type_: config.type_,
            transport: config.transport,
        })
    }

    pub fn type_(&self) -> SocketType {
        self.type_
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn identity(&self) -> Result<Vec<u8>> {
        match &self.inner {
            InnerSocket::Inproc(socket) => socket.identity(),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.identity(),
        }
    }

    pub fn bind(&mut self, url: &str) -> Result<()> {
        self.check_url(url)?;
        match &mut self.inner {
            InnerSocket::Inproc(socket) => socket.bind(url),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.bind(url),
        }
    }

    pub fn unbind(&mut self, url: &str) -> Result<()> {
        match &mut self.inner {
            InnerSocket::Inproc(socket) => socket.unbind(url),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.unbind(url),
        }
    }

    /// Connects to a socket bound at the provided address. Connecting to
    /// an address twice is a no-op.
    pub fn connect(&mut self, url: &str) -> Result<()> {
        self.check_url(url)?;
        match &mut self.inner {
            InnerSocket::Inproc(socket) => socket.connect(url),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.connect(url),
        }
    }

    pub fn disconnect(&mut self, url: &str) -> Result<()> {
        match &mut self.inner {
            InnerSocket::Inproc(socket) => socket.disconnect(url),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.disconnect(url),
        }
    }

    /// Subscribes to messages whose first frame starts with `prefix`.
    /// Only meaningful for sub sockets.
    pub fn subscribe(&mut self, prefix: &[u8]) -> Result<()> {
        if self.type_ != SocketType::Sub {
            return Err(Error::InvalidArgument(
                "only sub sockets can subscribe".to_string(),
            ));
        }
        match &mut self.inner {
            InnerSocket::Inproc(socket) => socket.subscribe(prefix),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.subscribe(prefix),
        }
    }

    pub fn send_multipart(&mut self, frames: &[Vec<u8>]) -> Result<()> {
        match &mut self.inner {
            InnerSocket::Inproc(socket) => socket.send_multipart(frames),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.send_multipart(frames),
        }
    }

    /// Receives the next message, blocking until one arrives.
    pub fn recv_multipart(&mut self) -> Result<Frames> {
        match &mut self.inner {
            InnerSocket::Inproc(socket) => socket.recv_multipart(),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.recv_multipart(),
        }
    }

    /// Receives the next message if one is waiting.
    pub fn try_recv_multipart(&mut self) -> Result<Option<Frames>> {
        match &mut self.inner {
            InnerSocket::Inproc(socket) => socket.try_recv_multipart(),
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(socket) => socket.try_recv_multipart(),
        }
    }

    fn check_url(&self, url: &str) -> Result<()> {
        let transport = Transport::from_url(url)?;
        if transport.is_zmq() != self.transport.is_zmq() {
            return Err(Error::InvalidAddress(format!(
                "{} can't be used with a {} socket",
                url, self.transport
            )));
        }
        Ok(())
    }
}

/// Waits until at least one of the sockets has a message to read, or the
/// timeout passes. Returns readiness per socket, in order.
///
/// A ready socket may still yield nothing on the next read, for example a
/// sub socket holding only filtered out messages.
pub fn poll(sockets: &[&Socket], timeout: Duration) -> Result<Vec<bool>> {
    let mut ready = vec![false; sockets.len()];
    let mut inproc = Vec::new();
    #[cfg(feature = "zmq_transport")]
    let mut zmq_idx = Vec::new();
    for (n, socket) in sockets.iter().enumerate() {
        match &socket.inner {
            InnerSocket::Inproc(s) => {
                ready[n] = s.is_readable();
                inproc.push((n, s));
            }
            #[cfg(feature = "zmq_transport")]
            InnerSocket::Zmq(s) => zmq_idx.push((n, s)),
        }
    }

    #[cfg(feature = "zmq_transport")]
    {
        if !zmq_idx.is_empty() {
            let wait = if ready.iter().any(|r| *r) {
                Duration::from_millis(0)
            } else {
                timeout
            };
            let socks: Vec<&zmq::ZmqSocket> = zmq_idx.iter().map(|(_, s)| *s).collect();
            let readable = zmq::poll_readable(&socks, wait)?;
            for ((n, _), r) in zmq_idx.iter().zip(readable) {
                ready[*n] = r;
            }
            // inproc sockets were checked without blocking
            for (n, s) in &inproc {
                ready[*n] = s.is_readable();
            }
            return Ok(ready);
        }
    }

    if ready.iter().any(|r| *r) || inproc.is_empty() || timeout == Duration::from_millis(0) {
        return Ok(ready);
    }
    let mut select = Select::new();
    for (_, s) in &inproc {
        select.recv(s.receiver());
    }
    // either outcome means readiness needs a fresh look
    let _ = select.ready_timeout(timeout);
    for (n, s) in &inproc {
        ready[*n] = s.is_readable();
    }
    Ok(ready)
}

/// Random routing identity. The leading zero byte keeps generated
/// identities apart from user supplied ones.
pub fn random_identity() -> Vec<u8> {
    let mut id = vec![0u8; 5];
    rand::thread_rng().fill(&mut id[1..]);
    id
}
