use std::time::Duration;

use netcall_core::Frames;

use crate::error::{Error, Result};

/// Wrapper over a ZeroMQ socket.
pub(crate) struct ZmqSocket {
    inner: zmq::Socket,
}

impl ZmqSocket {
    pub fn new(
        ctx: &zmq::Context,
        type_: super::SocketType,
        identity: &[u8],
        router_mandatory: bool,
    ) -> Result<Self> {
        let socket_type = match type_ {
            super::SocketType::Router => zmq::SocketType::ROUTER,
            super::SocketType::Dealer => zmq::SocketType::DEALER,
            super::SocketType::Pub => zmq::SocketType::PUB,
            super::SocketType::Sub => zmq::SocketType::SUB,
        };
        let inner = ctx.socket(socket_type)?;
        inner.set_linger(0)?;
        if type_ == super::SocketType::Router || type_ == super::SocketType::Dealer {
            inner.set_identity(identity)?;
        }
        if type_ == super::SocketType::Router {
            inner.set_router_mandatory(router_mandatory)?;
        }
        Ok(Self { inner })
    }

    pub fn identity(&self) -> Result<Vec<u8>> {
        Ok(self.inner.get_identity()?)
    }

    pub fn bind(&mut self, url: &str) -> Result<()> {
        self.inner.bind(url).map_err(|e| match e {
            zmq::Error::EADDRINUSE => Error::AddressInUse(url.to_string()),
            e => e.into(),
        })
    }

    pub fn unbind(&mut self, url: &str) -> Result<()> {
        Ok(self.inner.unbind(url)?)
    }

    pub fn connect(&mut self, url: &str) -> Result<()> {
        Ok(self.inner.connect(url)?)
    }

    pub fn disconnect(&mut self, url: &str) -> Result<()> {
        match self.inner.disconnect(url) {
            // not connected to begin with
            Err(zmq::Error::ENOENT) => Ok(()),
            r => Ok(r?),
        }
    }

    pub fn subscribe(&mut self, prefix: &[u8]) -> Result<()> {
        Ok(self.inner.set_subscribe(prefix)?)
    }

    pub fn send_multipart(&mut self, frames: &[Vec<u8>]) -> Result<()> {
        self.inner
            .send_multipart(frames.iter().map(|f| f.as_slice()), 0)
            .map_err(|e| match e {
                zmq::Error::EHOSTUNREACH => Error::HostUnreachable,
                zmq::Error::EAGAIN => Error::WouldBlock,
                e => e.into(),
            })
    }

    pub fn recv_multipart(&mut self) -> Result<Frames> {
        Ok(self.inner.recv_multipart(0)?)
    }

    pub fn try_recv_multipart(&mut self) -> Result<Option<Frames>> {
        match self.inner.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => Ok(Some(frames)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Polls the sockets for incoming messages, returning readiness per socket.
pub(crate) fn poll_readable(sockets: &[&ZmqSocket], timeout: Duration) -> Result<Vec<bool>> {
    let mut items: Vec<zmq::PollItem> = sockets
        .iter()
        .map(|s| s.inner.as_poll_item(zmq::POLLIN))
        .collect();
    zmq::poll(&mut items, timeout.as_millis() as i64)?;
    Ok(items.iter().map(|i| i.is_readable()).collect())
}
