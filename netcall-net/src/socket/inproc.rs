//! In-process transport.
//!
//! Emulates router, dealer, pub and sub sockets on top of crossbeam
//! channels. Each socket owns a mailbox; connecting links two mailboxes in
//! both directions. Sockets find each other through the [`Registry`] of
//! bound endpoints kept by their shared context.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use fnv::FnvHashMap;

use netcall_core::Frames;

use super::SocketType;
use crate::error::{Error, Result};

const SCHEME: &str = "inproc://";

/// Bound endpoints by url.
#[derive(Default)]
pub(crate) struct Registry {
    endpoints: Mutex<FnvHashMap<String, Arc<Mailbox>>>,
}

pub(crate) struct Envelope {
    from: Vec<u8>,
    frames: Frames,
}

pub(crate) struct Mailbox {
    type_: SocketType,
    identity: Mutex<Vec<u8>>,
    sender: Sender<Envelope>,
    links: Mutex<Vec<Link>>,
}

struct Link {
    /// Url used to connect, only set on the connecting side
    endpoint: Option<String>,
    peer: Arc<Mailbox>,
}

impl Mailbox {
    fn deliver(&self, from: Vec<u8>, frames: Frames) -> Result<()> {
        self.sender
            .send(Envelope { from, frames })
            .map_err(|_| Error::HostUnreachable)
    }
}

fn compatible(a: SocketType, b: SocketType) -> bool {
    use SocketType::*;
    match (a, b) {
        (Router, Router) | (Router, Dealer) | (Dealer, Router) | (Dealer, Dealer) => true,
        (Pub, Sub) | (Sub, Pub) => true,
        _ => false,
    }
}

pub(crate) struct InprocSocket {
    registry: Arc<Registry>,
    mailbox: Arc<Mailbox>,
    receiver: Receiver<Envelope>,
    bound: Vec<String>,
    subscriptions: Vec<Vec<u8>>,
    router_mandatory: bool,
    next_peer: usize,
}

impl InprocSocket {
    pub fn new(
        registry: Arc<Registry>,
        type_: SocketType,
        identity: Vec<u8>,
        router_mandatory: bool,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let mailbox = Arc::new(Mailbox {
            type_,
            identity: Mutex::new(identity),
            sender,
            links: Mutex::new(Vec::new()),
        });
        Self {
            registry,
            mailbox,
            receiver,
            bound: Vec::new(),
            subscriptions: Vec::new(),
            router_mandatory,
            next_peer: 0,
        }
    }

    pub fn identity(&self) -> Result<Vec<u8>> {
        Ok(self.mailbox.identity.lock()?.clone())
    }

    pub fn bind(&mut self, url: &str) -> Result<()> {
        check_scheme(url)?;
        let mut endpoints = self.registry.endpoints.lock()?;
        if endpoints.contains_key(url) {
            return Err(Error::AddressInUse(url.to_string()));
        }
        endpoints.insert(url.to_string(), self.mailbox.clone());
        self.bound.push(url.to_string());
        Ok(())
    }

    pub fn unbind(&mut self, url: &str) -> Result<()> {
        let mut endpoints = self.registry.endpoints.lock()?;
        if let Some(mailbox) = endpoints.get(url) {
            if Arc::ptr_eq(mailbox, &self.mailbox) {
                endpoints.remove(url);
            }
        }
        self.bound.retain(|b| b != url);
        Ok(())
    }

    pub fn connect(&mut self, url: &str) -> Result<()> {
        check_scheme(url)?;
        if self
            .mailbox
            .links
            .lock()?
            .iter()
            .any(|l| l.endpoint.as_deref() == Some(url))
        {
            return Ok(());
        }
        let peer = self
            .registry
            .endpoints
            .lock()?
            .get(url)
            .cloned()
            .ok_or(Error::HostUnreachable)?;
        if !compatible(self.mailbox.type_, peer.type_) {
            return Err(Error::InvalidArgument(format!(
                "{:?} socket can't connect to {:?} socket at {}",
                self.mailbox.type_, peer.type_, url
            )));
        }
        // never hold two link locks at once
        peer.links.lock()?.push(Link {
            endpoint: None,
            peer: self.mailbox.clone(),
        });
        self.mailbox.links.lock()?.push(Link {
            endpoint: Some(url.to_string()),
            peer,
        });
        Ok(())
    }

    pub fn disconnect(&mut self, url: &str) -> Result<()> {
        let mut removed = Vec::new();
        self.mailbox.links.lock()?.retain(|l| {
            if l.endpoint.as_deref() == Some(url) {
                removed.push(l.peer.clone());
                false
            } else {
                true
            }
        });
        for peer in removed {
            peer.links
                .lock()?
                .retain(|l| !Arc::ptr_eq(&l.peer, &self.mailbox));
        }
        Ok(())
    }

    pub fn subscribe(&mut self, prefix: &[u8]) -> Result<()> {
        self.subscriptions.push(prefix.to_vec());
        Ok(())
    }

    fn peers(&self) -> Result<Vec<Arc<Mailbox>>> {
        Ok(self
            .mailbox
            .links
            .lock()?
            .iter()
            .map(|l| l.peer.clone())
            .collect())
    }

    pub fn send_multipart(&mut self, frames: &[Vec<u8>]) -> Result<()> {
        let identity = self.identity()?;
        match self.mailbox.type_ {
            SocketType::Router => {
                let (target, rest) = frames
                    .split_first()
                    .ok_or_else(|| Error::InvalidArgument("empty message".to_string()))?;
                for peer in self.peers()? {
                    if *peer.identity.lock()? == *target {
                        return peer.deliver(identity, rest.to_vec());
                    }
                }
                if self.router_mandatory {
                    Err(Error::HostUnreachable)
                } else {
                    trace!("dropping message for unknown peer {:?}", target);
                    Ok(())
                }
            }
            SocketType::Dealer => {
                let peers = self.peers()?;
                if peers.is_empty() {
                    return Err(Error::SocketNotConnected);
                }
                let peer = &peers[self.next_peer % peers.len()];
                self.next_peer = self.next_peer.wrapping_add(1);
                peer.deliver(identity, frames.to_vec())
            }
            SocketType::Pub => {
                for peer in self.peers()? {
                    if let Err(e) = peer.deliver(identity.clone(), frames.to_vec()) {
                        trace!("publish to gone subscriber failed: {}", e);
                    }
                }
                Ok(())
            }
            SocketType::Sub => Err(Error::Unsupported(
                "sub sockets can't send".to_string(),
            )),
        }
    }

    pub fn recv_multipart(&mut self) -> Result<Frames> {
        loop {
            let envelope = self.receiver.recv().map_err(|_| Error::ShutDown)?;
            if let Some(frames) = self.accept(envelope) {
                return Ok(frames);
            }
        }
    }

    pub fn try_recv_multipart(&mut self) -> Result<Option<Frames>> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    if let Some(frames) = self.accept(envelope) {
                        return Ok(Some(frames));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(Error::ShutDown),
            }
        }
    }

    fn accept(&self, envelope: Envelope) -> Option<Frames> {
        match self.mailbox.type_ {
            SocketType::Router => {
                let mut frames = Vec::with_capacity(envelope.frames.len() + 1);
                frames.push(envelope.from);
                frames.extend(envelope.frames);
                Some(frames)
            }
            SocketType::Sub => {
                let topic = envelope.frames.first().map(|f| f.as_slice()).unwrap_or(&[]);
                if self.subscriptions.iter().any(|s| topic.starts_with(s)) {
                    Some(envelope.frames)
                } else {
                    None
                }
            }
            SocketType::Dealer | SocketType::Pub => Some(envelope.frames),
        }
    }

    pub fn is_readable(&self) -> bool {
        !self.receiver.is_empty()
    }

    pub fn receiver(&self) -> &Receiver<Envelope> {
        &self.receiver
    }
}

impl Drop for InprocSocket {
    fn drop(&mut self) {
        if let Ok(mut endpoints) = self.registry.endpoints.lock() {
            for url in &self.bound {
                if let Some(mailbox) = endpoints.get(url) {
                    if Arc::ptr_eq(mailbox, &self.mailbox) {
                        endpoints.remove(url);
                    }
                }
            }
        }
        let links = match self.mailbox.links.lock() {
            Ok(mut links) => std::mem::take(&mut *links),
            Err(_) => return,
        };
        for link in links {
            if let Ok(mut peer_links) = link.peer.links.lock() {
                peer_links.retain(|l| !Arc::ptr_eq(&l.peer, &self.mailbox));
            }
        }
    }
}

fn check_scheme(url: &str) -> Result<()> {
    if url.starts_with(SCHEME) && url.len() > SCHEME.len() {
        Ok(())
    } else {
        Err(Error::InvalidAddress(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket(reg: &Arc<Registry>, type_: SocketType, id: &[u8]) -> InprocSocket {
        InprocSocket::new(reg.clone(), type_, id.to_vec(), true)
    }

    fn frames(parts: &[&[u8]]) -> Frames {
        parts.iter().map(|p| p.to_vec()).collect()
    }

    #[test]
    fn router_dealer_round_trip() {
        let reg = Arc::new(Registry::default());
        let mut router = socket(&reg, SocketType::Router, b"R");
        router.bind("inproc://rd").unwrap();
        let mut dealer = socket(&reg, SocketType::Dealer, b"D");
        dealer.connect("inproc://rd").unwrap();

        dealer.send_multipart(&frames(&[b"hello"])).unwrap();
        let got = router.try_recv_multipart().unwrap().unwrap();
        assert_eq!(got, frames(&[b"D", b"hello"]));

        router.send_multipart(&frames(&[b"D", b"back"])).unwrap();
        assert_eq!(dealer.recv_multipart().unwrap(), frames(&[b"back"]));
        assert_eq!(dealer.try_recv_multipart().unwrap(), None);
    }

    #[test]
    fn mandatory_router_rejects_unknown_peer() {
        let reg = Arc::new(Registry::default());
        let mut router = socket(&reg, SocketType::Router, b"R");
        assert!(matches!(
            router.send_multipart(&frames(&[b"nobody", b"x"])),
            Err(Error::HostUnreachable)
        ));
    }

    #[test]
    fn dealer_without_peers_fails() {
        let reg = Arc::new(Registry::default());
        let mut dealer = socket(&reg, SocketType::Dealer, b"D");
        assert!(matches!(
            dealer.send_multipart(&frames(&[b"x"])),
            Err(Error::SocketNotConnected)
        ));
        assert!(matches!(
            dealer.connect("inproc://missing"),
            Err(Error::HostUnreachable)
        ));
    }

    #[test]
    fn bind_twice_is_address_in_use() {
        let reg = Arc::new(Registry::default());
        let mut a = socket(&reg, SocketType::Router, b"A");
        let mut b = socket(&reg, SocketType::Router, b"B");
        a.bind("inproc://taken").unwrap();
        assert!(matches!(b.bind("inproc://taken"), Err(Error::AddressInUse(_))));
        drop(a);
        b.bind("inproc://taken").unwrap();
    }

    #[test]
    fn disconnect_and_drop_unlink_peers() {
        let reg = Arc::new(Registry::default());
        let mut router = socket(&reg, SocketType::Router, b"R");
        router.bind("inproc://unlink").unwrap();
        let mut dealer = socket(&reg, SocketType::Dealer, b"D");
        dealer.connect("inproc://unlink").unwrap();
        dealer.disconnect("inproc://unlink").unwrap();
        assert!(router.send_multipart(&frames(&[b"D", b"x"])).is_err());

        dealer.connect("inproc://unlink").unwrap();
        drop(dealer);
        assert!(router.send_multipart(&frames(&[b"D", b"x"])).is_err());
    }

    #[test]
    fn pub_sub_filters_by_prefix() {
        let reg = Arc::new(Registry::default());
        let mut publisher = socket(&reg, SocketType::Pub, b"P");
        publisher.bind("inproc://ps").unwrap();
        let mut all = socket(&reg, SocketType::Sub, b"S1");
        all.subscribe(b"").unwrap();
        all.connect("inproc://ps").unwrap();
        let mut picky = socket(&reg, SocketType::Sub, b"S2");
        picky.subscribe(b"EX").unwrap();
        picky.connect("inproc://ps").unwrap();

        publisher.send_multipart(&frames(&[b"other"])).unwrap();
        publisher.send_multipart(&frames(&[b"EXIT"])).unwrap();
        assert_eq!(all.try_recv_multipart().unwrap(), Some(frames(&[b"other"])));
        assert_eq!(all.try_recv_multipart().unwrap(), Some(frames(&[b"EXIT"])));
        assert_eq!(picky.try_recv_multipart().unwrap(), Some(frames(&[b"EXIT"])));
        assert_eq!(picky.try_recv_multipart().unwrap(), None);
    }

    #[test]
    fn incompatible_types_refuse_to_connect() {
        let reg = Arc::new(Registry::default());
        let mut publisher = socket(&reg, SocketType::Pub, b"P");
        publisher.bind("inproc://typed").unwrap();
        let mut dealer = socket(&reg, SocketType::Dealer, b"D");
        assert!(matches!(
            dealer.connect("inproc://typed"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
