//! Worker discovery for the load balancer.

use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;

use crate::error::Result;

/// Routing identity of a worker as seen by the balancer's worker-facing
/// socket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Vec<u8>);

impl WorkerId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{}", s),
            _ => {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        WorkerId(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for WorkerId {
    fn from(v: Vec<u8>) -> Self {
        WorkerId(v)
    }
}

impl From<&[u8]> for WorkerId {
    fn from(v: &[u8]) -> Self {
        WorkerId(v.to_vec())
    }
}

/// Source of the current worker set, as a map of address to worker id.
///
/// Called periodically from the balancer's refresher. Errors are logged
/// and the refresh is retried on the next round.
pub trait Discovery: Send {
    fn discover(&mut self) -> Result<FnvHashMap<String, WorkerId>>;
}

impl<F> Discovery for F
where
    F: FnMut() -> Result<FnvHashMap<String, WorkerId>> + Send,
{
    fn discover(&mut self) -> Result<FnvHashMap<String, WorkerId>> {
        self()
    }
}

/// Fixed set of workers that can be changed from the outside while the
/// balancer is running.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Arc<Mutex<FnvHashMap<String, WorkerId>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers<I, W>(peers: I) -> Self
    where
        I: IntoIterator<Item = (String, W)>,
        W: Into<WorkerId>,
    {
        let map = peers.into_iter().map(|(a, w)| (a, w.into())).collect();
        Self {
            peers: Arc::new(Mutex::new(map)),
        }
    }

    pub fn insert(&self, address: &str, worker: WorkerId) -> Result<()> {
        self.peers.lock()?.insert(address.to_string(), worker);
        Ok(())
    }

    pub fn remove(&self, address: &str) -> Result<Option<WorkerId>> {
        Ok(self.peers.lock()?.remove(address))
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&mut self) -> Result<FnvHashMap<String, WorkerId>> {
        Ok(self.peers.lock()?.clone())
    }
}
