//! Worker bookkeeping shared by the balancer loops.

use std::collections::VecDeque;

use fnv::{FnvHashMap, FnvHashSet};
use rand::seq::SliceRandom;

use netcall_core::proto::{self, Frames, ReplyType};
use netcall_core::PriorityDict;

use crate::discovery::WorkerId;
use crate::error::Result;

/// Requests are tracked by client route and request id.
type FlightKey = (Vec<Vec<u8>>, Vec<u8>);

#[derive(Debug, Clone)]
struct Flight {
    worker: WorkerId,
    counted: bool,
}

/// Difference between the known address set and a discovery result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub fresh: Vec<(String, WorkerId)>,
    pub stale: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.fresh.is_empty() && self.stale.is_empty()
    }
}

/// Snapshot of the balancer state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Addresses returned by the last discovery, sorted
    pub known: Vec<String>,
    /// Selectable workers with their running counts, sorted by id
    pub workers: Vec<(WorkerId, u64)>,
    /// Requests waiting for a worker
    pub pending: usize,
    /// Requests forwarded and not yet answered
    pub inflight: usize,
}

/// All state mutated by more than one balancer loop. Kept behind a single
/// lock.
#[derive(Default)]
pub struct RoutingTable {
    known: FnvHashSet<String>,
    addresses: FnvHashMap<WorkerId, String>,
    load: PriorityDict<WorkerId>,
    pending: VecDeque<Frames>,
    inflight: FnvHashMap<FlightKey, Flight>,
    streams: FnvHashMap<FlightKey, WorkerId>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciles the known set with a discovery result.
    ///
    /// Stale workers are dropped right away, in-flight requests included.
    /// Fresh workers are remembered but only become selectable once passed
    /// to [`RoutingTable::register`].
    pub fn apply_discovery(&mut self, discovered: &FnvHashMap<String, WorkerId>) -> Diff {
        let mut diff = Diff::default();
        let mut stale: Vec<String> = self
            .known
            .iter()
            .filter(|a| !discovered.contains_key(*a))
            .cloned()
            .collect();
        stale.sort();
        for address in &stale {
            self.known.remove(address);
            let gone: Vec<WorkerId> = self
                .addresses
                .iter()
                .filter(|(_, a)| *a == address)
                .map(|(w, _)| w.clone())
                .collect();
            for worker in gone {
                self.forget(&worker);
            }
        }
        diff.stale = stale;

        for (address, worker) in discovered {
            if self.known.contains(address) {
                continue;
            }
            self.known.insert(address.clone());
            self.addresses.insert(worker.clone(), address.clone());
            diff.fresh.push((address.clone(), worker.clone()));
        }
        diff.fresh.sort();
        if !diff.is_empty() {
            debug!(
                "discovery: {} fresh, {} stale, {} known",
                diff.fresh.len(),
                diff.stale.len(),
                self.known.len()
            );
        }
        diff
    }

    /// Makes fresh workers selectable at a running count of zero, in
    /// random order. Workers that went away in the meantime are skipped.
    /// Returns the number of workers registered.
    pub fn register(&mut self, fresh: &[(String, WorkerId)]) -> usize {
        let mut order: Vec<&(String, WorkerId)> = fresh.iter().collect();
        order.shuffle(&mut rand::thread_rng());
        let mut count = 0;
        for (address, worker) in order {
            if self.addresses.get(worker) != Some(address) || self.load.contains(worker) {
                continue;
            }
            self.load.set(worker.clone(), 0);
            count += 1;
        }
        if count > 0 {
            info!("{} workers selectable", self.load.len());
        }
        count
    }

    /// Removes a worker that failed a send. It's also dropped from the
    /// known set so the next discovery round brings it back as fresh.
    pub fn evict(&mut self, worker: &WorkerId) -> Option<String> {
        let address = self.forget(worker);
        if let Some(a) = &address {
            self.known.remove(a);
        }
        warn!("evicted worker {} at {:?}", worker, address);
        address
    }

    fn forget(&mut self, worker: &WorkerId) -> Option<String> {
        self.load.remove(worker);
        self.inflight.retain(|_, f| &f.worker != worker);
        self.streams.retain(|_, w| w != worker);
        self.addresses.remove(worker)
    }

    /// Least loaded selectable worker.
    pub fn pick_worker(&mut self) -> Option<WorkerId> {
        self.load.peek_min().map(|(w, _)| w.clone())
    }

    pub fn is_selectable(&self, worker: &WorkerId) -> bool {
        self.load.contains(worker)
    }

    pub fn running_count(&self, worker: &WorkerId) -> Option<u64> {
        self.load.get(worker)
    }

    /// Buffers a client request. Malformed requests are dropped.
    pub fn enqueue(&mut self, frames: Frames) -> bool {
        if proto::peek_request(&frames).is_none() {
            debug!("dropping malformed request of {} frames", frames.len());
            return false;
        }
        self.pending.push_back(frames);
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sends buffered requests in order for as long as there are both
    /// requests and selectable workers. A request whose send fails goes
    /// back to the front of the buffer and the worker is evicted. Returns
    /// the number of requests sent.
    pub fn drain<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(&WorkerId, &Frames) -> Result<()>,
    {
        let mut sent = 0;
        while let Some(frames) = self.pending.pop_front() {
            let (key, control, ignore) = match proto::peek_request(&frames) {
                Some(head) => (
                    (head.route.to_vec(), head.req_id.to_vec()),
                    head.is_control(),
                    head.ignore,
                ),
                None => continue,
            };
            let pinned = if control {
                self.streams
                    .get(&key)
                    .filter(|w| self.load.contains(w))
                    .cloned()
            } else {
                None
            };
            let worker = match pinned.clone().or_else(|| self.pick_worker()) {
                Some(w) => w,
                None => {
                    self.pending.push_front(frames);
                    break;
                }
            };
            if let Err(e) = send(&worker, &frames) {
                warn!("send to worker {} failed: {}", worker, e);
                self.pending.push_front(frames);
                self.evict(&worker);
                continue;
            }
            sent += 1;
            if pinned.is_some() && self.inflight.contains_key(&key) {
                continue;
            }
            if !ignore {
                self.load.increment(&worker);
                self.inflight.insert(
                    key,
                    Flight {
                        worker,
                        counted: true,
                    },
                );
            }
        }
        sent
    }

    /// Handles a reply from a worker. The leading frame is the worker id
    /// and gets stripped, the rest is returned for forwarding to the
    /// client. Malformed replies yield `None`.
    pub fn on_reply(&mut self, mut frames: Frames) -> Option<Frames> {
        if frames.len() < 2 {
            debug!("dropping short reply from worker");
            return None;
        }
        let worker = WorkerId(frames.remove(0));
        let (key, type_, payload_len) = match proto::peek_reply(&frames) {
            Some(head) => (
                (head.route.to_vec(), head.req_id.to_vec()),
                head.type_,
                head.payload_len,
            ),
            None => {
                debug!("dropping malformed reply from worker {}", worker);
                return None;
            }
        };
        match type_ {
            ReplyType::Ack => (),
            ReplyType::Yield => {
                if payload_len == 0 && self.inflight.contains_key(&key) {
                    self.streams.insert(key, worker);
                }
            }
            ReplyType::Ok | ReplyType::Fail => {
                self.streams.remove(&key);
                if let Some(flight) = self.inflight.remove(&key) {
                    if flight.counted {
                        self.load.decrement(&flight.worker);
                    }
                }
            }
        }
        Some(frames)
    }

    pub fn stats(&self) -> Stats {
        let mut known: Vec<String> = self.known.iter().cloned().collect();
        known.sort();
        let mut workers: Vec<(WorkerId, u64)> =
            self.load.iter().map(|(w, c)| (w.clone(), c)).collect();
        workers.sort();
        Stats {
            known,
            workers,
            pending: self.pending.len(),
            inflight: self.inflight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use netcall_core::proto::{Reply, Request, PROC_SEND};

    fn discovered(peers: &[(&str, &str)]) -> FnvHashMap<String, WorkerId> {
        peers
            .iter()
            .map(|(a, w)| (a.to_string(), WorkerId::from(*w)))
            .collect()
    }

    fn table_with(peers: &[(&str, &str)]) -> RoutingTable {
        let mut table = RoutingTable::new();
        let diff = table.apply_discovery(&discovered(peers));
        table.register(&diff.fresh);
        table
    }

    fn request(client: &str, id: u8, proc_name: &str, ignore: bool) -> Frames {
        let mut req = Request::new(vec![id], proc_name, vec![], vec![], ignore);
        req.route = vec![client.as_bytes().to_vec()];
        req.into_frames()
    }

    fn reply(worker: &str, client: &str, id: u8, type_: ReplyType, payload: Vec<Vec<u8>>) -> Frames {
        let mut frames = vec![worker.as_bytes().to_vec()];
        frames.extend(Reply::new(vec![client.as_bytes().to_vec()], vec![id], type_, payload).into_frames());
        frames
    }

    fn send_all(table: &mut RoutingTable) -> Vec<WorkerId> {
        let mut targets = Vec::new();
        table.drain(|w, _| {
            targets.push(w.clone());
            Ok(())
        });
        targets
    }

    #[test]
    fn fresh_workers_wait_for_registration() {
        let mut table = RoutingTable::new();
        let diff = table.apply_discovery(&discovered(&[("inproc://a", "a")]));
        assert_eq!(diff.fresh, vec![("inproc://a".to_string(), WorkerId::from("a"))]);
        assert_eq!(table.pick_worker(), None);
        assert_eq!(table.register(&diff.fresh), 1);
        assert_eq!(table.pick_worker(), Some(WorkerId::from("a")));
    }

    #[test]
    fn idle_ties_are_spread_across_workers() {
        let peers = [("inproc://a", "a"), ("inproc://b", "b"), ("inproc://c", "c"), ("inproc://d", "d")];
        let mut firsts = std::collections::HashSet::new();
        for _ in 0..200 {
            let mut table = table_with(&peers);
            firsts.insert(table.pick_worker().unwrap());
        }
        assert!(firsts.len() > 1, "always picked {:?}", firsts);
    }

    #[test]
    fn least_loaded_is_picked() {
        let mut table = table_with(&[("inproc://a", "A"), ("inproc://b", "B")]);
        table.load.set(WorkerId::from("A"), 3);
        table.load.set(WorkerId::from("B"), 1);
        assert_eq!(table.pick_worker(), Some(WorkerId::from("B")));
    }

    #[test]
    fn load_converges() {
        let mut table = table_with(&[("a", "a"), ("b", "b"), ("c", "c"), ("d", "d")]);
        for i in 0..103u32 {
            let mut req = Request::new(i.to_be_bytes().to_vec(), "work", vec![], vec![], false);
            req.route = vec![b"client".to_vec()];
            table.enqueue(req.into_frames());
        }
        assert_eq!(send_all(&mut table).len(), 103);
        let counts: Vec<u64> = table.stats().workers.iter().map(|(_, c)| *c).collect();
        let max = counts.iter().max().unwrap();
        let min = counts.iter().min().unwrap();
        assert!(max - min <= 1, "{:?}", counts);
        assert_eq!(counts.iter().sum::<u64>(), 103);
    }

    #[test]
    fn terminal_replies_decrement_once() {
        let mut table = table_with(&[("inproc://a", "a")]);
        table.enqueue(request("c", 1, "work", false));
        table.enqueue(request("c", 2, "work", true));
        send_all(&mut table);
        let a = WorkerId::from("a");
        assert_eq!(table.running_count(&a), Some(1));

        assert!(table.on_reply(reply("a", "c", 1, ReplyType::Ack, vec![])).is_some());
        assert_eq!(table.running_count(&a), Some(1));
        let forwarded = table.on_reply(reply("a", "c", 1, ReplyType::Ok, vec![vec![7]])).unwrap();
        assert_eq!(forwarded[0], b"c".to_vec());
        assert_eq!(table.running_count(&a), Some(0));

        // repeated and unexpected terminal replies never go below zero
        table.on_reply(reply("a", "c", 1, ReplyType::Fail, vec![]));
        table.on_reply(reply("a", "c", 2, ReplyType::Ok, vec![]));
        assert_eq!(table.running_count(&a), Some(0));
    }

    #[test]
    fn no_workers_keeps_requests_buffered() {
        let mut table = RoutingTable::new();
        table.enqueue(request("c", 1, "work", false));
        table.enqueue(request("c", 2, "work", false));
        assert!(!table.enqueue(vec![b"junk".to_vec()]));
        assert!(send_all(&mut table).is_empty());
        assert_eq!(table.pending_len(), 2);

        let diff = table.apply_discovery(&discovered(&[("inproc://a", "a")]));
        table.register(&diff.fresh);
        assert_eq!(send_all(&mut table).len(), 2);
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn failed_send_requeues_at_front_and_evicts() {
        let mut table = table_with(&[("inproc://a", "a"), ("inproc://b", "b")]);
        table.load.set(WorkerId::from("b"), 5);
        table.enqueue(request("c", 1, "first", false));
        table.enqueue(request("c", 2, "second", false));

        let mut order = Vec::new();
        table.drain(|w, frames| {
            if w.as_bytes() == b"a" {
                return Err(Error::HostUnreachable);
            }
            order.push(proto::peek_request(frames).unwrap().req_id.to_vec());
            Ok(())
        });
        assert_eq!(order, vec![vec![1], vec![2]]);
        assert!(!table.is_selectable(&WorkerId::from("a")));
        assert_eq!(table.stats().known, vec!["inproc://b".to_string()]);
        assert_eq!(table.running_count(&WorkerId::from("b")), Some(7));
    }

    #[test]
    fn stale_workers_are_dropped_with_their_flights() {
        let mut table = table_with(&[("inproc://a", "a"), ("inproc://b", "b")]);
        table.enqueue(request("c", 1, "work", false));
        table.enqueue(request("c", 2, "work", false));
        send_all(&mut table);
        assert_eq!(table.stats().inflight, 2);

        let diff = table.apply_discovery(&discovered(&[("inproc://b", "b")]));
        assert_eq!(diff.stale, vec!["inproc://a".to_string()]);
        assert!(diff.fresh.is_empty());
        assert!(!table.is_selectable(&WorkerId::from("a")));
        assert_eq!(table.stats().inflight, 1);

        // a late reply from the removed worker is still forwarded
        assert!(table.on_reply(reply("a", "c", 1, ReplyType::Ok, vec![])).is_some());
        assert!(table.on_reply(reply("a", "c", 2, ReplyType::Ok, vec![])).is_some());
        assert_eq!(table.running_count(&WorkerId::from("b")), Some(0));
    }

    #[test]
    fn churn_never_routes_to_removed_workers() {
        let all = [
            ("inproc://a", "a"),
            ("inproc://b", "b"),
            ("inproc://c", "c"),
            ("inproc://d", "d"),
        ];
        let mut table = RoutingTable::new();
        let mut next_id = 0u8;
        for round in 0..12usize {
            // a sliding window of three workers out of four
            let live: Vec<(&str, &str)> = (0..3).map(|n| all[(round + n) % all.len()]).collect();
            let diff = table.apply_discovery(&discovered(&live));
            table.register(&diff.fresh);
            for _ in 0..5 {
                next_id = next_id.wrapping_add(1);
                table.enqueue(request("c", next_id, "work", false));
            }
            let live_ids: Vec<WorkerId> = live.iter().map(|(_, w)| WorkerId::from(*w)).collect();
            table.drain(|w, _| {
                assert!(live_ids.contains(w), "routed to removed worker {}", w);
                Ok(())
            });
            assert_eq!(table.pending_len(), 0);
        }
    }

    #[test]
    fn registration_skips_workers_gone_since_discovery() {
        let mut table = RoutingTable::new();
        let diff = table.apply_discovery(&discovered(&[("inproc://a", "a")]));
        table.apply_discovery(&discovered(&[]));
        assert_eq!(table.register(&diff.fresh), 0);
        assert_eq!(table.pick_worker(), None);
    }

    #[test]
    fn stream_controls_follow_their_worker() {
        let mut table = table_with(&[("inproc://a", "a"), ("inproc://b", "b")]);
        table.enqueue(request("c", 1, "count", false));
        let first = send_all(&mut table)[0].clone();
        let name = String::from_utf8(first.0.clone()).unwrap();
        table.on_reply(reply(&name, "c", 1, ReplyType::Yield, vec![]));

        // other traffic would normally go to the idle worker
        for _ in 0..3 {
            table.enqueue(request("c", 1, PROC_SEND, false));
            assert_eq!(send_all(&mut table), vec![first.clone()]);
        }
        assert_eq!(table.running_count(&first), Some(1));

        table.on_reply(reply(&name, "c", 1, ReplyType::Fail, vec![]));
        assert_eq!(table.running_count(&first), Some(0));
        assert_eq!(table.stats().inflight, 0);
    }
}
