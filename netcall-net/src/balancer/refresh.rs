//! Periodic worker discovery.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::balancer::io::Control;
use crate::balancer::table::RoutingTable;
use crate::discovery::{Discovery, WorkerId};
use crate::error::{Error, Result};
use crate::sched::{ExitListener, Poll, Task};

pub(crate) struct Refresher {
    pub discovery: Box<dyn Discovery>,
    pub table: Arc<Mutex<RoutingTable>>,
    pub control: Sender<Control>,
    pub exit: ExitListener,
    pub interval: Duration,
    pub empty_backoff: Duration,
    pub settle_delay: Duration,
    /// Time of the next discovery round
    pub next_round: Instant,
    /// Workers waiting for their connections to settle
    pub settling: Option<(Instant, Vec<(String, WorkerId)>)>,
}

impl Task for Refresher {
    fn name(&self) -> &str {
        "netcall-balancer-refresh"
    }

    fn manual_poll(&mut self, wait: Duration) -> Result<Poll> {
        if self.exit.triggered() {
            return Ok(Poll::Exit);
        }
        let now = Instant::now();
        let settled = match &self.settling {
            Some((at, _)) => *at <= now,
            None => false,
        };
        if settled {
            if let Some((_, fresh)) = self.settling.take() {
                self.register(&fresh)?;
            }
            return Ok(Poll::Busy);
        }
        if self.next_round <= now && self.settling.is_none() {
            self.refresh(now)?;
            return Ok(Poll::Busy);
        }

        let mut next = self.next_round;
        if let Some((at, _)) = &self.settling {
            next = next.min(*at);
        }
        let nap = next.saturating_duration_since(now).min(wait);
        if self.exit.sleep(nap) {
            return Ok(Poll::Exit);
        }
        Ok(Poll::Idle)
    }
}

impl Refresher {
    fn refresh(&mut self, now: Instant) -> Result<()> {
        let discovered = match self.discovery.discover() {
            Ok(d) => d,
            Err(e) => {
                warn!("discovery failed: {}", e);
                self.next_round = now + self.empty_backoff;
                return Ok(());
            }
        };
        self.next_round = if discovered.is_empty() {
            debug!("discovery found no workers, retrying in {:?}", self.empty_backoff);
            now + self.empty_backoff
        } else {
            now + self.interval
        };

        let diff = self.table.lock()?.apply_discovery(&discovered);
        if diff.is_empty() {
            return Ok(());
        }
        self.control
            .send(Control::Update {
                connect: diff.fresh.iter().map(|(a, _)| a.clone()).collect(),
                disconnect: diff.stale,
            })
            .map_err(|_| Error::ShutDown)?;
        if !diff.fresh.is_empty() {
            self.settling = Some((now + self.settle_delay, diff.fresh));
        }
        Ok(())
    }

    fn register(&mut self, fresh: &[(String, WorkerId)]) -> Result<()> {
        let pending = {
            let mut table = self.table.lock()?;
            table.register(fresh);
            table.pending_len()
        };
        if pending > 0 {
            self.control.send(Control::Drain).map_err(|_| Error::ShutDown)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crossbeam_channel::{unbounded, Receiver};
    use fnv::FnvHashMap;
    use netcall_core::proto::Request;

    use crate::discovery::StaticDiscovery;
    use crate::sched::ExitBroadcast;
    use crate::socket::Context;

    const NO_WAIT: Duration = Duration::from_millis(0);
    const SETTLE: Duration = Duration::from_millis(50);

    fn refresher<D: Discovery + 'static>(
        ctx: &Context,
        exit: &ExitBroadcast,
        discovery: D,
    ) -> (Refresher, Receiver<Control>) {
        let (tx, rx) = unbounded();
        let refresher = Refresher {
            discovery: Box::new(discovery),
            table: Arc::new(Mutex::new(RoutingTable::new())),
            control: tx,
            exit: exit.listener(ctx).unwrap(),
            interval: Duration::from_secs(60),
            empty_backoff: Duration::from_secs(3),
            settle_delay: SETTLE,
            next_round: Instant::now(),
            settling: None,
        };
        (refresher, rx)
    }

    fn peers(addresses: &[&str]) -> StaticDiscovery {
        StaticDiscovery::with_peers(
            addresses
                .iter()
                .map(|a| (format!("inproc://{}", a), WorkerId::from(*a))),
        )
    }

    fn assert_backs_off(refresher: &mut Refresher, control: &Receiver<Control>) {
        let before = Instant::now();
        assert_eq!(refresher.manual_poll(NO_WAIT).unwrap(), Poll::Busy);
        assert!(refresher.next_round >= before + Duration::from_secs(3));
        assert!(refresher.next_round < before + Duration::from_secs(60));
        assert!(control.try_recv().is_err());
        assert_eq!(refresher.manual_poll(NO_WAIT).unwrap(), Poll::Idle);
    }

    #[test]
    fn empty_and_failed_rounds_back_off() {
        let ctx = Context::new();
        let exit = ExitBroadcast::new(&ctx).unwrap();

        let nobody = || -> Result<FnvHashMap<String, WorkerId>> { Ok(FnvHashMap::default()) };
        let (mut empty, control) = refresher(&ctx, &exit, nobody);
        assert_backs_off(&mut empty, &control);

        let broken = || -> Result<FnvHashMap<String, WorkerId>> {
            Err(Error::Other("registry unreachable".to_string()))
        };
        let (mut failing, control) = refresher(&ctx, &exit, broken);
        assert_backs_off(&mut failing, &control);
    }

    #[test]
    fn fresh_workers_settle_before_selection() {
        let ctx = Context::new();
        let exit = ExitBroadcast::new(&ctx).unwrap();
        let (mut refresher, control) = refresher(&ctx, &exit, peers(&["a"]));

        assert_eq!(refresher.manual_poll(NO_WAIT).unwrap(), Poll::Busy);
        assert_eq!(
            control.try_recv().unwrap(),
            Control::Update {
                connect: vec!["inproc://a".to_string()],
                disconnect: vec![],
            }
        );
        assert_eq!(refresher.table.lock().unwrap().pick_worker(), None);
        assert_eq!(refresher.manual_poll(NO_WAIT).unwrap(), Poll::Idle);
        assert_eq!(refresher.table.lock().unwrap().pick_worker(), None);

        thread::sleep(SETTLE + Duration::from_millis(10));
        assert_eq!(refresher.manual_poll(NO_WAIT).unwrap(), Poll::Busy);
        assert_eq!(
            refresher.table.lock().unwrap().pick_worker(),
            Some(WorkerId::from("a"))
        );
        // nothing was buffered, so nothing to drain
        assert!(control.try_recv().is_err());
    }

    #[test]
    fn registration_drains_buffered_requests() {
        let ctx = Context::new();
        let exit = ExitBroadcast::new(&ctx).unwrap();
        let (mut refresher, control) = refresher(&ctx, &exit, peers(&["a"]));

        refresher.manual_poll(NO_WAIT).unwrap();
        assert!(matches!(control.try_recv(), Ok(Control::Update { .. })));
        let mut req = Request::new(vec![1], "work", vec![], vec![], false);
        req.route = vec![b"client".to_vec()];
        assert!(refresher.table.lock().unwrap().enqueue(req.into_frames()));

        thread::sleep(SETTLE + Duration::from_millis(10));
        assert_eq!(refresher.manual_poll(NO_WAIT).unwrap(), Poll::Busy);
        assert_eq!(control.try_recv().unwrap(), Control::Drain);
    }

    #[test]
    fn vanished_workers_are_disconnected() {
        let ctx = Context::new();
        let exit = ExitBroadcast::new(&ctx).unwrap();
        let discovery = peers(&["a", "b"]);
        let (mut refresher, control) = refresher(&ctx, &exit, discovery.clone());

        refresher.manual_poll(NO_WAIT).unwrap();
        assert_eq!(
            control.try_recv().unwrap(),
            Control::Update {
                connect: vec!["inproc://a".to_string(), "inproc://b".to_string()],
                disconnect: vec![],
            }
        );
        thread::sleep(SETTLE + Duration::from_millis(10));
        refresher.manual_poll(NO_WAIT).unwrap();

        discovery.remove("inproc://a").unwrap();
        refresher.next_round = Instant::now();
        assert_eq!(refresher.manual_poll(NO_WAIT).unwrap(), Poll::Busy);
        assert_eq!(
            control.try_recv().unwrap(),
            Control::Update {
                connect: vec![],
                disconnect: vec!["inproc://a".to_string()],
            }
        );
        assert!(refresher.settling.is_none());
        assert_eq!(
            refresher.table.lock().unwrap().pick_worker(),
            Some(WorkerId::from("b"))
        );
    }

    #[test]
    fn exit_signal_stops_the_refresher() {
        let ctx = Context::new();
        let mut exit = ExitBroadcast::new(&ctx).unwrap();
        let (mut refresher, _control) = refresher(&ctx, &exit, peers(&["a"]));
        exit.fire().unwrap();
        assert_eq!(refresher.manual_poll(NO_WAIT).unwrap(), Poll::Exit);
    }
}
