//! Load balancer sitting between clients and a changing set of workers.
//!
//! Clients talk to the balancer exactly as they would to a service. Each
//! request is forwarded to the currently least loaded worker, where load is
//! the number of forwarded requests that haven't seen their terminal reply
//! yet. Requests arriving while no worker is selectable are buffered and
//! sent in arrival order once one becomes available.
//!
//! The worker set comes from a [`Discovery`] collaborator queried
//! periodically. Freshly discovered workers are connected right away but
//! only become selectable after a short settling delay.
//!
//! Two loops make up a running balancer: the I/O loop owning both sockets
//! and the refresher. They share a [`RoutingTable`] behind a single lock,
//! and the refresher asks the I/O loop for connection changes through a
//! control channel.

mod io;
mod refresh;
mod table;

pub use table::{Diff, RoutingTable, Stats};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fnv::FnvHashSet;

use crate::discovery::Discovery;
use crate::error::Result;
use crate::sched::{ExitBroadcast, Scheduler};
use crate::socket::{Context, Socket, SocketConfig, SocketType, Transport};

use self::io::IoLoop;
use self::refresh::Refresher;

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Time between discovery rounds
    pub interval: Duration,
    /// Time until the next round when discovery found nothing
    pub empty_backoff: Duration,
    /// Time given to connections to fresh workers before they become
    /// selectable
    pub settle_delay: Duration,
    /// Transport facing the clients
    pub client_transport: Transport,
    /// Transport facing the workers
    pub worker_transport: Transport,
    /// Routing identity of the worker-facing socket, random if not set
    pub identity: Option<Vec<u8>>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            empty_backoff: Duration::from_secs(3),
            settle_delay: Duration::from_millis(330),
            client_transport: Transport::Inproc,
            worker_transport: Transport::Inproc,
            identity: None,
        }
    }
}

pub struct Balancer {
    ctx: Context,
    config: BalancerConfig,
    clients: Socket,
    workers: Socket,
    discovery: Box<dyn Discovery>,
}

impl Balancer {
    pub fn new<D: Discovery + 'static>(
        ctx: &Context,
        config: BalancerConfig,
        discovery: D,
    ) -> Result<Self> {
        let clients = Socket::new_with_config(
            ctx,
            SocketConfig {
                type_: SocketType::Router,
                transport: config.client_transport,
                router_mandatory: false,
                ..SocketConfig::default()
            },
        )?;
        let workers = Socket::new_with_config(
            ctx,
            SocketConfig {
                type_: SocketType::Router,
                transport: config.worker_transport,
                identity: config.identity.clone(),
                router_mandatory: true,
            },
        )?;
        Ok(Self {
            ctx: ctx.clone(),
            config,
            clients,
            workers,
            discovery: Box::new(discovery),
        })
    }

    /// Binds the client-facing socket.
    pub fn bind(&mut self, urls: &[&str]) -> Result<()> {
        for url in urls {
            self.clients.bind(url)?;
        }
        Ok(())
    }

    pub fn start(self, sched: Arc<dyn Scheduler>) -> Result<BalancerHandle> {
        let exit = ExitBroadcast::new(&self.ctx)?;
        let table = Arc::new(Mutex::new(RoutingTable::new()));
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        sched.spawn(Box::new(IoLoop {
            clients: self.clients,
            workers: self.workers,
            table: table.clone(),
            control: control_rx,
            exit: exit.listener(&self.ctx)?,
            connected: FnvHashSet::default(),
        }))?;
        sched.spawn(Box::new(Refresher {
            discovery: self.discovery,
            table: table.clone(),
            control: control_tx,
            exit: exit.listener(&self.ctx)?,
            interval: self.config.interval,
            empty_backoff: self.config.empty_backoff,
            settle_delay: self.config.settle_delay,
            next_round: Instant::now(),
            settling: None,
        }))?;
        info!(
            "balancer started, discovery every {:?}",
            self.config.interval
        );
        Ok(BalancerHandle { table, exit })
    }
}

/// Handle to a running balancer. Dropping it stops the balancer.
pub struct BalancerHandle {
    table: Arc<Mutex<RoutingTable>>,
    exit: ExitBroadcast,
}

impl BalancerHandle {
    pub fn stats(&self) -> Result<Stats> {
        Ok(self.table.lock()?.stats())
    }

    pub fn stop(mut self) -> Result<()> {
        self.exit.fire()
    }
}
