//! Loop owning both balancer sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use fnv::FnvHashSet;

use netcall_core::proto::Frames;

use crate::balancer::table::RoutingTable;
use crate::error::Result;
use crate::sched::{ExitListener, Poll, Task};
use crate::socket::{self, Socket};

/// Requests from the refresher to the I/O loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Control {
    /// Connection-level changes to the worker set
    Update {
        connect: Vec<String>,
        disconnect: Vec<String>,
    },
    /// Workers became selectable, try sending buffered requests
    Drain,
}

pub(crate) struct IoLoop {
    pub clients: Socket,
    pub workers: Socket,
    pub table: Arc<Mutex<RoutingTable>>,
    pub control: Receiver<Control>,
    pub exit: ExitListener,
    pub connected: FnvHashSet<String>,
}

impl Task for IoLoop {
    fn name(&self) -> &str {
        "netcall-balancer-io"
    }

    fn manual_poll(&mut self, wait: Duration) -> Result<Poll> {
        if self.exit.triggered() {
            return Ok(Poll::Exit);
        }
        let mut busy = false;
        loop {
            match self.control.try_recv() {
                Ok(ctl) => {
                    busy = true;
                    self.apply(ctl)?;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let wait = if busy { Duration::from_millis(0) } else { wait };
        let ready = socket::poll(&[&self.clients, &self.workers], wait)?;
        if ready[0] {
            let mut incoming = Vec::new();
            while let Some(frames) = self.clients.try_recv_multipart()? {
                incoming.push(frames);
            }
            if !incoming.is_empty() {
                busy = true;
                let mut table = self.table.lock()?;
                for frames in incoming {
                    table.enqueue(frames);
                }
                drain(&mut table, &mut self.workers);
            }
        }
        if ready[1] {
            while let Some(frames) = self.workers.try_recv_multipart()? {
                busy = true;
                let reply = self.table.lock()?.on_reply(frames);
                if let Some(reply) = reply {
                    if let Err(e) = self.clients.send_multipart(&reply) {
                        debug!("failed forwarding reply to client: {}", e);
                    }
                }
            }
        }
        Ok(if busy { Poll::Busy } else { Poll::Idle })
    }
}

impl IoLoop {
    fn apply(&mut self, ctl: Control) -> Result<()> {
        match ctl {
            Control::Update {
                connect,
                disconnect,
            } => {
                for address in disconnect {
                    if self.connected.remove(&address) {
                        if let Err(e) = self.workers.disconnect(&address) {
                            debug!("failed disconnecting from {}: {}", address, e);
                        }
                    }
                }
                for address in connect {
                    // reconnect after an eviction
                    if self.connected.remove(&address) {
                        if let Err(e) = self.workers.disconnect(&address) {
                            debug!("failed disconnecting from {}: {}", address, e);
                        }
                    }
                    match self.workers.connect(&address) {
                        Ok(()) => {
                            self.connected.insert(address);
                        }
                        Err(e) => warn!("failed connecting to worker at {}: {}", address, e),
                    }
                }
            }
            Control::Drain => {
                let mut table = self.table.lock()?;
                drain(&mut table, &mut self.workers);
            }
        }
        Ok(())
    }
}

/// Sends buffered requests, each prefixed with the id of the chosen worker.
fn drain(table: &mut RoutingTable, workers: &mut Socket) -> usize {
    table.drain(|worker, frames: &Frames| {
        let mut out = Vec::with_capacity(frames.len() + 1);
        out.push(worker.as_bytes().to_vec());
        out.extend(frames.iter().cloned());
        workers.send_multipart(&out)
    })
}
