//! Single-assignment result cell for calls awaiting a reply.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use netcall_core::Value;

use crate::client::Response;
use crate::error::{Error, Result};
use crate::sched::Scheduler;

enum State {
    Pending,
    Ready(Result<Response>),
    Taken,
}

type Cell = Arc<Mutex<State>>;

/// Handle to the eventual outcome of an asynchronous call.
///
/// Resolved exactly once by the client's reader loop. Waiting goes through
/// the client's scheduler, so cooperative loops keep running meanwhile.
pub struct RpcFuture {
    cell: Cell,
    sched: Arc<dyn Scheduler>,
    on_abandon: Option<Box<dyn FnOnce() + Send>>,
}

/// Writing side of a future, held by the reader loop.
pub(crate) struct Resolver {
    cell: Cell,
}

impl Resolver {
    /// Stores the outcome. Fails if the future was already resolved.
    pub fn resolve(&self, outcome: Result<Response>) -> Result<()> {
        let mut state = self.cell.lock()?;
        match *state {
            State::Pending => {
                *state = State::Ready(outcome);
                Ok(())
            }
            _ => Err(Error::AlreadyResolved),
        }
    }
}

impl std::fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcFuture {{ resolved: {} }}", self.is_resolved())
    }
}

impl RpcFuture {
    pub(crate) fn new(
        sched: Arc<dyn Scheduler>,
        on_abandon: Option<Box<dyn FnOnce() + Send>>,
    ) -> (Self, Resolver) {
        let cell = Arc::new(Mutex::new(State::Pending));
        let resolver = Resolver { cell: cell.clone() };
        (
            Self {
                cell,
                sched,
                on_abandon,
            },
            resolver,
        )
    }

    pub fn is_resolved(&self) -> bool {
        match self.cell.lock() {
            Ok(state) => !matches!(*state, State::Pending),
            Err(_) => true,
        }
    }

    /// Takes the outcome if it's already there.
    pub fn try_take(&self) -> Option<Result<Response>> {
        let mut state = match self.cell.lock() {
            Ok(s) => s,
            Err(e) => return Some(Err(e.into())),
        };
        match std::mem::replace(&mut *state, State::Taken) {
            State::Ready(outcome) => Some(outcome),
            State::Taken => Some(Err(Error::AlreadyResolved)),
            State::Pending => {
                *state = State::Pending;
                None
            }
        }
    }

    /// Waits for the outcome.
    ///
    /// Giving up after `timeout` doesn't cancel the call. A reply arriving
    /// later is dropped by the client.
    pub fn wait(mut self, timeout: Option<Duration>) -> Result<Response> {
        let cell = self.cell.clone();
        let resolved = self.sched.wait(
            &mut || match cell.lock() {
                Ok(state) => !matches!(*state, State::Pending),
                Err(_) => true,
            },
            timeout,
        );
        if !resolved {
            if let Some(abandon) = self.on_abandon.take() {
                abandon();
            }
            return Err(Error::TimedOut);
        }
        self.try_take().unwrap_or(Err(Error::TimedOut))
    }

    /// Waits for a plain value, failing if the call returned a stream.
    pub fn value(self, timeout: Option<Duration>) -> Result<Value> {
        self.wait(timeout)?.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::ThreadScheduler;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn resolves_once() {
        let (fut, resolver) = RpcFuture::new(Arc::new(ThreadScheduler::new()), None);
        assert!(!fut.is_resolved());
        resolver.resolve(Ok(Response::Value(Value::Int(1)))).unwrap();
        assert!(matches!(
            resolver.resolve(Ok(Response::Value(Value::Int(2)))),
            Err(Error::AlreadyResolved)
        ));
        assert_eq!(fut.value(None).unwrap(), Value::Int(1));
    }

    #[test]
    fn timeout_abandons() {
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = abandoned.clone();
        let (fut, resolver) = RpcFuture::new(
            Arc::new(ThreadScheduler::new()),
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        );
        assert!(matches!(
            fut.wait(Some(Duration::from_millis(10))),
            Err(Error::TimedOut)
        ));
        assert!(abandoned.load(Ordering::SeqCst));
        // late resolution lands in a cell nobody reads
        assert!(resolver.resolve(Ok(Response::Value(Value::Nil))).is_ok());
    }
}
