//! Scheduling models for the polling loops.
//!
//! Every long-running piece (client reader, service dispatcher, balancer
//! I/O loop, discovery refresher) is a [`Task`] stepped through
//! `manual_poll`. A [`Scheduler`] decides how tasks get CPU time:
//! [`ThreadScheduler`] gives each one its own OS thread, while
//! [`CoopScheduler`] steps all of them on whatever thread is currently
//! waiting for something, switching only at those wait points.
//!
//! Loops are told to exit through an in-process pub/sub pair, see
//! [`ExitBroadcast`].

use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::error::{Error, Result};
use crate::socket::{self, Context, Socket, SocketType, Transport};

/// Outcome of a single poll of a task.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Poll {
    /// Some work was done, poll again soon
    Busy,
    /// Nothing to do right now
    Idle,
    /// Task is finished and should be dropped
    Exit,
}

/// Unit of repeated work owned by a scheduler.
pub trait Task: Send {
    fn name(&self) -> &str;

    /// Performs one round of work, blocking on I/O for at most `wait`.
    fn manual_poll(&mut self, wait: Duration) -> Result<Poll>;
}

/// Capability deciding how tasks run, injected into clients, services and
/// balancers.
pub trait Scheduler: Send + Sync {
    fn spawn(&self, task: Box<dyn Task>) -> Result<()>;

    /// Blocks until `ready` returns true or the timeout passes, letting
    /// tasks make progress in the meantime. Returns whether `ready` was
    /// satisfied.
    fn wait(&self, ready: &mut dyn FnMut() -> bool, timeout: Option<Duration>) -> bool;

    /// Blocks until every spawned task has exited.
    fn join(&self);
}

/// Receives from a channel through the scheduler's waiting mechanism.
pub fn recv_timeout<T>(
    sched: &dyn Scheduler,
    rx: &Receiver<T>,
    timeout: Option<Duration>,
) -> Result<T> {
    let mut item = None;
    let mut gone = false;
    sched.wait(
        &mut || match rx.try_recv() {
            Ok(i) => {
                item = Some(i);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                gone = true;
                true
            }
        },
        timeout,
    );
    match item {
        Some(i) => Ok(i),
        None if gone => Err(Error::ShutDown),
        None => Err(Error::TimedOut),
    }
}

/// Runs each task on a dedicated thread.
pub struct ThreadScheduler {
    /// Maximum time a task blocks on I/O per poll
    pub poll_wait: Duration,
    /// Sleep between checks while waiting
    pub wait_tick: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_millis(1),
            wait_tick: Duration::from_micros(200),
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for ThreadScheduler {
    fn spawn(&self, mut task: Box<dyn Task>) -> Result<()> {
        let poll_wait = self.poll_wait;
        let handle = thread::Builder::new()
            .name(task.name().to_string())
            .spawn(move || loop {
                match task.manual_poll(poll_wait) {
                    Ok(Poll::Exit) => {
                        debug!("task {} exited", task.name());
                        break;
                    }
                    Ok(_) => (),
                    Err(Error::ShutDown) => break,
                    Err(e) => {
                        warn!("task {} error: {}", task.name(), e);
                        thread::sleep(poll_wait);
                    }
                }
            })
            .map_err(|e| Error::Other(format!("failed spawning thread: {}", e)))?;
        self.handles.lock()?.push(handle);
        Ok(())
    }

    fn wait(&self, ready: &mut dyn FnMut() -> bool, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        loop {
            if ready() {
                return true;
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return false;
                }
            }
            thread::sleep(self.wait_tick);
        }
    }

    fn join(&self) {
        let handles = match self.handles.lock() {
            Ok(mut h) => std::mem::take(&mut *h),
            Err(_) => return,
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("task thread panicked");
            }
        }
    }
}

/// Steps all tasks on the calling thread.
///
/// Tasks only run while some thread is inside [`Scheduler::wait`],
/// [`CoopScheduler::run_once`] or [`CoopScheduler::run_for`]. A task must
/// not wait on the same scheduler from inside its own poll; nested waits
/// don't step any tasks and simply run into their timeout.
pub struct CoopScheduler {
    /// Sleep when a full round found nothing to do
    pub idle_sleep: Duration,
    tasks: Mutex<Vec<Box<dyn Task>>>,
    incoming: Mutex<Vec<Box<dyn Task>>>,
}

impl Default for CoopScheduler {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_micros(200),
            tasks: Mutex::new(Vec::new()),
            incoming: Mutex::new(Vec::new()),
        }
    }
}

impl CoopScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Polls every task once without blocking. Returns true if any task
    /// did some work.
    pub fn run_once(&self) -> bool {
        let mut tasks = match self.tasks.try_lock() {
            Ok(t) => t,
            Err(_) => return false,
        };
        if let Ok(mut incoming) = self.incoming.lock() {
            tasks.append(&mut incoming);
        }
        let mut busy = false;
        let mut n = 0;
        while n < tasks.len() {
            match tasks[n].manual_poll(Duration::from_millis(0)) {
                Ok(Poll::Busy) => busy = true,
                Ok(Poll::Idle) => (),
                Ok(Poll::Exit) | Err(Error::ShutDown) => {
                    debug!("task {} exited", tasks[n].name());
                    tasks.remove(n);
                    busy = true;
                    continue;
                }
                Err(e) => warn!("task {} error: {}", tasks[n].name(), e),
            }
            n += 1;
        }
        busy
    }

    /// Keeps stepping tasks for the given duration.
    pub fn run_for(&self, duration: Duration) {
        self.wait(&mut || false, Some(duration));
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        let live = self.tasks.lock().map(|t| t.len()).unwrap_or(0);
        let new = self.incoming.lock().map(|t| t.len()).unwrap_or(0);
        live + new
    }
}

impl Scheduler for CoopScheduler {
    fn spawn(&self, task: Box<dyn Task>) -> Result<()> {
        self.incoming.lock()?.push(task);
        Ok(())
    }

    fn wait(&self, ready: &mut dyn FnMut() -> bool, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        loop {
            if ready() {
                return true;
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return false;
                }
            }
            if !self.run_once() {
                thread::sleep(self.idle_sleep);
            }
        }
    }

    fn join(&self) {
        while self.task_count() > 0 {
            if !self.run_once() {
                thread::sleep(self.idle_sleep);
            }
        }
    }
}

/// Publishing side of the exit signal shared by a group of loops.
pub struct ExitBroadcast {
    publisher: Socket,
    endpoint: String,
    fired: bool,
}

impl ExitBroadcast {
    pub fn new(ctx: &Context) -> Result<Self> {
        let endpoint = format!("inproc://netcall-exit-{}", hex(&socket::random_identity()));
        let mut publisher = Socket::new(ctx, SocketType::Pub, Transport::Inproc)?;
        publisher.bind(&endpoint)?;
        Ok(Self {
            publisher,
            endpoint,
            fired: false,
        })
    }

    /// Creates a listener. Only listeners created before [`fire`] see the
    /// signal.
    ///
    /// [`fire`]: ExitBroadcast::fire
    pub fn listener(&self, ctx: &Context) -> Result<ExitListener> {
        let mut sub = Socket::new(ctx, SocketType::Sub, Transport::Inproc)?;
        sub.subscribe(EXIT_TOPIC)?;
        sub.connect(&self.endpoint)?;
        Ok(ExitListener {
            sub,
            triggered: false,
        })
    }

    pub fn fire(&mut self) -> Result<()> {
        if !self.fired {
            self.fired = true;
            self.publisher.send_multipart(&[EXIT_TOPIC.to_vec()])?;
        }
        Ok(())
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }
}

impl Drop for ExitBroadcast {
    fn drop(&mut self) {
        if let Err(e) = self.fire() {
            debug!("failed signalling exit: {}", e);
        }
    }
}

const EXIT_TOPIC: &[u8] = b"EXIT";

/// Receiving side of the exit signal, owned by a single loop.
pub struct ExitListener {
    sub: Socket,
    triggered: bool,
}

impl ExitListener {
    /// Checks for the exit signal without blocking.
    pub fn triggered(&mut self) -> bool {
        if !self.triggered {
            match self.sub.try_recv_multipart() {
                Ok(Some(_)) => self.triggered = true,
                Ok(None) => (),
                Err(_) => self.triggered = true,
            }
        }
        self.triggered
    }

    /// Sleeps for up to `timeout`, waking early on the exit signal.
    pub fn sleep(&mut self, timeout: Duration) -> bool {
        if !self.triggered() {
            if let Err(e) = socket::poll(&[&self.sub], timeout) {
                debug!("exit listener poll failed: {}", e);
            }
        }
        self.triggered()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Countdown {
        left: usize,
        polls: Arc<AtomicUsize>,
    }

    impl Task for Countdown {
        fn name(&self) -> &str {
            "countdown"
        }

        fn manual_poll(&mut self, _wait: Duration) -> Result<Poll> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.left == 0 {
                return Ok(Poll::Exit);
            }
            self.left -= 1;
            Ok(Poll::Busy)
        }
    }

    fn countdown(left: usize) -> (Box<dyn Task>, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        let task = Countdown {
            left,
            polls: polls.clone(),
        };
        (Box::new(task), polls)
    }

    #[test]
    fn coop_runs_tasks_only_when_waiting() {
        let sched = CoopScheduler::new();
        let (task, polls) = countdown(3);
        sched.spawn(task).unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 0);
        assert!(sched.run_once());
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        sched.join();
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn wait_times_out() {
        let sched = ThreadScheduler::new();
        assert!(!sched.wait(&mut || false, Some(Duration::from_millis(10))));
        let coop = CoopScheduler::new();
        assert!(!coop.wait(&mut || false, Some(Duration::from_millis(10))));
        assert!(coop.wait(&mut || true, None));
    }

    #[test]
    fn threads_run_until_exit() {
        let sched = ThreadScheduler::new();
        let (task, polls) = countdown(5);
        sched.spawn(task).unwrap();
        sched.join();
        assert_eq!(polls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn exit_reaches_every_listener() {
        let ctx = Context::new();
        let mut exit = ExitBroadcast::new(&ctx).unwrap();
        let mut a = exit.listener(&ctx).unwrap();
        let mut b = exit.listener(&ctx).unwrap();
        assert!(!a.triggered());
        exit.fire().unwrap();
        assert!(a.triggered());
        assert!(b.sleep(Duration::from_millis(50)));
        assert!(a.triggered());
    }

    #[test]
    fn recv_timeout_through_scheduler() {
        let sched = CoopScheduler::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(7).unwrap();
        assert_eq!(recv_timeout(&sched, &rx, None).unwrap(), 7);
        assert!(matches!(
            recv_timeout(&sched, &rx, Some(Duration::from_millis(5))),
            Err(Error::TimedOut)
        ));
        drop(tx);
        assert!(matches!(recv_timeout(&sched, &rx, None), Err(Error::ShutDown)));
    }
}
