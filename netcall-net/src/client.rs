//! RPC client.
//!
//! A [`Client`] owns a dealer socket driven by a reader loop spawned on the
//! client's scheduler. Public methods talk to that loop over a command
//! channel; the loop alone touches the socket and the table of calls
//! awaiting replies.
//!
//! Calls come in three modes, see [`CallMode`]. A procedure returning a
//! stream resolves its call with a [`RemoteGenerator`], which pulls values
//! one by one with `_SEND` control calls.

use std::convert::TryInto;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use fnv::{FnvHashMap, FnvHashSet};
use id_pool::IdPool;

use netcall_core::proto::{self, ReplyType, Request, PROC_CLOSE, PROC_SEND, PROC_THROW};
use netcall_core::remote::{RemoteError, RUNTIME_ERROR};
use netcall_core::{Args, Encoding, EncodingSerializer, Frames, Kwargs, Serializer, Value};

use crate::error::{Error, Result};
use crate::future::{Resolver, RpcFuture};
use crate::sched::{self, ExitBroadcast, ExitListener, Poll, Scheduler, Task};
use crate::socket::{self, Context, Socket, SocketConfig, SocketType, Transport};

/// Time allowed for the reader loop to act on a bind or connect.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// High bit marking request ids of ignored calls. Pooled ids stay below it,
/// so replies to ignored calls can never be taken for replies to tracked
/// ones.
const IGNORE_TAG: u32 = 0x8000_0000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Transport used by the client socket
    pub transport: Transport,
    /// Encoding of arguments and results
    pub encoding: Encoding,
    /// Routing identity of the client socket, random if not set
    pub identity: Option<Vec<u8>>,
    /// Timeout used by `call_sync`, `call_ignore` aside, and by generator
    /// resumption
    pub default_timeout: Option<Duration>,
    /// Capacity of the queue buffering values of a single stream
    pub generator_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Inproc,
            encoding: Encoding::Bincode,
            identity: None,
            default_timeout: Some(Duration::from_secs(30)),
            generator_queue: 64,
        }
    }
}

/// How a call waits for its reply.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CallMode {
    /// Block until the reply arrives or the timeout passes
    Sync,
    /// Return a future right away
    Async,
    /// Fire and forget, no reply is ever sent
    Ignore,
}

impl FromStr for CallMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(CallMode::Sync),
            "async" => Ok(CallMode::Async),
            "ignore" => Ok(CallMode::Ignore),
            _ => Err(Error::InvalidArgument(format!(
                "call mode must be one of sync, async or ignore, got: {}",
                s
            ))),
        }
    }
}

impl Display for CallMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CallMode::Sync => write!(f, "sync"),
            CallMode::Async => write!(f, "async"),
            CallMode::Ignore => write!(f, "ignore"),
        }
    }
}

/// Successful outcome of a call.
#[derive(Debug)]
pub enum Response {
    Value(Value),
    /// The procedure returned a generator
    Stream(RemoteGenerator),
}

impl Response {
    pub fn is_stream(&self) -> bool {
        matches!(self, Response::Stream(_))
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            Response::Value(v) => Ok(v),
            Response::Stream(_) => Err(Error::InvalidArgument(
                "call returned a stream, not a value".to_string(),
            )),
        }
    }

    pub fn into_stream(self) -> Result<RemoteGenerator> {
        match self {
            Response::Stream(g) => Ok(g),
            Response::Value(v) => Err(Error::InvalidArgument(format!(
                "call returned a value, not a stream: {}",
                v
            ))),
        }
    }
}

/// What [`Client::call`] hands back, depending on the mode.
#[derive(Debug)]
pub enum CallResult {
    Done(Response),
    Pending(RpcFuture),
    Ignored,
}

enum Command {
    Attach {
        url: String,
        bind: bool,
        reply: Sender<Result<()>>,
    },
    Detach {
        url: String,
        bind: bool,
        reply: Sender<Result<()>>,
    },
    Call {
        req_id: u32,
        resolver: Resolver,
        frames: Frames,
    },
    /// Generator control call for an existing stream
    Control { req_id: u32, frames: Frames },
    /// Request expecting no reply
    Send(Frames),
    /// Stop waiting for a reply
    Forget(u32),
}

enum StreamItem {
    Yielded(Value),
    /// Value arrived but couldn't be decoded
    Undecodable(RemoteError),
    Ended(RemoteError),
    /// Control call never left the client
    Broken(String),
}

/// State shared by the client handle, its reader loop and its generators.
struct Shared {
    commands: Sender<Command>,
    sched: Arc<dyn Scheduler>,
    serializer: Arc<dyn Serializer>,
    ids: Mutex<IdPool>,
    ignored: AtomicU32,
    config: ClientConfig,
}

impl Shared {
    fn request_id(&self) -> Result<u32> {
        self.ids
            .lock()?
            .request_id()
            .ok_or_else(|| Error::Other("request id pool exhausted".to_string()))
    }

    /// Id for an ignored call, taken from a wrapping counter outside the
    /// pooled range.
    fn ignore_id(&self) -> u32 {
        IGNORE_TAG | (self.ignored.fetch_add(1, Ordering::Relaxed) & !IGNORE_TAG)
    }

    fn return_id(&self, id: u32) {
        if let Ok(mut ids) = self.ids.lock() {
            if ids.return_id(id).is_err() {
                trace!("request id {} was already returned", id);
            }
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ShutDown)
    }

    fn send_control(&self, req_id: u32, proc_name: &str, args: Args) -> Result<()> {
        let (args, kwargs) = self.serializer.serialize_args(&args, &Kwargs::new())?;
        let frames = Request::new(encode_id(req_id), proc_name, args, kwargs, false).into_frames();
        self.send(Command::Control { req_id, frames })
    }
}

fn encode_id(id: u32) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn decode_id(bytes: &[u8]) -> Option<u32> {
    bytes.try_into().ok().map(u32::from_be_bytes)
}

#[derive(Default)]
struct Endpoints {
    connected: FnvHashSet<String>,
    bound: FnvHashSet<String>,
}

/// Calls procedures on remote services, directly or through a balancer.
pub struct Client {
    shared: Arc<Shared>,
    endpoints: Mutex<Endpoints>,
    exit: Mutex<ExitBroadcast>,
}

impl Client {
    pub fn new(ctx: &Context, config: ClientConfig, sched: Arc<dyn Scheduler>) -> Result<Self> {
        let serializer = Arc::new(EncodingSerializer::new(config.encoding)?);
        Self::with_serializer(ctx, config, sched, serializer)
    }

    pub fn with_serializer(
        ctx: &Context,
        config: ClientConfig,
        sched: Arc<dyn Scheduler>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        let socket = Socket::new_with_config(
            ctx,
            SocketConfig {
                type_: SocketType::Dealer,
                transport: config.transport,
                identity: config.identity.clone(),
                ..SocketConfig::default()
            },
        )?;
        let exit = ExitBroadcast::new(ctx)?;
        let (commands, receiver) = unbounded();
        let shared = Arc::new(Shared {
            commands,
            sched: sched.clone(),
            serializer,
            ids: Mutex::new(IdPool::new_ranged(1..IGNORE_TAG)),
            ignored: AtomicU32::new(0),
            config,
        });
        sched.spawn(Box::new(ClientLoop {
            socket,
            commands: receiver,
            exit: exit.listener(ctx)?,
            pending: FnvHashMap::default(),
            streams: FnvHashMap::default(),
            shared: shared.clone(),
        }))?;
        Ok(Self {
            shared,
            endpoints: Mutex::new(Endpoints::default()),
            exit: Mutex::new(exit),
        })
    }

    /// Connects to the given endpoints. Endpoints already connected are
    /// left alone. With `only` set, endpoints missing from `urls` get
    /// disconnected.
    pub fn connect(&self, urls: &[&str], only: bool) -> Result<()> {
        self.attach(urls, false, only)
    }

    /// Binds to the given endpoints, with the same semantics as
    /// [`Client::connect`].
    pub fn bind(&self, urls: &[&str], only: bool) -> Result<()> {
        self.attach(urls, true, only)
    }

    fn attach(&self, urls: &[&str], bind: bool, only: bool) -> Result<()> {
        let mut endpoints = self.endpoints.lock()?;
        let set = if bind {
            &mut endpoints.bound
        } else {
            &mut endpoints.connected
        };
        if only {
            let stale: Vec<String> = set
                .iter()
                .filter(|e| !urls.contains(&e.as_str()))
                .cloned()
                .collect();
            for url in stale {
                self.roundtrip(|reply| Command::Detach {
                    url: url.clone(),
                    bind,
                    reply,
                })?;
                set.remove(&url);
            }
        }
        for url in urls {
            if set.contains(*url) {
                continue;
            }
            self.roundtrip(|reply| Command::Attach {
                url: url.to_string(),
                bind,
                reply,
            })?;
            set.insert(url.to_string());
        }
        Ok(())
    }

    fn roundtrip<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(Sender<Result<()>>) -> Command,
    {
        let (tx, rx) = bounded(1);
        self.shared.send(make(tx))?;
        sched::recv_timeout(&*self.shared.sched, &rx, Some(CONTROL_TIMEOUT))?
    }

    /// True once at least one endpoint is bound or connected.
    pub fn is_ready(&self) -> bool {
        match self.endpoints.lock() {
            Ok(e) => !e.connected.is_empty() || !e.bound.is_empty(),
            Err(_) => false,
        }
    }

    pub fn endpoints(&self) -> Vec<String> {
        match self.endpoints.lock() {
            Ok(e) => e.connected.iter().chain(e.bound.iter()).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Calls a remote procedure.
    ///
    /// In sync mode `timeout` bounds the wait, `None` waiting indefinitely.
    /// It's ignored in the other modes.
    pub fn call(
        &self,
        proc_name: &str,
        args: Args,
        kwargs: Kwargs,
        mode: CallMode,
        timeout: Option<Duration>,
    ) -> Result<CallResult> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let (args, kwargs) = self.shared.serializer.serialize_args(&args, &kwargs)?;
        match mode {
            CallMode::Ignore => {
                let req_id = self.shared.ignore_id();
                let frames = Request::new(encode_id(req_id), proc_name, args, kwargs, true).into_frames();
                self.shared.send(Command::Send(frames))?;
                Ok(CallResult::Ignored)
            }
            CallMode::Async => Ok(CallResult::Pending(self.dispatch(proc_name, args, kwargs)?)),
            CallMode::Sync => {
                let future = self.dispatch(proc_name, args, kwargs)?;
                Ok(CallResult::Done(future.wait(timeout)?))
            }
        }
    }

    fn dispatch(&self, proc_name: &str, args: Vec<u8>, kwargs: Vec<u8>) -> Result<RpcFuture> {
        let req_id = self.shared.request_id()?;
        let commands = self.shared.commands.clone();
        let (future, resolver) = RpcFuture::new(
            self.shared.sched.clone(),
            Some(Box::new(move || {
                let _ = commands.send(Command::Forget(req_id));
            })),
        );
        let frames = Request::new(encode_id(req_id), proc_name, args, kwargs, false).into_frames();
        if let Err(e) = self.shared.send(Command::Call {
            req_id,
            resolver,
            frames,
        }) {
            self.shared.return_id(req_id);
            return Err(e);
        }
        Ok(future)
    }

    /// Calls in sync mode with the default timeout.
    pub fn call_sync(&self, proc_name: &str, args: Args) -> Result<Response> {
        match self.call(
            proc_name,
            args,
            Kwargs::new(),
            CallMode::Sync,
            self.shared.config.default_timeout,
        )? {
            CallResult::Done(response) => Ok(response),
            _ => Err(Error::Other("sync call didn't complete".to_string())),
        }
    }

    pub fn call_async(&self, proc_name: &str, args: Args) -> Result<RpcFuture> {
        match self.call(proc_name, args, Kwargs::new(), CallMode::Async, None)? {
            CallResult::Pending(future) => Ok(future),
            _ => Err(Error::Other("async call didn't produce a future".to_string())),
        }
    }

    pub fn call_ignore(&self, proc_name: &str, args: Args) -> Result<()> {
        self.call(proc_name, args, Kwargs::new(), CallMode::Ignore, None)
            .map(|_| ())
    }

    /// Stops the reader loop. Outstanding calls fail with
    /// [`Error::ShutDown`].
    pub fn close(&self) -> Result<()> {
        self.exit.lock()?.fire()
    }
}

/// Reader loop owning the client socket.
struct ClientLoop {
    socket: Socket,
    commands: Receiver<Command>,
    exit: ExitListener,
    pending: FnvHashMap<u32, Resolver>,
    streams: FnvHashMap<u32, Sender<StreamItem>>,
    shared: Arc<Shared>,
}

impl Task for ClientLoop {
    fn name(&self) -> &str {
        "netcall-client"
    }

    fn manual_poll(&mut self, wait: Duration) -> Result<Poll> {
        if self.exit.triggered() {
            // requests queued before the close still go out
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command);
            }
            self.shut_down();
            return Ok(Poll::Exit);
        }
        let mut busy = false;
        while let Ok(command) = self.commands.try_recv() {
            busy = true;
            self.handle_command(command);
        }
        let wait = if busy { Duration::from_millis(0) } else { wait };
        if socket::poll(&[&self.socket], wait)?[0] {
            while let Some(frames) = self.socket.try_recv_multipart()? {
                busy = true;
                self.handle_reply(frames);
            }
        }
        Ok(if busy { Poll::Busy } else { Poll::Idle })
    }
}

impl ClientLoop {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach { url, bind, reply } => {
                let result = if bind {
                    self.socket.bind(&url)
                } else {
                    self.socket.connect(&url)
                };
                debug!("client {} {}: {:?}", if bind { "bind" } else { "connect" }, url, result);
                let _ = reply.send(result);
            }
            Command::Detach { url, bind, reply } => {
                let result = if bind {
                    self.socket.unbind(&url)
                } else {
                    self.socket.disconnect(&url)
                };
                let _ = reply.send(result);
            }
            Command::Call {
                req_id,
                resolver,
                frames,
            } => match self.socket.send_multipart(&frames) {
                Ok(()) => {
                    self.pending.insert(req_id, resolver);
                }
                Err(e) => {
                    let _ = resolver.resolve(Err(e));
                    self.shared.return_id(req_id);
                }
            },
            Command::Control { req_id, frames } => {
                if let Err(e) = self.socket.send_multipart(&frames) {
                    if let Some(queue) = self.streams.get(&req_id) {
                        let _ = queue.try_send(StreamItem::Broken(e.to_string()));
                    }
                }
            }
            Command::Send(frames) => {
                if let Err(e) = self.socket.send_multipart(&frames) {
                    warn!("failed sending request: {}", e);
                }
            }
            Command::Forget(req_id) => {
                if self.pending.remove(&req_id).is_some() {
                    debug!("gave up waiting on request {}", req_id);
                }
            }
        }
    }

    fn handle_reply(&mut self, frames: Frames) {
        let reply = match proto::parse_reply(frames) {
            Some(r) => r,
            None => {
                debug!("dropping malformed reply");
                return;
            }
        };
        let req_id = match decode_id(&reply.req_id) {
            Some(id) => id,
            None => {
                debug!("dropping reply with foreign request id {:?}", reply.req_id);
                return;
            }
        };
        if req_id & IGNORE_TAG != 0 {
            trace!("dropping {} for ignored request {:x}", reply.type_, req_id);
            return;
        }
        match reply.type_ {
            ReplyType::Ack => trace!("request {} acknowledged", req_id),
            ReplyType::Ok => match self.pending.remove(&req_id) {
                Some(resolver) => {
                    let outcome = match self.shared.serializer.deserialize_result(&reply.payload) {
                        Ok(value) => Ok(Response::Value(value)),
                        Err(e) => Err(Error::Remote(RemoteError::deserialization(&e.to_string()))),
                    };
                    self.resolve(req_id, resolver, outcome);
                }
                None => debug!("no matching future for request {}", req_id),
            },
            ReplyType::Fail => {
                let error = self.decode_error(&reply.payload);
                if let Some(queue) = self.streams.remove(&req_id) {
                    if queue.try_send(StreamItem::Ended(error)).is_err() {
                        trace!("stream {} ended with nobody listening", req_id);
                    }
                    self.shared.return_id(req_id);
                } else if let Some(resolver) = self.pending.remove(&req_id) {
                    self.resolve(req_id, resolver, Err(Error::Remote(error)));
                } else {
                    debug!("no matching future for request {}", req_id);
                }
            }
            ReplyType::Yield => {
                if let Some(queue) = self.streams.get(&req_id) {
                    let item = match self.shared.serializer.deserialize_result(&reply.payload) {
                        Ok(value) => StreamItem::Yielded(value),
                        Err(e) => StreamItem::Undecodable(RemoteError::deserialization(&e.to_string())),
                    };
                    match queue.try_send(item) {
                        Ok(()) => (),
                        Err(TrySendError::Full(_)) => warn!("stream {} queue full, dropping value", req_id),
                        Err(TrySendError::Disconnected(_)) => trace!("stream {} was dropped", req_id),
                    }
                } else if reply.payload.is_empty() {
                    match self.pending.remove(&req_id) {
                        Some(resolver) => {
                            let (tx, rx) = bounded(self.shared.config.generator_queue.max(1));
                            self.streams.insert(req_id, tx);
                            let stream = RemoteGenerator {
                                shared: self.shared.clone(),
                                req_id,
                                queue: rx,
                                finished: false,
                            };
                            if resolver.resolve(Ok(Response::Stream(stream))).is_err() {
                                warn!("future for request {} resolved twice", req_id);
                            }
                        }
                        None => debug!("no matching future for request {}", req_id),
                    }
                } else {
                    debug!("dropping value for unknown stream {}", req_id);
                }
            }
        }
    }

    fn resolve(&self, req_id: u32, resolver: Resolver, outcome: Result<Response>) {
        if resolver.resolve(outcome).is_err() {
            warn!("future for request {} resolved twice", req_id);
        }
        self.shared.return_id(req_id);
    }

    fn decode_error(&self, payload: &[Vec<u8>]) -> RemoteError {
        match self.shared.serializer.deserialize_result(payload) {
            Ok(value) => RemoteError::from_value(&value).unwrap_or_else(|| {
                RemoteError::deserialization(&format!("unexpected error payload: {}", value))
            }),
            Err(e) => RemoteError::deserialization(&e.to_string()),
        }
    }

    fn shut_down(&mut self) {
        for (_, resolver) in self.pending.drain() {
            let _ = resolver.resolve(Err(Error::ShutDown));
        }
        // dropping the senders wakes every generator with a disconnect
        self.streams.clear();
        debug!("client loop exiting");
    }
}

/// Client side of a remote generator.
///
/// Each resumption is one round trip to the service. Iterating yields
/// values until the stream ends normally; an error ends iteration after
/// being yielded once. Dropping an unfinished generator closes it on the
/// service.
pub struct RemoteGenerator {
    shared: Arc<Shared>,
    req_id: u32,
    queue: Receiver<StreamItem>,
    finished: bool,
}

impl Debug for RemoteGenerator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteGenerator")
            .field("req_id", &self.req_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl RemoteGenerator {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Resumes the generator with a value, returning the next one. `None`
    /// means the stream ended.
    pub fn send(&mut self, value: Value) -> Result<Option<Value>> {
        self.resume(PROC_SEND, vec![value])
    }

    pub fn next_value(&mut self) -> Result<Option<Value>> {
        self.send(Value::Nil)
    }

    /// Raises an error of the given kind inside the generator.
    pub fn throw(&mut self, kind: &str, value: Value) -> Result<Option<Value>> {
        self.resume(PROC_THROW, vec![Value::Str(kind.to_string()), value])
    }

    pub fn close(&mut self) -> Result<()> {
        match self.resume(PROC_CLOSE, Vec::new())? {
            None => Ok(()),
            Some(_) => Err(Error::Remote(RemoteError::new(
                RUNTIME_ERROR,
                "generator ignored close",
                None,
            ))),
        }
    }

    fn resume(&mut self, proc_name: &str, args: Args) -> Result<Option<Value>> {
        if self.finished {
            return Ok(None);
        }
        self.shared.send_control(self.req_id, proc_name, args)?;
        match sched::recv_timeout(
            &*self.shared.sched,
            &self.queue,
            self.shared.config.default_timeout,
        ) {
            Ok(StreamItem::Yielded(value)) => Ok(Some(value)),
            Ok(StreamItem::Undecodable(e)) => Err(Error::Remote(e)),
            Ok(StreamItem::Ended(e)) => {
                self.finished = true;
                if e.is_termination() {
                    Ok(None)
                } else {
                    Err(Error::Remote(e))
                }
            }
            Ok(StreamItem::Broken(message)) => Err(Error::Other(message)),
            Err(Error::ShutDown) => {
                self.finished = true;
                Err(Error::ShutDown)
            }
            // a late value would answer the next resumption
            Err(Error::TimedOut) => {
                self.abandon();
                Err(Error::TimedOut)
            }
            Err(e) => Err(e),
        }
    }

    /// Closes the remote side without waiting for confirmation.
    fn abandon(&mut self) {
        if !self.finished {
            self.finished = true;
            if let Err(e) = self.shared.send_control(self.req_id, PROC_CLOSE, Vec::new()) {
                trace!("failed closing stream {}: {}", self.req_id, e);
            }
        }
    }
}

impl Iterator for RemoteGenerator {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_value() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(e) => {
                self.abandon();
                Some(Err(e))
            }
        }
    }
}

impl Drop for RemoteGenerator {
    fn drop(&mut self) {
        self.abandon();
    }
}
