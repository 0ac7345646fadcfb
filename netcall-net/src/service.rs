//! RPC service.
//!
//! Procedures are registered on a [`Service`] by name, then the service is
//! started on a scheduler. From that point a single loop owns the socket,
//! the procedure table and the table of live generators.
//!
//! Every well-formed request is acknowledged with an ACK carrying the
//! service name before anything else happens. Then exactly one of OK, FAIL
//! or a stream of YIELDs closed by a FAIL follows, unless the caller asked
//! to be ignored. Procedures returning a stream always answer with the
//! stream-start YIELD, even for ignored calls, since that's the only way a
//! client learns a stream exists.
//!
//! A generator stays in the table until it finishes, fails or is closed by
//! its caller. Nobody resumes the generator of an ignored stream call, nor
//! those left behind by clients that went away, so they are only reclaimed
//! when the service stops.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;

use netcall_core::gen::{self, Generator, GeneratorSlot, Resume};
use netcall_core::proto::{self, Reply, ReplyType, Request, PROC_CLOSE, PROC_SEND, PROC_THROW};
use netcall_core::remote::{RemoteError, LOOKUP_ERROR, NOT_IMPLEMENTED_ERROR};
use netcall_core::{Args, Encoding, EncodingSerializer, Kwargs, Serializer, Value};

use crate::error::{Error, Result};
use crate::sched::{ExitBroadcast, ExitListener, Poll, Scheduler, Task};
use crate::socket::{self, Context, Socket, SocketConfig, SocketType, Transport};

/// Kind reported for errors that don't name one.
pub const GENERIC_ERROR: &str = "Error";
/// Kind reported when a procedure panics.
pub const PANIC_ERROR: &str = "Panic";

/// Names that can't be registered as procedures.
pub const RESERVED_NAMES: &[&str] = &[
    PROC_SEND,
    PROC_THROW,
    PROC_CLOSE,
    "register",
    "register_stream",
    "register_object",
    "register_handler",
    "task",
    "proc",
    "bind",
    "connect",
    "start",
    "stop",
];

/// What a procedure returns.
pub enum Outcome {
    Value(Value),
    Stream(Box<dyn Generator>),
}

impl From<Value> for Outcome {
    fn from(v: Value) -> Self {
        Outcome::Value(v)
    }
}

/// Invokable procedure.
pub type Handler = Arc<dyn Fn(Args, Kwargs) -> anyhow::Result<Outcome> + Send + Sync>;

/// Boxes a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(Args, Kwargs) -> anyhow::Result<Outcome> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Error with an explicit kind name, for handlers that want the caller to
/// see something more specific than the generic kind.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct ProcError {
    pub kind: String,
    pub message: String,
}

impl ProcError {
    pub fn new(kind: &str, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }
}

/// Objects exposing several procedures at once, see
/// [`Service::register_object`].
pub trait ExposeProcedures {
    fn procedures(&self) -> Vec<(String, Handler)>;
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Name sent back with every ACK
    pub name: String,
    /// Routing identity of the service socket, doubles as the worker id
    /// seen by balancers. Random if not set.
    pub identity: Option<Vec<u8>>,
    pub transport: Transport,
    pub encoding: Encoding,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "netcall-service".to_string(),
            identity: None,
            transport: Transport::Inproc,
            encoding: Encoding::Bincode,
        }
    }
}

/// Collection of procedures waiting to be served.
pub struct Service {
    ctx: Context,
    config: ServiceConfig,
    socket: Socket,
    procedures: FnvHashMap<String, Handler>,
    serializer: Arc<dyn Serializer>,
}

impl Service {
    pub fn new(ctx: &Context, config: ServiceConfig) -> Result<Self> {
        let serializer = Arc::new(EncodingSerializer::new(config.encoding)?);
        Self::with_serializer(ctx, config, serializer)
    }

    pub fn with_serializer(
        ctx: &Context,
        config: ServiceConfig,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        let socket = Socket::new_with_config(
            ctx,
            SocketConfig {
                type_: SocketType::Router,
                transport: config.transport,
                identity: config.identity.clone(),
                ..SocketConfig::default()
            },
        )?;
        Ok(Self {
            ctx: ctx.clone(),
            config,
            socket,
            procedures: FnvHashMap::default(),
            serializer,
        })
    }

    pub fn identity(&self) -> Result<Vec<u8>> {
        self.socket.identity()
    }

    /// Registers a procedure returning a single value.
    pub fn register<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Args, Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register_handler(name, handler(move |args, kwargs| f(args, kwargs).map(Outcome::Value)))
    }

    /// Same as [`Service::register`].
    pub fn task<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Args, Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, f)
    }

    /// Same as [`Service::register`].
    pub fn proc<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Args, Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, f)
    }

    /// Registers a procedure returning a stream of values.
    pub fn register_stream<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Args, Kwargs) -> anyhow::Result<Box<dyn Generator>> + Send + Sync + 'static,
    {
        self.register_handler(name, handler(move |args, kwargs| f(args, kwargs).map(Outcome::Stream)))
    }

    /// Registers a procedure that decides per call whether to return a
    /// value or a stream. Registering a taken name replaces the previous
    /// procedure.
    pub fn register_handler(&mut self, name: &str, handler: Handler) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("procedure name is empty".to_string()));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(Error::InvalidArgument(format!(
                "procedure name is reserved: {}",
                name
            )));
        }
        if self.procedures.insert(name.to_string(), handler).is_some() {
            warn!("procedure {} registered again, replacing", name);
        }
        Ok(())
    }

    /// Registers every procedure exposed by `object`, skipping names
    /// starting with an underscore or listed in `restricted`. With a
    /// namespace, names are registered as `namespace.name`. Returns the
    /// number of registered procedures.
    pub fn register_object(
        &mut self,
        object: &dyn ExposeProcedures,
        restricted: &[&str],
        namespace: Option<&str>,
    ) -> Result<usize> {
        let mut count = 0;
        for (name, handler) in object.procedures() {
            if name.starts_with('_') || restricted.contains(&name.as_str()) {
                continue;
            }
            let full_name = match namespace {
                Some(ns) => format!("{}.{}", ns, name),
                None => name,
            };
            self.register_handler(&full_name, handler)?;
            count += 1;
        }
        Ok(count)
    }

    /// Names of registered procedures, sorted.
    pub fn procedures(&self) -> Vec<String> {
        let mut names: Vec<String> = self.procedures.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bind(&mut self, urls: &[&str]) -> Result<()> {
        for url in urls {
            self.socket.bind(url)?;
        }
        Ok(())
    }

    pub fn connect(&mut self, urls: &[&str]) -> Result<()> {
        for url in urls {
            self.socket.connect(url)?;
        }
        Ok(())
    }

    /// Hands the service over to a loop on the scheduler.
    pub fn start(self, sched: Arc<dyn Scheduler>) -> Result<ServiceHandle> {
        let exit = ExitBroadcast::new(&self.ctx)?;
        let identity = self.socket.identity()?;
        info!(
            "starting service {} with {} procedures",
            self.config.name,
            self.procedures.len()
        );
        sched.spawn(Box::new(ServiceLoop {
            name: self.config.name.clone(),
            socket: self.socket,
            exit: exit.listener(&self.ctx)?,
            procedures: self.procedures,
            serializer: self.serializer,
            generators: FnvHashMap::default(),
        }))?;
        Ok(ServiceHandle {
            name: self.config.name,
            identity,
            exit,
        })
    }
}

/// Handle to a running service. Dropping it stops the service.
pub struct ServiceHandle {
    name: String,
    identity: Vec<u8>,
    exit: ExitBroadcast,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn stop(mut self) -> Result<()> {
        self.exit.fire()
    }
}

/// Generators are keyed by route and request id, since request ids are
/// only unique per client.
type StreamKey = (Vec<Vec<u8>>, Vec<u8>);

struct ServiceLoop {
    name: String,
    socket: Socket,
    exit: ExitListener,
    procedures: FnvHashMap<String, Handler>,
    serializer: Arc<dyn Serializer>,
    generators: FnvHashMap<StreamKey, GeneratorSlot>,
}

impl Task for ServiceLoop {
    fn name(&self) -> &str {
        "netcall-service"
    }

    fn manual_poll(&mut self, wait: Duration) -> Result<Poll> {
        if self.exit.triggered() {
            debug!("service {} exiting, dropping {} streams", self.name, self.generators.len());
            return Ok(Poll::Exit);
        }
        let mut busy = false;
        if socket::poll(&[&self.socket], wait)?[0] {
            while let Some(frames) = self.socket.try_recv_multipart()? {
                busy = true;
                self.handle(frames);
            }
        }
        Ok(if busy { Poll::Busy } else { Poll::Idle })
    }
}

impl ServiceLoop {
    fn handle(&mut self, frames: Vec<Vec<u8>>) {
        let request = match proto::parse_request(frames) {
            Ok(r) => r,
            Err(e) => {
                debug!("dropping malformed request: {}", e);
                return;
            }
        };
        let name = self.name.as_bytes().to_vec();
        self.reply(&request, ReplyType::Ack, vec![name]);
        if request.is_control() {
            self.handle_control(request);
        } else {
            self.handle_call(request);
        }
    }

    fn handle_call(&mut self, request: Request) {
        let (args, kwargs) = match self.serializer.deserialize_args(&request.args, &request.kwargs) {
            Ok(a) => a,
            Err(e) => {
                self.report(&request, RemoteError::deserialization(&e.to_string()));
                return;
            }
        };
        let handler = match self.procedures.get(&request.proc_name) {
            Some(h) => h.clone(),
            None => {
                let message = format!("procedure not registered: {}", request.proc_name);
                let traceback = format!(
                    "Traceback (service {}):\n  dispatch {}\n{}: {}",
                    self.name, request.proc_name, NOT_IMPLEMENTED_ERROR, message
                );
                self.report(
                    &request,
                    RemoteError::raised(NOT_IMPLEMENTED_ERROR, &message, traceback),
                );
                return;
            }
        };
        match invoke(&request.proc_name, &handler, args, kwargs) {
            Ok(Outcome::Value(value)) => {
                if request.ignore {
                    return;
                }
                match self.serializer.serialize_result(&value) {
                    Ok(payload) => self.reply(&request, ReplyType::Ok, payload),
                    Err(e) => self.fail(&request, serialization_error(&request.proc_name, &e)),
                }
            }
            Ok(Outcome::Stream(generator)) => {
                let key = (request.route.clone(), request.req_id.clone());
                self.generators.insert(key, GeneratorSlot::new(generator));
                self.reply(&request, ReplyType::Yield, Vec::new());
            }
            Err(error) => self.report(&request, error),
        }
    }

    fn handle_control(&mut self, request: Request) {
        let key = (request.route.clone(), request.req_id.clone());
        if !self.generators.contains_key(&key) {
            let message = format!("no generator for request {:?}", request.req_id);
            let traceback = format!(
                "Traceback (service {}):\n  {}\n{}: {}",
                self.name, request.proc_name, LOOKUP_ERROR, message
            );
            self.fail(&request, RemoteError::raised(LOOKUP_ERROR, &message, traceback));
            return;
        }
        let args = match self.serializer.deserialize_args(&request.args, &request.kwargs) {
            Ok((args, _)) => args,
            Err(e) => {
                self.generators.remove(&key);
                self.fail(&request, RemoteError::deserialization(&e.to_string()));
                return;
            }
        };
        let command = control_command(&request.proc_name, args);

        let (yielded, terminal) = match self.generators.get_mut(&key) {
            Some(slot) => match panic::catch_unwind(AssertUnwindSafe(|| gen::resume(slot, command))) {
                Ok(step) => step,
                Err(payload) => (None, Some(panicked(&request.proc_name, payload))),
            },
            None => return,
        };
        if let Some(value) = yielded {
            match self.serializer.serialize_result(&value) {
                Ok(payload) => self.reply(&request, ReplyType::Yield, payload),
                Err(e) => {
                    self.generators.remove(&key);
                    self.fail(&request, serialization_error(&request.proc_name, &e));
                }
            }
        }
        if let Some(error) = terminal {
            self.generators.remove(&key);
            self.fail(&request, error);
        }
    }

    /// Sends a FAIL, or only logs it for ignored calls.
    fn report(&mut self, request: &Request, error: RemoteError) {
        if request.ignore {
            warn!("ignored call to {} failed: {}", request.proc_name, error);
        } else {
            self.fail(request, error);
        }
    }

    fn fail(&mut self, request: &Request, error: RemoteError) {
        match self.serializer.serialize_result(&error.to_value()) {
            Ok(payload) => self.reply(request, ReplyType::Fail, payload),
            Err(e) => error!("failed serializing error for {}: {}", request.proc_name, e),
        }
    }

    fn reply(&mut self, request: &Request, type_: ReplyType, payload: Vec<Vec<u8>>) {
        let frames = Reply::new(request.route.clone(), request.req_id.clone(), type_, payload).into_frames();
        if let Err(e) = self.socket.send_multipart(&frames) {
            warn!("failed sending {} for {}: {}", type_, request.proc_name, e);
        }
    }
}

fn control_command(proc_name: &str, args: Args) -> Resume {
    let mut args = args.into_iter();
    match proc_name {
        PROC_SEND => Resume::Send(args.next().unwrap_or(Value::Nil)),
        PROC_THROW => {
            let kind = match args.next() {
                Some(Value::Str(kind)) => kind,
                _ => GENERIC_ERROR.to_string(),
            };
            Resume::Throw {
                kind,
                value: args.next().unwrap_or(Value::Nil),
            }
        }
        _ => Resume::Close,
    }
}

/// Runs a handler, turning errors and panics into remote errors.
fn invoke(
    proc_name: &str,
    handler: &Handler,
    args: Args,
    kwargs: Kwargs,
) -> std::result::Result<Outcome, RemoteError> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(args, kwargs))) {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(remote_error(proc_name, &e)),
        Err(payload) => Err(panicked(proc_name, payload)),
    }
}

/// Maps a handler error to what the caller gets to see. The kind comes
/// from a [`ProcError`] anywhere in the chain, the traceback is the full
/// cause chain.
pub fn remote_error(proc_name: &str, error: &anyhow::Error) -> RemoteError {
    let typed = error.chain().find_map(|e| e.downcast_ref::<ProcError>());
    let (kind, message) = match typed {
        Some(p) => (p.kind.clone(), p.message.clone()),
        None => (GENERIC_ERROR.to_string(), error.to_string()),
    };
    let traceback = format!("Traceback (procedure {}):\n{:?}", proc_name, error);
    RemoteError {
        kind,
        message,
        traceback: Some(traceback),
    }
}

fn panicked(proc_name: &str, payload: Box<dyn std::any::Any + Send>) -> RemoteError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    error!("procedure {} panicked: {}", proc_name, message);
    RemoteError::raised(
        PANIC_ERROR,
        &message,
        format!("Traceback (procedure {}):\n  panicked: {}", proc_name, message),
    )
}

fn serialization_error(proc_name: &str, error: &netcall_core::Error) -> RemoteError {
    RemoteError::raised(
        "SerializationError",
        &error.to_string(),
        format!("Traceback (procedure {}):\n  serializing result\n{}", proc_name, error),
    )
}
