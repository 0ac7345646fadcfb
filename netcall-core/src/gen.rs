//! Server-side generators driven over the wire.
//!
//! A procedure that streams its results hands the service a [`Generator`].
//! The service keeps it in a [`GeneratorSlot`] keyed by request and advances
//! it with [`resume`] each time a `_SEND`, `_THROW` or `_CLOSE` control call
//! arrives for that request.

use crate::remote::{RemoteError, RUNTIME_ERROR, TYPE_ERROR};
use crate::value::Value;

/// Command resuming a generator.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// Continue, handing in a value (nil for plain iteration)
    Send(Value),
    /// Raise an error of the named kind at the suspension point
    Throw { kind: String, value: Value },
    /// Ask the generator to finish
    Close,
}

/// Result of resuming a generator once.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Yield(Value),
    /// Generator finished normally
    Return,
    /// Generator failed
    Raise(RemoteError),
}

/// Resumable producer of values.
pub trait Generator: Send {
    fn resume(&mut self, input: Resume) -> Step;
}

/// Lifecycle of a driven generator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GenState {
    /// Returned by the procedure, never resumed
    Created,
    Streaming,
    Closed,
    Errored,
}

impl GenState {
    pub fn is_finished(&self) -> bool {
        matches!(self, GenState::Closed | GenState::Errored)
    }
}

/// Generator together with its lifecycle state.
pub struct GeneratorSlot {
    state: GenState,
    inner: Box<dyn Generator>,
}

impl GeneratorSlot {
    pub fn new(inner: Box<dyn Generator>) -> Self {
        Self {
            state: GenState::Created,
            inner,
        }
    }

    pub fn state(&self) -> GenState {
        self.state
    }
}

/// Advances the generator in `slot` by one command.
///
/// Returns the yielded value, or the terminal error once the generator is
/// done. Normal termination is reported as a `StopIteration` (or
/// `GeneratorExit` after a close) error without traceback.
pub fn resume(slot: &mut GeneratorSlot, command: Resume) -> (Option<Value>, Option<RemoteError>) {
    if slot.state.is_finished() {
        return (None, Some(RemoteError::stop_iteration()));
    }
    if slot.state == GenState::Created {
        match &command {
            Resume::Send(value) if !value.is_nil() => {
                slot.state = GenState::Errored;
                return (
                    None,
                    Some(RemoteError::raised(
                        TYPE_ERROR,
                        "can't send non-nil value to a just-started generator",
                        format!("Traceback:\n  resume: sent {} before first yield", value.type_name()),
                    )),
                );
            }
            Resume::Close => {
                slot.state = GenState::Closed;
                return (None, Some(RemoteError::generator_exit()));
            }
            _ => (),
        }
    }

    let closing = command == Resume::Close;
    match slot.inner.resume(command) {
        Step::Yield(_) if closing => {
            slot.state = GenState::Errored;
            (
                None,
                Some(RemoteError::raised(
                    RUNTIME_ERROR,
                    "generator ignored close",
                    "Traceback:\n  resume: value yielded after close".to_string(),
                )),
            )
        }
        Step::Yield(value) => {
            slot.state = GenState::Streaming;
            (Some(value), None)
        }
        Step::Return => {
            slot.state = GenState::Closed;
            if closing {
                (None, Some(RemoteError::generator_exit()))
            } else {
                (None, Some(RemoteError::stop_iteration()))
            }
        }
        Step::Raise(err) => {
            debug!("generator raised {}", err);
            slot.state = GenState::Errored;
            (None, Some(err))
        }
    }
}

/// Generator over an iterator, ignoring sent values.
///
/// Thrown errors are raised straight back, the way a generator without
/// error handling would.
pub struct IterGenerator<I> {
    iter: I,
}

impl<I> Generator for IterGenerator<I>
where
    I: Iterator<Item = Value> + Send,
{
    fn resume(&mut self, input: Resume) -> Step {
        match input {
            Resume::Send(_) => match self.iter.next() {
                Some(v) => Step::Yield(v),
                None => Step::Return,
            },
            Resume::Throw { kind, value } => Step::Raise(thrown(&kind, &value)),
            Resume::Close => Step::Return,
        }
    }
}

/// Wraps an iterator as a generator.
pub fn from_iter<I>(iter: I) -> Box<dyn Generator>
where
    I: IntoIterator<Item = Value>,
    I::IntoIter: Send + 'static,
{
    Box::new(IterGenerator {
        iter: iter.into_iter(),
    })
}

/// Generator backed by a closure receiving every resume command.
pub struct FnGenerator<F> {
    f: F,
}

impl<F> Generator for FnGenerator<F>
where
    F: FnMut(Resume) -> Step + Send,
{
    fn resume(&mut self, input: Resume) -> Step {
        (self.f)(input)
    }
}

/// Wraps a closure as a generator.
pub fn from_fn<F>(f: F) -> Box<dyn Generator>
where
    F: FnMut(Resume) -> Step + Send + 'static,
{
    Box::new(FnGenerator { f })
}

/// Error raised inside a generator by a `_THROW`.
pub fn thrown(kind: &str, value: &Value) -> RemoteError {
    let message = match value {
        Value::Str(s) => s.clone(),
        Value::Nil => String::new(),
        other => other.to_string(),
    };
    RemoteError::raised(
        kind,
        &message,
        format!("Traceback:\n  thrown into generator\n{}: {}", kind, message),
    )
}
