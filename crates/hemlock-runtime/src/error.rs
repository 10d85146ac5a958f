//! Error types for runtime operations

use derive_more::{Display, From};

use crate::value::{Owned, Value};

pub type RtResult<T> = Result<T, RtError>;

#[derive(Display, Debug, From)]
#[display("{kind}")]
pub struct RtError {
    #[from]
    kind: Box<RtErrorKind>,
}

impl<E> From<E> for RtError
where
    RtErrorKind: From<E>,
{
    fn from(error: E) -> Self {
        RtError {
            kind: Box::new(RtErrorKind::from(error)),
        }
    }
}

impl RtError {
    pub fn kind(&self) -> &RtErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> RtErrorKind {
        *self.kind
    }

    pub(crate) fn division_by_zero() -> Self {
        RtErrorKind::DivisionByZero.into()
    }

    pub(crate) fn range(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::RangeError(msg.to_string()).into()
    }

    pub(crate) fn type_mismatch(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::TypeMismatch(msg.to_string()).into()
    }

    pub(crate) fn unknown_type(name: impl std::fmt::Display) -> Self {
        RtErrorKind::UnknownType(name.to_string()).into()
    }

    pub(crate) fn missing_field(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::MissingField(msg.to_string()).into()
    }

    pub(crate) fn type_arity(name: &str, expected: usize, got: usize) -> Self {
        RtErrorKind::TypeArityMismatch {
            name: name.to_string(),
            expected,
            got,
        }
        .into()
    }

    pub(crate) fn index_out_of_bounds(index: i64, len: usize) -> Self {
        RtErrorKind::IndexOutOfBounds { index, len }.into()
    }

    pub(crate) fn null_dereference(op: &'static str) -> Self {
        RtErrorKind::NullDereference(op).into()
    }

    pub(crate) fn arity(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::ArityError(msg.to_string()).into()
    }

    pub(crate) fn stack_overflow() -> Self {
        RtErrorKind::StackOverflow.into()
    }

    pub(crate) fn parse(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::ParseError(msg.to_string()).into()
    }

    pub(crate) fn closed_channel() -> Self {
        RtErrorKind::ClosedChannel.into()
    }

    pub(crate) fn exhausted(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::ResourceExhausted(msg.to_string()).into()
    }

    pub(crate) fn cycle_detected() -> Self {
        RtErrorKind::CycleDetected.into()
    }

    pub(crate) fn no_such_method(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::NoSuchMethod(msg.to_string()).into()
    }

    pub(crate) fn use_after_free(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::UseAfterFree(msg.to_string()).into()
    }

    pub(crate) fn runtime(msg: impl std::fmt::Display) -> Self {
        RtErrorKind::Runtime(msg.to_string()).into()
    }

    /// Wrap a value thrown by user code. Takes over one reference.
    pub(crate) fn user(value: Owned) -> Self {
        RtErrorKind::UserException(value).into()
    }

    /// The thrown value already sits in the innermost exception frame.
    pub(crate) fn propagated() -> Self {
        RtErrorKind::Propagated.into()
    }

    pub fn is_user_exception(&self) -> bool {
        matches!(*self.kind, RtErrorKind::UserException(_))
    }

    /// Convert this error into the value a `catch` block observes.
    ///
    /// User exceptions hand over their value; every other kind becomes a
    /// string holding the diagnostic message.
    pub fn into_value(self) -> Value {
        match *self.kind {
            RtErrorKind::UserException(value) => value.into_raw(),
            RtErrorKind::Propagated => crate::exception::take_in_flight(),
            other => Value::string_from(&other.to_string()),
        }
    }
}

#[derive(Display, Debug)]
pub enum RtErrorKind {
    #[display("Division by zero")]
    DivisionByZero,

    #[display("{_0}")]
    RangeError(String),

    #[display("{_0}")]
    TypeMismatch(String),

    #[display("Unknown type '{_0}'")]
    UnknownType(String),

    #[display("{_0}")]
    MissingField(String),

    #[display("Type '{name}' expects {expected} type arguments, got {got}")]
    TypeArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[display("Index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: i64, len: usize },

    #[display("Null pointer dereference in {_0}")]
    NullDereference(&'static str),

    #[display("{_0}")]
    ArityError(String),

    #[display("Maximum call stack depth exceeded (infinite recursion?)")]
    StackOverflow,

    #[display("{_0}")]
    ParseError(String),

    #[display("cannot send to closed channel")]
    ClosedChannel,

    #[display("Resource exhausted: {_0}")]
    ResourceExhausted(String),

    #[display("serialize() detected circular reference")]
    CycleDetected,

    #[display("{_0}")]
    NoSuchMethod(String),

    #[display("{_0}")]
    UseAfterFree(String),

    #[display("{_0}")]
    Runtime(String),

    #[display("{}", crate::format::to_display_string(_0.get()))]
    UserException(Owned),

    #[display("exception in flight")]
    Propagated,
}

impl From<serde_json::Error> for RtErrorKind {
    fn from(error: serde_json::Error) -> Self {
        RtErrorKind::ParseError(format!("Invalid JSON: {error}"))
    }
}

impl std::error::Error for RtError {}
