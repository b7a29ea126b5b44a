use thiserror::Error;

/// Errors surfaced while building, dispatching or executing tasks.
///
/// Construction errors (`UnknownFunction`, `TooFewArguments`,
/// `TooManyArguments`, `TypeMismatch`) are returned synchronously by
/// [`crate::Registry::call`] and friends and are never dispatched. Transport
/// and wiring errors come back from `apply`/`connect`. Inside a running task,
/// any variant returned from the task body becomes the task's error response.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("too few arguments")]
    TooFewArguments,

    #[error("too many arguments")]
    TooManyArguments,

    #[error("argument {position} must decode as {expected}")]
    TypeMismatch {
        position: usize,
        expected: &'static str,
    },

    #[error("broker closed")]
    BrokerClosed,

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("queue '{0}' is at capacity")]
    QueueBusy(String),

    #[error("queue '{0}' already has a consumer")]
    ConsumerBusy(String),

    #[error("delivery already confirmed")]
    AlreadyConfirmed,

    #[error("frame error: {0}")]
    Frame(#[from] bincode::Error),

    #[error("payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unknown scheme: {0}")]
    UnknownScheme(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A task body reporting failure with a plain message.
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Shorthand for a task-authored failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch(message.into())
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }
}

/// Failures observed while resolving a [`crate::TaskResult`].
///
/// Kept apart from [`TaskError`] (and kept `Clone`) so a result handle can
/// memoize its first resolution, and so callers can tell a store timeout from
/// an error response produced by the task itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No response arrived within the store timeout.
    #[error("timed out waiting for result")]
    Timeout,

    /// The task finished in the error state; the message is the task's own.
    #[error("{0}")]
    Failed(String),

    #[error("result store error: {0}")]
    Store(String),

    #[error("malformed result payload: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;
