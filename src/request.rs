//! The task invocation protocol: requests going out, responses coming back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A fully-specified, validated invocation of a registered task function.
///
/// Built through [`crate::Registry::call`] (or by completing a
/// [`PartialRequest`]); immutable afterwards. Requests are serializable value
/// objects so composition tasks can carry them as ordinary arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    id: Uuid,
    parent: Option<Uuid>,
    function: String,
    arguments: Vec<Value>,
}

impl Request {
    pub(crate) fn new(function: impl Into<String>, arguments: Vec<Value>) -> Self {
        Request {
            id: Uuid::new_v4(),
            parent: None,
            function: function.into(),
            arguments,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the task that caused this request; `None` for root calls.
    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Record the causing task, unless one is already recorded.
    pub(crate) fn stamp_parent(&mut self, parent: Uuid) {
        if self.parent.is_none() {
            self.parent = Some(parent);
        }
    }
}

/// A request under construction, still missing trailing arguments.
///
/// Arguments may be appended at any time; the partial turns into a [`Request`]
/// through [`crate::Registry::complete`], which runs the full arity and type
/// validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialRequest {
    function: String,
    arguments: Vec<Value>,
}

impl PartialRequest {
    pub(crate) fn new(function: impl Into<String>, arguments: Vec<Value>) -> Self {
        PartialRequest {
            function: function.into(),
            arguments,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Append a trailing argument. Validation is deferred to completion.
    pub fn append(&mut self, value: Value) {
        self.arguments.push(value);
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Value>) {
        (self.function, self.arguments)
    }
}

/// Terminal state of a processed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Success,
    Error,
}

/// The persisted outcome of executing a [`Request`]; produced exactly once
/// per processed delivery and published to the result store under the
/// request's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub state: State,
    /// Set iff `state == Error`.
    pub error: Option<String>,
    /// Set iff `state == Success`.
    pub result: Option<Value>,
}

impl Response {
    pub fn success(id: Uuid, result: Value) -> Self {
        Response {
            id,
            state: State::Success,
            error: None,
            result: Some(result),
        }
    }

    pub fn error(id: Uuid, message: impl Into<String>) -> Self {
        Response {
            id,
            state: State::Error,
            error: Some(message.into()),
            result: None,
        }
    }
}
