//! Execution context handed to every task function.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::client::Client;
use crate::error::Result;
use crate::request::{PartialRequest, Request};
use crate::result::{GroupResult, TaskResult};

/// Identity of the currently executing task plus an embedded [`Client`].
///
/// The first parameter of every task function. Tasks spawn further work
/// through it (`apply`, `group`, `chain`, `chord`) and anything dispatched
/// this way is automatically stamped with the current task as parent.
/// The value bag carries cross-cutting data injected by middleware.
///
/// Cloning is cheap; the clone shares identity and values.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: Uuid,
    parent: Option<Uuid>,
    values: DashMap<String, Value>,
    client: Client,
}

impl Context {
    pub(crate) fn new(id: Uuid, parent: Option<Uuid>, client: Client) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                id,
                parent,
                values: DashMap::new(),
                client,
            }),
        }
    }

    /// Id of the task currently executing.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Id of the task that caused this one, if any.
    pub fn parent(&self) -> Option<Uuid> {
        self.inner.parent
    }

    /// Store a scoped value, typically from a middleware `enter` hook.
    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        self.inner.values.insert(key.into(), value);
    }

    /// Read back a scoped value.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.values.get(key).map(|v| v.clone())
    }

    /// The client bound to this task; everything it applies is parented
    /// here.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Request> {
        self.inner.client.registry().call(name, args)
    }

    pub fn partial_call(&self, name: &str, args: Vec<Value>) -> Result<PartialRequest> {
        self.inner.client.registry().partial_call(name, args)
    }

    pub fn complete(&self, partial: PartialRequest) -> Result<Request> {
        self.inner.client.registry().complete(partial)
    }

    pub async fn apply(&self, request: Request) -> Result<TaskResult> {
        self.inner.client.apply(request).await
    }

    pub async fn group(&self, requests: Vec<Request>) -> Result<GroupResult> {
        self.inner.client.group(requests).await
    }

    pub async fn chain(
        &self,
        first: Request,
        rest: Vec<PartialRequest>,
    ) -> Result<TaskResult> {
        self.inner.client.chain(first, rest).await
    }

    pub async fn chord(
        &self,
        callback: PartialRequest,
        requests: Vec<Request>,
    ) -> Result<TaskResult> {
        self.inner.client.chord(callback, requests).await
    }

    pub fn result_for(&self, id: Uuid) -> TaskResult {
        self.inner.client.result_for(id)
    }
}
