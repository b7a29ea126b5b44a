//! The caller-facing surface: turn requests into dispatched messages and
//! hand back result handles.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{Dispatcher, Message, WORK_QUEUE, WORK_QUEUE_ROUTE};
use crate::builtin;
use crate::error::{Result, TaskError};
use crate::factory::{Options, Schemes};
use crate::registry::Registry;
use crate::request::{PartialRequest, Request};
use crate::result::{GroupResult, TaskResult};
use crate::store::ResultStore;

/// Dispatches requests and resolves results.
///
/// A client built by [`Client::connect`] (or [`Client::new`]) has no parent
/// id; clients embedded in a running task's [`crate::Context`] carry the
/// current task id and stamp it onto everything they apply.
#[derive(Clone)]
pub struct Client {
    dispatcher: Arc<dyn Dispatcher>,
    store: Arc<dyn ResultStore>,
    registry: Arc<Registry>,
    parent: Option<Uuid>,
}

impl Client {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        store: Arc<dyn ResultStore>,
        registry: Arc<Registry>,
    ) -> Self {
        Client {
            dispatcher,
            store,
            registry,
            parent: None,
        }
    }

    /// Wire a client from URL options: broker dispatcher plus result store.
    pub async fn connect(
        options: &Options,
        schemes: &Schemes,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let broker = schemes.open_broker(&options.broker).await?;
        let dispatcher = broker.dispatcher(&WORK_QUEUE_ROUTE).await?;
        let store = schemes.open_store(&options.store).await?;
        Ok(Self::new(dispatcher, store, registry))
    }

    pub(crate) fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatch a request and return the handle to its eventual result.
    ///
    /// The target queue is the function's dedicated queue if it was
    /// registered with one, else the shared work queue. On dispatch failure
    /// the error is returned and no result handle exists.
    pub async fn apply(&self, mut request: Request) -> Result<TaskResult> {
        if let Some(parent) = self.parent {
            request.stamp_parent(parent);
        }

        let entry = self
            .registry
            .lookup(request.function())
            .ok_or_else(|| TaskError::UnknownFunction(request.function().to_string()))?;
        let queue = entry.queue().unwrap_or(WORK_QUEUE);

        let message = Message::request(queue, &request)?;
        debug!(id = %request.id(), function = request.function(), queue, "dispatching task");
        self.dispatcher.dispatch(&message).await?;

        Ok(TaskResult::new(request.id(), self.store.clone()))
    }

    /// Run `requests` in parallel as one group task.
    ///
    /// The group dispatches children in order and fails on the first
    /// dispatch error; children dispatched before the failure keep running
    /// (no rollback).
    pub async fn group(&self, requests: Vec<Request>) -> Result<GroupResult> {
        let request = self.registry.call(builtin::GROUP, encode_all(&requests)?)?;
        let result = self.apply(request).await?;
        Ok(GroupResult::new(result, self.store.clone()))
    }

    /// Pipe tasks sequentially: each partial receives the previous step's
    /// resolved value as its appended trailing argument.
    pub async fn chain(&self, first: Request, rest: Vec<PartialRequest>) -> Result<TaskResult> {
        let mut args = vec![serde_json::to_value(&first)?];
        args.extend(encode_all(&rest)?);
        let request = self.registry.call(builtin::CHAIN, args)?;
        self.apply(request).await
    }

    /// Fan out `requests` in parallel, then feed every result, in request
    /// order, to `callback`. The callback must accept as many arguments as
    /// there are requests, or be variadic.
    pub async fn chord(
        &self,
        callback: PartialRequest,
        requests: Vec<Request>,
    ) -> Result<TaskResult> {
        let mut args = vec![serde_json::to_value(&callback)?];
        args.extend(encode_all(&requests)?);
        let request = self.registry.call(builtin::CHORD, args)?;
        self.apply(request).await
    }

    /// Build a detached result handle for an already-known task id.
    pub fn result_for(&self, id: Uuid) -> TaskResult {
        TaskResult::new(id, self.store.clone())
    }

    /// Release the underlying transport dispatcher.
    pub async fn close(&self) -> Result<()> {
        self.dispatcher.close().await
    }
}

fn encode_all<T: serde::Serialize>(items: &[T]) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|item| Ok(serde_json::to_value(item)?))
        .collect()
}
