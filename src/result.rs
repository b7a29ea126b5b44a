//! Caller-side handles that resolve a request's eventual response.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::ResolveError;
use crate::request::State;
use crate::store::ResultStore;

/// Handle to the eventual outcome of a dispatched request.
///
/// `get` blocks on the correlation store until the response for this id
/// arrives or the store's timeout elapses. The first resolution, value or
/// error, is memoized; later calls return the cached outcome without
/// touching the store again.
pub struct TaskResult {
    id: Uuid,
    store: Arc<dyn ResultStore>,
    resolved: OnceCell<Result<Value, ResolveError>>,
}

impl TaskResult {
    pub(crate) fn new(id: Uuid, store: Arc<dyn ResultStore>) -> Self {
        TaskResult {
            id,
            store,
            resolved: OnceCell::new(),
        }
    }

    /// Id of the request this handle tracks.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Block until the task's response arrives, with the store's default
    /// timeout. An error-state response surfaces as
    /// [`ResolveError::Failed`] carrying the task's own message.
    pub async fn get(&self) -> Result<Value, ResolveError> {
        self.wait(None).await
    }

    /// Like [`TaskResult::get`] with an explicit timeout.
    pub async fn get_within(&self, timeout: Duration) -> Result<Value, ResolveError> {
        self.wait(Some(timeout)).await
    }

    /// Resolve and decode the value into a concrete type.
    pub async fn get_as<T: DeserializeOwned>(&self) -> Result<T, ResolveError> {
        let value = self.get().await?;
        serde_json::from_value(value).map_err(|e| ResolveError::Malformed(e.to_string()))
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<Value, ResolveError> {
        self.resolved
            .get_or_init(|| async {
                let response = self.store.get(self.id, timeout).await?;
                match response.state {
                    State::Success => Ok(response.result.unwrap_or(Value::Null)),
                    State::Error => {
                        Err(ResolveError::Failed(response.error.unwrap_or_default()))
                    }
                }
            })
            .await
            .clone()
    }
}

/// Result of a [`crate::Client::group`] call: the group task resolves to the
/// ordered list of child request ids, and each child is reachable as its own
/// [`TaskResult`].
pub struct GroupResult {
    result: TaskResult,
    store: Arc<dyn ResultStore>,
}

impl GroupResult {
    pub(crate) fn new(result: TaskResult, store: Arc<dyn ResultStore>) -> Self {
        GroupResult { result, store }
    }

    /// Id of the group task itself.
    pub fn id(&self) -> Uuid {
        self.result.id()
    }

    /// The ordered child request ids, blocking until the group task has
    /// dispatched them all.
    pub async fn ids(&self) -> Result<Vec<Uuid>, ResolveError> {
        let value = self.result.get().await?;
        serde_json::from_value(value).map_err(|e| ResolveError::Malformed(e.to_string()))
    }

    /// Number of parallel tasks in the group.
    pub async fn count(&self) -> Result<usize, ResolveError> {
        Ok(self.ids().await?.len())
    }

    /// Handle for the `index`-th child task.
    pub async fn result_of(&self, index: usize) -> Result<TaskResult, ResolveError> {
        let ids = self.ids().await?;
        let id = ids.get(index).copied().ok_or_else(|| {
            ResolveError::Malformed(format!(
                "index {index} out of range for group of {}",
                ids.len()
            ))
        })?;
        Ok(TaskResult::new(id, self.store.clone()))
    }
}
