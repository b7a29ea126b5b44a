//! Optional execution-lineage recording.
//!
//! The engine calls [`GraphBackend::graph`] when a task starts and commits
//! the response when it finishes, both best-effort: a lineage backend that
//! errors never affects task processing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::request::{Request, Response, State};

/// Handle to one task's lineage entry.
#[async_trait]
pub trait Graph: Send + Sync {
    /// Record the task's outcome.
    async fn commit(&self, response: &Response) -> Result<()>;
}

/// Recorder of parent/child task relationships and outcomes.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Called when a task starts; the returned handle commits its outcome.
    async fn graph(&self, id: Uuid, request: &Request) -> Result<Box<dyn Graph>>;
}

/// Default backend: records nothing.
pub struct NoopGraphBackend;

struct NoopGraph;

#[async_trait]
impl GraphBackend for NoopGraphBackend {
    async fn graph(&self, _id: Uuid, _request: &Request) -> Result<Box<dyn Graph>> {
        Ok(Box::new(NoopGraph))
    }
}

#[async_trait]
impl Graph for NoopGraph {
    async fn commit(&self, _response: &Response) -> Result<()> {
        Ok(())
    }
}

/// One row of recorded lineage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskRecord {
    pub id: Uuid,
    pub parent: Option<Uuid>,
    pub function: String,
    pub arguments: Vec<Value>,
    pub state: Option<State>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// In-process lineage backend, queryable by task id or parent.
#[derive(Clone, Default)]
pub struct MemoryGraphBackend {
    records: Arc<DashMap<Uuid, TaskRecord>>,
}

impl MemoryGraphBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: Uuid) -> Option<TaskRecord> {
        self.records.get(&id).map(|record| record.clone())
    }

    /// All recorded children of `parent`, oldest first.
    pub fn children_of(&self, parent: Uuid) -> Vec<TaskRecord> {
        let mut children: Vec<TaskRecord> = self
            .records
            .iter()
            .filter(|record| record.parent == Some(parent))
            .map(|record| record.clone())
            .collect();
        children.sort_by_key(|record| record.started_at);
        children
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl GraphBackend for MemoryGraphBackend {
    async fn graph(&self, id: Uuid, request: &Request) -> Result<Box<dyn Graph>> {
        self.records.insert(
            id,
            TaskRecord {
                id,
                parent: request.parent(),
                function: request.function().to_string(),
                arguments: request.arguments().to_vec(),
                state: None,
                error: None,
                result: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
        Ok(Box::new(MemoryGraph {
            id,
            records: self.records.clone(),
        }))
    }
}

struct MemoryGraph {
    id: Uuid,
    records: Arc<DashMap<Uuid, TaskRecord>>,
}

#[async_trait]
impl Graph for MemoryGraph {
    async fn commit(&self, response: &Response) -> Result<()> {
        if let Some(mut record) = self.records.get_mut(&self.id) {
            record.state = Some(response.state);
            record.error = response.error.clone();
            record.result = response.result.clone();
            record.finished_at = Some(Utc::now());
        }
        Ok(())
    }
}
