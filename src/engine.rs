//! The execution engine: consumes deliveries, invokes registered functions
//! under panic isolation, persists responses and acknowledges, forever,
//! across broker reconnects.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, Delivery, DeliveryExt, Dispatcher, RouteOptions, WORK_QUEUE, WORK_QUEUE_ROUTE,
};
use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, TaskError};
use crate::factory::{Options, Schemes};
use crate::graph::{Graph, GraphBackend, NoopGraphBackend};
use crate::midware::{Middleware, MiddlewareStack};
use crate::registry::Registry;
use crate::request::{Request, Response, State};
use crate::store::ResultStore;

/// Workers serving the shared work queue when no queues are configured.
pub const DEFAULT_WORKERS: usize = 64;

/// One consumed queue and the size of its worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub workers: usize,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        QueueSpec {
            name: name.into(),
            workers,
        }
    }

    /// The shared default work queue.
    pub fn work(workers: usize) -> Self {
        Self::new(WORK_QUEUE, workers)
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between reconnection attempts after the broker connection is
    /// lost (a little jitter is added on top).
    pub reconnect_delay: Duration,
    /// Deepest composition nesting the worker pools must absorb. A group,
    /// chain or chord holds its worker slot while it waits on children, so
    /// a queue whose pool is not strictly larger than the concurrent
    /// nesting depth can starve or deadlock.
    pub max_composition_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            reconnect_delay: Duration::from_secs(3),
            max_composition_depth: 8,
        }
    }
}

impl EngineConfig {
    /// Enforce the worker-pool/nesting contract for every configured queue.
    pub fn validate(&self, queues: &[QueueSpec]) -> Result<()> {
        for queue in queues {
            if queue.workers == 0 {
                return Err(TaskError::invalid_configuration(format!(
                    "queue '{}' has no workers",
                    queue.name
                )));
            }
            if queue.workers <= self.max_composition_depth {
                return Err(TaskError::invalid_configuration(format!(
                    "queue '{}' has {} workers but compositions may nest {} deep; \
                     the pool could deadlock waiting on its own children",
                    queue.name, queue.workers, self.max_composition_depth
                )));
            }
        }
        Ok(())
    }
}

/// Runs tasks delivered over the transport.
///
/// Per delivered message: decode the request, look up the registered
/// function, invoke it with a fresh [`Context`] under the middleware chain,
/// persist the [`Response`], commit lineage, acknowledge. Every delivery is
/// acknowledged exactly once, success or failure; the engine never re-queues
/// on its own.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<Registry>,
    store: Arc<dyn ResultStore>,
    graph: Arc<dyn GraphBackend>,
    middleware: MiddlewareStack,
    queues: Vec<QueueSpec>,
    broker_url: String,
    schemes: Arc<Schemes>,
}

impl Engine {
    /// Build an engine with default configuration. An empty `queues` list
    /// gets the shared work queue with [`DEFAULT_WORKERS`] workers.
    pub async fn new(
        options: &Options,
        schemes: Arc<Schemes>,
        registry: Arc<Registry>,
        queues: Vec<QueueSpec>,
    ) -> Result<Self> {
        Self::with_config(EngineConfig::default(), options, schemes, registry, queues).await
    }

    pub async fn with_config(
        config: EngineConfig,
        options: &Options,
        schemes: Arc<Schemes>,
        registry: Arc<Registry>,
        queues: Vec<QueueSpec>,
    ) -> Result<Self> {
        let queues = if queues.is_empty() {
            vec![QueueSpec::work(DEFAULT_WORKERS)]
        } else {
            queues
        };
        config.validate(&queues)?;

        let store = schemes.open_store(&options.store).await?;
        let graph: Arc<dyn GraphBackend> = match &options.graph {
            Some(url) => schemes.open_graph(url).await?,
            None => Arc::new(NoopGraphBackend),
        };

        Ok(Engine {
            config,
            registry,
            store,
            graph,
            middleware: MiddlewareStack::default(),
            queues,
            broker_url: options.broker.clone(),
            schemes,
        })
    }

    /// Append a middleware; enter hooks run in this order, exit hooks in
    /// reverse.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    /// Process messages until the future is dropped. Connection loss of any
    /// queue tears the whole epoch down; the engine then reconnects and
    /// restarts every queue watcher after a backoff.
    pub async fn run(&self) {
        loop {
            match self.connect().await {
                Ok((broker, dispatcher)) => self.run_epoch(broker, dispatcher).await,
                Err(error) => {
                    warn!(%error, broker = %self.broker_url, "failed to connect to broker");
                }
            }
            let backoff =
                self.config.reconnect_delay + Duration::from_millis(fastrand::u64(..250));
            tokio::time::sleep(backoff).await;
        }
    }

    async fn connect(&self) -> Result<(Arc<dyn Broker>, Arc<dyn Dispatcher>)> {
        let broker = self.schemes.open_broker(&self.broker_url).await?;
        let dispatcher = broker.dispatcher(&WORK_QUEUE_ROUTE).await?;
        Ok((broker, dispatcher))
    }

    /// One connection epoch: all queue watchers run under a shared cancel
    /// scope, and the first to exit takes the rest down with it.
    async fn run_epoch(&self, broker: Arc<dyn Broker>, dispatcher: Arc<dyn Dispatcher>) {
        let shared = Arc::new(Shared {
            registry: self.registry.clone(),
            store: self.store.clone(),
            graph: self.graph.clone(),
            middleware: self.middleware.clone(),
            dispatcher,
        });

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut watchers = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            watchers.push(tokio::spawn(run_queue(
                shared.clone(),
                broker.clone(),
                queue.clone(),
                cancel_rx.clone(),
            )));
        }
        info!(queues = self.queues.len(), broker = %self.broker_url, "engine connected");

        let (_first, _index, rest) = select_all(watchers).await;
        let _ = cancel_tx.send(true);
        for watcher in rest {
            let _ = watcher.await;
        }
        let _ = broker.close().await;
        warn!("connection epoch ended, reconnecting");
    }
}

/// Per-epoch state every worker shares.
struct Shared {
    registry: Arc<Registry>,
    store: Arc<dyn ResultStore>,
    graph: Arc<dyn GraphBackend>,
    middleware: MiddlewareStack,
    dispatcher: Arc<dyn Dispatcher>,
}

async fn run_queue(
    shared: Arc<Shared>,
    broker: Arc<dyn Broker>,
    queue: QueueSpec,
    mut cancel: watch::Receiver<bool>,
) {
    let route = RouteOptions::durable(&queue.name);
    let mut consumer = match broker.consumer(&route).await {
        Ok(consumer) => consumer,
        Err(error) => {
            error!(%error, queue = %queue.name, "failed to open consumer");
            return;
        }
    };
    let mut deliveries = match consumer.consume().await {
        Ok(deliveries) => deliveries,
        Err(error) => {
            error!(%error, queue = %queue.name, "failed to open delivery stream");
            return;
        }
    };

    let slots = Arc::new(Semaphore::new(queue.workers));
    debug!(queue = %queue.name, workers = queue.workers, "queue watcher started");

    loop {
        let delivery = tokio::select! {
            _ = cancel.changed() => {
                info!(queue = %queue.name, "queue watcher canceled");
                break;
            }
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!(queue = %queue.name, "delivery stream closed");
                    break;
                }
            },
        };

        // wait for a free worker slot, unless the epoch ends first
        let permit = tokio::select! {
            _ = cancel.changed() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            let _slot = permit;
            handle_delivery(shared, delivery).await;
        });
    }

    let _ = consumer.close().await;
}

/// Drive one delivery through decode, invoke, persist, lineage commit, ack.
async fn handle_delivery(shared: Arc<Shared>, delivery: Box<dyn Delivery>) {
    let id = delivery.id();
    debug!(%id, "received message");

    let (response, graph) = process(&shared, id, delivery.as_ref()).await;

    if let Err(error) = shared.store.set(&response).await {
        error!(%id, %error, "failed to persist response");
    }
    if let Some(graph) = graph {
        if let Err(error) = graph.commit(&response).await {
            debug!(%id, %error, "lineage commit failed");
        }
    }
    if let Err(error) = delivery.confirm().await {
        error!(%id, %error, "failed to acknowledge delivery");
    }
    if response.state == State::Error {
        warn!(%id, error = response.error.as_deref().unwrap_or(""), "task ended in error");
    }
}

/// Decode and invoke; every failure becomes an error response.
async fn process(
    shared: &Arc<Shared>,
    id: Uuid,
    delivery: &dyn Delivery,
) -> (Response, Option<Box<dyn Graph>>) {
    let request: Request = match delivery.content() {
        Ok(request) => request,
        Err(error) => return (Response::error(id, error.to_string()), None),
    };

    // lineage is best-effort; a failing backend never blocks the task
    let graph = shared.graph.graph(id, &request).await.ok();

    let response = match invoke(shared, id, &request).await {
        Ok(value) => Response::success(id, value),
        Err(message) => Response::error(id, message),
    };
    (response, graph)
}

async fn invoke(
    shared: &Arc<Shared>,
    id: Uuid,
    request: &Request,
) -> std::result::Result<Value, String> {
    let entry = match shared.registry.lookup(request.function()) {
        Some(entry) => entry,
        None => {
            return Err(TaskError::UnknownFunction(request.function().to_string()).to_string())
        }
    };

    let client = Client::new(
        shared.dispatcher.clone(),
        shared.store.clone(),
        shared.registry.clone(),
    )
    .with_parent(id);
    let ctx = Context::new(id, request.parent(), client);

    shared.middleware.enter(&ctx);
    // The invocation runs in its own task so a panicking function is
    // isolated as a JoinError instead of unwinding through the worker.
    let joined = tokio::spawn(entry.invoke(ctx.clone(), request.arguments().to_vec())).await;
    shared.middleware.exit(&ctx);

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(error.to_string()),
        Err(join) if join.is_panic() => {
            let message = panic_message(join.into_panic());
            error!(%id, %message, "task panicked");
            Err(message)
        }
        Err(_) => Err("task canceled".to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
