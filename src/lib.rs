//! Asynchronous task queue based on distributed message passing.
//!
//! Callers register plain async functions in a [`Registry`], build validated
//! [`Request`]s against it, and dispatch them through a [`Client`] over a
//! pluggable transport ([`Broker`]). A pool of [`Engine`] workers picks the
//! requests up, executes them concurrently, and publishes each [`Response`]
//! to a shared correlation store ([`store::ResultStore`]) where a
//! [`TaskResult`] handle blocks for it.
//!
//! Tasks compose: [`Client::group`] fans requests out in parallel,
//! [`Client::chain`] pipes each step's value into the next, and
//! [`Client::chord`] fans out and feeds every result to a callback. The
//! composition primitives are themselves ordinary registered tasks executed
//! recursively by the engine.
//!
//! ```no_run
//! use std::sync::Arc;
//! use conveyor::{Client, Context, Engine, Options, Registry, Result, Schemes};
//! use serde_json::json;
//!
//! async fn add(_ctx: Context, a: i64, b: i64) -> Result<i64> {
//!     Ok(a + b)
//! }
//!
//! # async fn demo() -> Result<()> {
//! let registry = Arc::new(Registry::new());
//! registry.register("add", add);
//!
//! let options = Options {
//!     broker: "mem://local".into(),
//!     store: "mem://local".into(),
//!     graph: None,
//! };
//! let schemes = Arc::new(Schemes::with_defaults());
//!
//! let engine = Engine::new(&options, schemes.clone(), registry.clone(), vec![]).await?;
//! tokio::spawn(async move { engine.run().await });
//!
//! let client = Client::connect(&options, &schemes, registry.clone()).await?;
//! let result = client.apply(registry.call("add", vec![json!(1), json!(2)])?).await?;
//! assert_eq!(result.get_as::<i64>().await.unwrap(), 3);
//! # Ok(())
//! # }
//! ```

pub mod broker;
mod builtin;
pub mod client;
pub mod codec;
pub mod context;
pub mod engine;
pub mod error;
pub mod factory;
pub mod graph;
pub mod midware;
pub mod registry;
pub mod request;
pub mod result;
pub mod store;

pub use broker::memory::{MemoryBroker, MemoryBus};
pub use broker::{
    Broker, Consumer, Delivery, DeliveryExt, Dispatcher, Message, RouteOptions, WORK_QUEUE,
};
pub use client::Client;
pub use context::Context;
pub use engine::{Engine, EngineConfig, QueueSpec, DEFAULT_WORKERS};
pub use error::{ResolveError, Result, TaskError};
pub use factory::{Options, Schemes};
pub use graph::{Graph, GraphBackend, MemoryGraphBackend, NoopGraphBackend, TaskRecord};
pub use midware::{Middleware, MiddlewareStack};
pub use registry::{Registry, Rest, Signature, TaskEntry};
pub use request::{PartialRequest, Request, Response, State};
pub use result::{GroupResult, TaskResult};
pub use store::{DiscardStore, MemoryStore, ResultStore};
