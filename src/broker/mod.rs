//! The pluggable message transport: brokers hand out dispatchers (publish
//! side) and consumers (delivery side). Concrete network transports live
//! outside the core; the in-process [`memory`] transport ships here as both
//! the test substrate and a single-process deployment mode.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::{self, CONTENT_ENCODING, CONTENT_TYPE};
use crate::error::Result;
use crate::request::Request;

/// Name of the shared default work queue.
pub const WORK_QUEUE: &str = "conveyor.work";

lazy_static! {
    /// Durable route for [`WORK_QUEUE`], used whenever a function has no
    /// dedicated queue of its own.
    pub static ref WORK_QUEUE_ROUTE: RouteOptions = RouteOptions::durable(WORK_QUEUE);
}

/// How a transport binds or declares a queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteOptions {
    pub queue: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub auto_confirm: bool,
}

impl RouteOptions {
    /// A plain durable queue, the default shape for task traffic.
    pub fn durable(queue: impl Into<String>) -> Self {
        RouteOptions {
            queue: queue.into(),
            durable: true,
            ..Default::default()
        }
    }
}

/// Transport envelope: routing plus an opaque encoded payload. Carries no
/// business semantics beyond the correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub queue: String,
    /// Reserved for RPC-style transports; unused by the core paths.
    pub reply_to: Option<String>,
    pub content_type: String,
    pub content_encoding: String,
    pub body: Vec<u8>,
}

impl Message {
    /// Wrap a request for dispatch to `queue`, correlated by the request id.
    pub fn request(queue: impl Into<String>, request: &Request) -> Result<Self> {
        Ok(Message {
            id: request.id(),
            queue: queue.into(),
            reply_to: None,
            content_type: CONTENT_TYPE.to_string(),
            content_encoding: CONTENT_ENCODING.to_string(),
            body: codec::encode(request)?,
        })
    }

    pub(crate) fn envelope(&self) -> codec::Envelope {
        codec::Envelope {
            id: self.id,
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            reply_to: self.reply_to.clone(),
            body: self.body.clone(),
        }
    }
}

/// A connection to a message transport.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn dispatcher(&self, route: &RouteOptions) -> Result<Arc<dyn Dispatcher>>;

    async fn consumer(&self, route: &RouteOptions) -> Result<Box<dyn Consumer>>;

    async fn close(&self) -> Result<()>;
}

/// Publish side of a broker connection.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Publish a message to the queue named in it.
    async fn dispatch(&self, message: &Message) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Delivery side of a broker connection, bound to one queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Open the delivery stream. The channel closes when the connection is
    /// lost or the consumer is closed.
    async fn consume(&mut self) -> Result<mpsc::Receiver<Box<dyn Delivery>>>;

    async fn close(&self) -> Result<()>;
}

/// One received message, acknowledgeable exactly once.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Correlation id the response will be published under.
    fn id(&self) -> Uuid;

    fn reply_queue(&self) -> Option<&str>;

    /// Raw payload bytes; see [`DeliveryExt::content`] for typed access.
    fn body(&self) -> &[u8];

    /// Acknowledge the delivery.
    async fn confirm(&self) -> Result<()>;
}

/// Typed payload access over the object-safe [`Delivery`] surface.
pub trait DeliveryExt: Delivery {
    fn content<T: DeserializeOwned>(&self) -> Result<T> {
        codec::decode(self.body())
    }
}

impl<D: Delivery + ?Sized> DeliveryExt for D {}
