//! In-process transport: a shared bus of named queues.
//!
//! A [`MemoryBus`] outlives connections; a [`MemoryBroker`] is one
//! connection over it. Messages cross the bus as framed envelopes, so the
//! wire codec is exercised exactly as a network transport would. The bus
//! tracks dispatch/confirm counts and can sever every open connection,
//! which is what the engine's reconnection supervisor is tested against.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::{Result, TaskError};
use super::{Broker, Consumer, Delivery, Dispatcher, Message, RouteOptions};

const QUEUE_DEPTH: usize = 1024;

#[derive(Clone)]
struct BusQueue {
    tx: mpsc::Sender<Vec<u8>>,
    // Taken by the active consumer, handed back when its connection ends.
    rx: Arc<Mutex<Option<mpsc::Receiver<Vec<u8>>>>>,
    // Signals the active consumer of this one queue to die.
    sever: Arc<watch::Sender<bool>>,
}

/// The shared state behind every [`MemoryBroker`] connection.
pub struct MemoryBus {
    queues: DashMap<String, BusQueue>,
    connections: DashMap<u64, watch::Sender<bool>>,
    next_connection: AtomicU64,
    dispatched: AtomicU64,
    confirmed: AtomicU64,
    consumers_opened: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus {
            queues: DashMap::new(),
            connections: DashMap::new(),
            next_connection: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            confirmed: AtomicU64::new(0),
            consumers_opened: AtomicU64::new(0),
        }
    }

    fn queue(&self, name: &str) -> BusQueue {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                let (sever, _) = watch::channel(false);
                BusQueue {
                    tx,
                    rx: Arc::new(Mutex::new(Some(rx))),
                    sever: Arc::new(sever),
                }
            })
            .clone()
    }

    /// Kill the active consumer of one queue, as if just that consumer
    /// errored out. Other queues and connections are untouched.
    pub fn sever_queue(&self, name: &str) {
        if let Some(queue) = self.queues.get(name) {
            let _ = queue.sever.send(true);
        }
    }

    /// Sever every open connection, as if the transport died. Queued
    /// messages survive for the next connection.
    pub fn drop_connections(&self) {
        for connection in self.connections.iter() {
            let _ = connection.value().send(true);
        }
        self.connections.clear();
    }

    /// Messages accepted for dispatch since the bus was created.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Deliveries confirmed since the bus was created.
    pub fn confirmed(&self) -> u64 {
        self.confirmed.load(Ordering::SeqCst)
    }

    /// Consumer streams opened since the bus was created; grows by one per
    /// queue per connection epoch.
    pub fn consumers_opened(&self) -> u64 {
        self.consumers_opened.load(Ordering::SeqCst)
    }

    /// Names of the queues that have been declared so far.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.key().clone()).collect()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to a [`MemoryBus`].
pub struct MemoryBroker {
    bus: Arc<MemoryBus>,
    connection_id: u64,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryBroker {
    pub fn open(bus: Arc<MemoryBus>) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        let connection_id = bus.next_connection.fetch_add(1, Ordering::SeqCst);
        bus.connections.insert(connection_id, closed_tx);
        debug!(connection_id, "memory broker connected");
        MemoryBroker {
            bus,
            connection_id,
            closed_rx,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed_rx.borrow() {
            Err(TaskError::BrokerClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn dispatcher(&self, _route: &RouteOptions) -> Result<Arc<dyn Dispatcher>> {
        self.ensure_open()?;
        Ok(Arc::new(MemoryDispatcher {
            bus: self.bus.clone(),
            closed: self.closed_rx.clone(),
        }))
    }

    async fn consumer(&self, route: &RouteOptions) -> Result<Box<dyn Consumer>> {
        self.ensure_open()?;
        let (own_closed_tx, own_closed_rx) = watch::channel(false);
        Ok(Box::new(MemoryConsumer {
            bus: self.bus.clone(),
            route: route.clone(),
            connection_closed: self.closed_rx.clone(),
            own_closed_tx,
            own_closed_rx,
        }))
    }

    async fn close(&self) -> Result<()> {
        if let Some((_, closed_tx)) = self.bus.connections.remove(&self.connection_id) {
            let _ = closed_tx.send(true);
        }
        debug!(connection_id = self.connection_id, "memory broker closed");
        Ok(())
    }
}

struct MemoryDispatcher {
    bus: Arc<MemoryBus>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl Dispatcher for MemoryDispatcher {
    async fn dispatch(&self, message: &Message) -> Result<()> {
        if *self.closed.borrow() {
            return Err(TaskError::BrokerClosed);
        }
        if message.queue.is_empty() {
            return Err(TaskError::dispatch("queue is not set"));
        }

        let frame = codec::frame(&message.envelope())?;
        let queue = self.bus.queue(&message.queue);
        queue.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TaskError::QueueBusy(message.queue.clone()),
            TrySendError::Closed(_) => TaskError::BrokerClosed,
        })?;
        self.bus.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryConsumer {
    bus: Arc<MemoryBus>,
    route: RouteOptions,
    connection_closed: watch::Receiver<bool>,
    own_closed_tx: watch::Sender<bool>,
    own_closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn consume(&mut self) -> Result<mpsc::Receiver<Box<dyn Delivery>>> {
        let queue = self.bus.queue(&self.route.queue);
        let mut source = queue
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TaskError::ConsumerBusy(self.route.queue.clone()))?;
        self.bus.consumers_opened.fetch_add(1, Ordering::SeqCst);

        let (feed_tx, feed_rx) = mpsc::channel(1);
        let slot = queue.rx.clone();
        let bus = self.bus.clone();
        let queue_name = self.route.queue.clone();
        let mut connection_closed = self.connection_closed.clone();
        let mut own_closed = self.own_closed_rx.clone();
        let mut severed = queue.sever.subscribe();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = connection_closed.changed() => break,
                    _ = own_closed.changed() => break,
                    _ = severed.changed() => break,
                    frame = source.recv() => match frame {
                        Some(frame) => frame,
                        // bus torn down entirely
                        None => break,
                    },
                };

                let envelope = match codec::unframe(&frame) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        warn!(queue = %queue_name, %error, "dropping undecodable frame");
                        continue;
                    }
                };
                if !envelope.understood() {
                    warn!(
                        queue = %queue_name,
                        content_type = %envelope.content_type,
                        "dropping message with unsupported content type"
                    );
                    continue;
                }

                let delivery: Box<dyn Delivery> = Box::new(MemoryDelivery {
                    envelope,
                    queue: queue_name.clone(),
                    bus: bus.clone(),
                    confirmed: AtomicBool::new(false),
                });
                if feed_tx.send(delivery).await.is_err() {
                    // receiver dropped; the watcher is gone
                    break;
                }
            }
            // hand the queue back for the next connection epoch
            *slot.lock().await = Some(source);
            debug!(queue = %queue_name, "memory consumer stopped");
        });

        Ok(feed_rx)
    }

    async fn close(&self) -> Result<()> {
        let _ = self.own_closed_tx.send(true);
        Ok(())
    }
}

struct MemoryDelivery {
    envelope: codec::Envelope,
    queue: String,
    bus: Arc<MemoryBus>,
    confirmed: AtomicBool,
}

impl Drop for MemoryDelivery {
    // An unconfirmed delivery goes back to its queue, so messages in flight
    // when a connection dies are served again in the next epoch.
    fn drop(&mut self) {
        if !self.confirmed.load(Ordering::SeqCst) {
            match codec::frame(&self.envelope) {
                Ok(frame) => {
                    if self.bus.queue(&self.queue).tx.try_send(frame).is_err() {
                        warn!(queue = %self.queue, id = %self.envelope.id, "redelivery failed, message lost");
                    }
                }
                Err(error) => {
                    warn!(queue = %self.queue, %error, "could not re-frame unconfirmed delivery");
                }
            }
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn id(&self) -> Uuid {
        self.envelope.id
    }

    fn reply_queue(&self) -> Option<&str> {
        self.envelope.reply_to.as_deref()
    }

    fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    async fn confirm(&self) -> Result<()> {
        if self.confirmed.swap(true, Ordering::SeqCst) {
            return Err(TaskError::AlreadyConfirmed);
        }
        self.bus.confirmed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
