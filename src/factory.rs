//! URL-based wiring: brokers, stores and lineage backends are chosen by
//! connection-string scheme through factories registered at process start.
//!
//! There are no process-wide registries: a [`Schemes`] instance is built
//! once and passed to the [`crate::Engine`] and [`crate::Client`]
//! constructors that need it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use url::Url;

use crate::broker::memory::{MemoryBroker, MemoryBus};
use crate::broker::Broker;
use crate::error::{Result, TaskError};
use crate::graph::{GraphBackend, MemoryGraphBackend, NoopGraphBackend};
use crate::store::{DiscardStore, MemoryStore, ResultStore, DEFAULT_GET_TIMEOUT, DEFAULT_KEEP};

/// Connection strings selecting the engine's collaborators.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub broker: String,
    pub store: String,
    /// Lineage backend; `None` means no recording.
    pub graph: Option<String>,
}

/// Builds a broker from a parsed connection URL. `open` may connect, and is
/// called again on every reconnection epoch.
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Arc<dyn Broker>>;
}

#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Arc<dyn ResultStore>>;
}

#[async_trait]
pub trait GraphFactory: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Arc<dyn GraphBackend>>;
}

/// Scheme-keyed factory table.
pub struct Schemes {
    brokers: DashMap<String, Arc<dyn BrokerFactory>>,
    stores: DashMap<String, Arc<dyn StoreFactory>>,
    graphs: DashMap<String, Arc<dyn GraphFactory>>,
}

impl Schemes {
    /// An empty table; register factories before use.
    pub fn new() -> Self {
        Schemes {
            brokers: DashMap::new(),
            stores: DashMap::new(),
            graphs: DashMap::new(),
        }
    }

    /// The in-process defaults: `mem://` broker and store, `discard://`
    /// store, `mem://` and `noop://` lineage backends.
    pub fn with_defaults() -> Self {
        let schemes = Self::new();
        schemes.register_broker("mem", Arc::new(MemoryBrokerFactory::default()));
        schemes.register_store("mem", Arc::new(MemoryStoreFactory::default()));
        schemes.register_store("discard", Arc::new(DiscardStoreFactory));
        schemes.register_graph("mem", Arc::new(MemoryGraphFactory::default()));
        schemes.register_graph("noop", Arc::new(NoopGraphFactory));
        schemes
    }

    pub fn register_broker(&self, scheme: &str, factory: Arc<dyn BrokerFactory>) {
        self.brokers.insert(scheme.to_string(), factory);
    }

    pub fn register_store(&self, scheme: &str, factory: Arc<dyn StoreFactory>) {
        self.stores.insert(scheme.to_string(), factory);
    }

    pub fn register_graph(&self, scheme: &str, factory: Arc<dyn GraphFactory>) {
        self.graphs.insert(scheme.to_string(), factory);
    }

    pub async fn open_broker(&self, raw: &str) -> Result<Arc<dyn Broker>> {
        let url = Url::parse(raw)?;
        let factory = self
            .brokers
            .get(url.scheme())
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| TaskError::UnknownScheme(url.scheme().to_string()))?;
        factory.open(&url).await
    }

    pub async fn open_store(&self, raw: &str) -> Result<Arc<dyn ResultStore>> {
        let url = Url::parse(raw)?;
        let factory = self
            .stores
            .get(url.scheme())
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| TaskError::UnknownScheme(url.scheme().to_string()))?;
        factory.open(&url).await
    }

    pub async fn open_graph(&self, raw: &str) -> Result<Arc<dyn GraphBackend>> {
        let url = Url::parse(raw)?;
        let factory = self
            .graphs
            .get(url.scheme())
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| TaskError::UnknownScheme(url.scheme().to_string()))?;
        factory.open(&url).await
    }
}

impl Default for Schemes {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or("local").to_string()
}

fn query_secs(url: &Url, key: &str, default: Duration) -> Result<Duration> {
    match url.query_pairs().find(|(k, _)| k == key) {
        Some((_, value)) => {
            let secs: u64 = value.parse().map_err(|_| {
                TaskError::invalid_configuration(format!(
                    "query parameter '{key}' must be an integer number of seconds, got '{value}'"
                ))
            })?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(default),
    }
}

/// Named in-process buses: every open of `mem://<name>` joins the same bus,
/// so engines and clients opened separately meet on the same queues.
#[derive(Default)]
pub struct MemoryBrokerFactory {
    buses: DashMap<String, Arc<MemoryBus>>,
}

impl MemoryBrokerFactory {
    /// The bus behind `mem://<name>`, if anything opened it yet. Mostly
    /// useful for inspecting counters in tests.
    pub fn bus(&self, name: &str) -> Option<Arc<MemoryBus>> {
        self.buses.get(name).map(|bus| Arc::clone(bus.value()))
    }
}

#[async_trait]
impl BrokerFactory for MemoryBrokerFactory {
    async fn open(&self, url: &Url) -> Result<Arc<dyn Broker>> {
        let bus = self
            .buses
            .entry(host_of(url))
            .or_insert_with(|| Arc::new(MemoryBus::new()))
            .clone();
        Ok(Arc::new(MemoryBroker::open(bus)))
    }
}

/// Named in-process stores, shared per host like the buses. Query parameters
/// `timeout=` and `keep=` (seconds) configure the first open; later opens of
/// the same name reuse the existing store.
#[derive(Default)]
pub struct MemoryStoreFactory {
    stores: DashMap<String, Arc<MemoryStore>>,
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open(&self, url: &Url) -> Result<Arc<dyn ResultStore>> {
        let timeout = query_secs(url, "timeout", DEFAULT_GET_TIMEOUT)?;
        let keep = query_secs(url, "keep", DEFAULT_KEEP)?;
        let store = self
            .stores
            .entry(host_of(url))
            .or_insert_with(|| Arc::new(MemoryStore::with_timeouts(timeout, keep)))
            .clone();
        Ok(store)
    }
}

pub struct DiscardStoreFactory;

#[async_trait]
impl StoreFactory for DiscardStoreFactory {
    async fn open(&self, _url: &Url) -> Result<Arc<dyn ResultStore>> {
        Ok(Arc::new(DiscardStore))
    }
}

/// Named in-process lineage backends, shared per host.
#[derive(Default)]
pub struct MemoryGraphFactory {
    graphs: DashMap<String, MemoryGraphBackend>,
}

impl MemoryGraphFactory {
    pub fn backend(&self, name: &str) -> Option<MemoryGraphBackend> {
        self.graphs.get(name).map(|graph| graph.clone())
    }
}

#[async_trait]
impl GraphFactory for MemoryGraphFactory {
    async fn open(&self, url: &Url) -> Result<Arc<dyn GraphBackend>> {
        let backend = self
            .graphs
            .entry(host_of(url))
            .or_insert_with(MemoryGraphBackend::new)
            .clone();
        Ok(Arc::new(backend))
    }
}

pub struct NoopGraphFactory;

#[async_trait]
impl GraphFactory for NoopGraphFactory {
    async fn open(&self, _url: &Url) -> Result<Arc<dyn GraphBackend>> {
        Ok(Arc::new(NoopGraphBackend))
    }
}
