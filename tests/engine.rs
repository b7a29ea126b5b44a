//! End-to-end suite over the in-process transport: round trips, failure
//! isolation, acknowledgment and reconnection invariants, and the three
//! composition primitives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use uuid::Uuid;

use conveyor::broker::{Dispatcher, Message, WORK_QUEUE, WORK_QUEUE_ROUTE};
use conveyor::codec::{CONTENT_ENCODING, CONTENT_TYPE};
use conveyor::factory::{MemoryBrokerFactory, MemoryGraphFactory, MemoryStoreFactory};
use conveyor::{
    Broker, Client, Context, Engine, EngineConfig, MemoryBus, Middleware, Options, QueueSpec,
    Registry, ResolveError, Result, Schemes, State, TaskError,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    });
}

async fn add(_ctx: Context, a: i64, b: i64) -> Result<i64> {
    Ok(a + b)
}

async fn sum3(_ctx: Context, a: i64, b: i64, c: i64) -> Result<i64> {
    Ok(a + b + c)
}

async fn failing(_ctx: Context, message: String) -> Result<()> {
    Err(TaskError::failed(message))
}

async fn panicking(_ctx: Context) -> Result<()> {
    panic!("worker must survive this");
}

async fn read_trace(ctx: Context) -> Result<Value> {
    Ok(ctx.value("trace").unwrap_or(Value::Null))
}

/// One isolated engine + client over a private memory bus, with handles to
/// the bus and lineage backend for inspection.
struct Harness {
    options: Options,
    schemes: Arc<Schemes>,
    registry: Arc<Registry>,
    broker_factory: Arc<MemoryBrokerFactory>,
    graph_factory: Arc<MemoryGraphFactory>,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let registry = Arc::new(Registry::new());
        registry.register("add", add);
        registry.register("sum3", sum3);
        registry.register("failing", failing);
        registry.register("panicking", panicking);
        registry.register("read_trace", read_trace);
        registry.register_on_queue("add.math", "conveyor.math", add);

        let broker_factory = Arc::new(MemoryBrokerFactory::default());
        let graph_factory = Arc::new(MemoryGraphFactory::default());
        let schemes = Schemes::new();
        schemes.register_broker("mem", broker_factory.clone());
        schemes.register_store("mem", Arc::new(MemoryStoreFactory::default()));
        schemes.register_graph("mem", graph_factory.clone());

        Harness {
            options: Options {
                broker: "mem://local".to_string(),
                store: "mem://local?timeout=10&keep=120".to_string(),
                graph: Some("mem://local".to_string()),
            },
            schemes: Arc::new(schemes),
            registry,
            broker_factory,
            graph_factory,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            reconnect_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn engine(&self, queues: Vec<QueueSpec>) -> Arc<Engine> {
        Arc::new(
            Engine::with_config(
                Self::config(),
                &self.options,
                self.schemes.clone(),
                self.registry.clone(),
                queues,
            )
            .await
            .unwrap(),
        )
    }

    async fn start(&self, queues: Vec<QueueSpec>) -> tokio::task::JoinHandle<()> {
        let engine = self.engine(queues).await;
        tokio::spawn(async move { engine.run().await })
    }

    async fn client(&self) -> Client {
        Client::connect(&self.options, &self.schemes, self.registry.clone())
            .await
            .unwrap()
    }

    fn bus(&self) -> Arc<MemoryBus> {
        self.broker_factory.bus("local").unwrap()
    }
}

async fn eventually(what: &str, mut probe: impl FnMut() -> bool) {
    for _ in 0..400 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_error_becomes_error_response() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let request = harness
        .registry
        .call("failing", vec![json!("no disk left")])
        .unwrap();
    let result = client.apply(request).await.unwrap();

    assert_eq!(
        result.get().await.unwrap_err(),
        ResolveError::Failed("no disk left".to_string())
    );
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_task_is_isolated() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let request = harness.registry.call("panicking", vec![]).unwrap();
    let result = client.apply(request).await.unwrap();
    assert_eq!(
        result.get().await.unwrap_err(),
        ResolveError::Failed("worker must survive this".to_string())
    );

    // the worker pool is still alive
    let request = harness
        .registry
        .call("add", vec![json!(2), json!(3)])
        .unwrap();
    let result = client.apply(request).await.unwrap();
    assert_eq!(result.get_as::<i64>().await.unwrap(), 5);
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_function_yields_error_response() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;

    // a client whose registry knows a function the engine does not
    let wider = Arc::new(Registry::new());
    wider.register("add", add);
    wider.register("ghost", add);
    let client = Client::connect(&harness.options, &harness.schemes, wider.clone())
        .await
        .unwrap();

    let request = wider.call("ghost", vec![json!(1), json!(2)]).unwrap();
    let result = client.apply(request).await.unwrap();
    match result.get().await.unwrap_err() {
        ResolveError::Failed(message) => assert!(message.contains("unknown function")),
        other => panic!("expected a failed response, got {other:?}"),
    }
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_payload_yields_error_response() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let broker = harness
        .schemes
        .open_broker(&harness.options.broker)
        .await
        .unwrap();
    let dispatcher = broker.dispatcher(&WORK_QUEUE_ROUTE).await.unwrap();
    let id = Uuid::new_v4();
    dispatcher
        .dispatch(&Message {
            id,
            queue: WORK_QUEUE.to_string(),
            reply_to: None,
            content_type: CONTENT_TYPE.to_string(),
            content_encoding: CONTENT_ENCODING.to_string(),
            body: b"definitely not a request".to_vec(),
        })
        .await
        .unwrap();

    match client.result_for(id).get().await.unwrap_err() {
        ResolveError::Failed(message) => assert!(message.contains("payload error")),
        other => panic!("expected a failed response, got {other:?}"),
    }
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_delivery_is_acknowledged_exactly_once() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let ok = client
        .apply(harness.registry.call("add", vec![json!(1), json!(2)]).unwrap())
        .await
        .unwrap();
    let failed = client
        .apply(harness.registry.call("failing", vec![json!("x")]).unwrap())
        .await
        .unwrap();
    let panicked = client
        .apply(harness.registry.call("panicking", vec![]).unwrap())
        .await
        .unwrap();

    let _ = ok.get().await;
    let _ = failed.get().await;
    let _ = panicked.get().await;

    let bus = harness.bus();
    eventually("all deliveries to be confirmed", || {
        bus.dispatched() == 3 && bus.confirmed() == 3
    })
    .await;
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_collects_ordered_children() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let first = harness
        .registry
        .call("add", vec![json!(1), json!(2)])
        .unwrap();
    let second = harness
        .registry
        .call("add", vec![json!(3), json!(4)])
        .unwrap();
    let expected_ids = vec![first.id(), second.id()];

    let group = client.group(vec![first, second]).await.unwrap();
    assert_eq!(group.count().await.unwrap(), 2);
    assert_eq!(group.ids().await.unwrap(), expected_ids);

    let first_result = group.result_of(0).await.unwrap();
    let second_result = group.result_of(1).await.unwrap();
    assert_eq!(first_result.get_as::<i64>().await.unwrap(), 3);
    assert_eq!(second_result.get_as::<i64>().await.unwrap(), 7);

    // children are parented to the group task itself
    let record = harness
        .graph_factory
        .backend("local")
        .unwrap()
        .record(expected_ids[0])
        .unwrap();
    assert_eq!(record.parent, Some(group.id()));
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chain_pipes_each_value_forward() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let first = harness
        .registry
        .call("add", vec![json!(1), json!(2)])
        .unwrap();
    let next = harness
        .registry
        .partial_call("add", vec![json!(10)])
        .unwrap();

    let result = client.chain(first, vec![next]).await.unwrap();
    assert_eq!(result.get_as::<i64>().await.unwrap(), 13);
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chord_feeds_collected_values_to_callback() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let callback = harness.registry.partial_call("sum3", vec![]).unwrap();
    let requests = vec![
        harness.registry.call("add", vec![json!(1), json!(2)]).unwrap(),
        harness.registry.call("add", vec![json!(3), json!(4)]).unwrap(),
        harness.registry.call("add", vec![json!(5), json!(6)]).unwrap(),
    ];

    let result = client.chord(callback, requests).await.unwrap();
    assert_eq!(result.get_as::<i64>().await.unwrap(), 21);
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chord_with_wrong_callback_arity_fails() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let callback = harness.registry.partial_call("sum3", vec![]).unwrap();
    let requests = vec![
        harness.registry.call("add", vec![json!(1), json!(2)]).unwrap(),
        harness.registry.call("add", vec![json!(3), json!(4)]).unwrap(),
    ];

    let result = client.chord(callback, requests).await.unwrap();
    match result.get().await.unwrap_err() {
        ResolveError::Failed(message) => assert!(message.contains("too few arguments")),
        other => panic!("expected arity failure, got {other:?}"),
    }
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dedicated_queues_serve_their_functions() {
    let harness = Harness::new();
    let runner = harness
        .start(vec![
            QueueSpec::work(16),
            QueueSpec::new("conveyor.math", 16),
        ])
        .await;
    let client = harness.client().await;

    let request = harness
        .registry
        .call("add.math", vec![json!(40), json!(2)])
        .unwrap();
    let result = client.apply(request).await.unwrap();
    assert_eq!(result.get_as::<i64>().await.unwrap(), 42);
    assert!(harness
        .bus()
        .queue_names()
        .contains(&"conveyor.math".to_string()));
    runner.abort();
}

struct Tracer;

impl Middleware for Tracer {
    fn enter(&self, ctx: &Context) {
        ctx.set_value("trace", json!(ctx.id().to_string()));
    }
}

struct Counter {
    enters: AtomicUsize,
    exits: AtomicUsize,
}

impl Middleware for Counter {
    fn enter(&self, _ctx: &Context) {
        self.enters.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self, _ctx: &Context) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn middleware_wraps_every_invocation() {
    let harness = Harness::new();
    let counter = Arc::new(Counter {
        enters: AtomicUsize::new(0),
        exits: AtomicUsize::new(0),
    });

    let mut engine = Engine::with_config(
        Harness::config(),
        &harness.options,
        harness.schemes.clone(),
        harness.registry.clone(),
        vec![],
    )
    .await
    .unwrap();
    engine.use_middleware(Arc::new(Tracer));
    engine.use_middleware(counter.clone());
    let engine = Arc::new(engine);
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    let client = harness.client().await;

    // the value injected by the middleware is visible to the task body
    let request = harness.registry.call("read_trace", vec![]).unwrap();
    let id = request.id();
    let result = client.apply(request).await.unwrap();
    assert_eq!(result.get().await.unwrap(), json!(id.to_string()));

    // exit hooks also run for failing tasks
    let request = harness
        .registry
        .call("failing", vec![json!("nope")])
        .unwrap();
    let _ = client.apply(request).await.unwrap().get().await;

    assert_eq!(counter.enters.load(Ordering::SeqCst), 2);
    assert_eq!(counter.exits.load(Ordering::SeqCst), 2);
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnects_after_total_connection_loss() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;

    let bus = {
        // the bus exists once the engine has connected
        let factory = harness.broker_factory.clone();
        eventually("engine to connect", move || factory.bus("local").is_some()).await;
        harness.bus()
    };
    eventually("first epoch consumers", || bus.consumers_opened() >= 1).await;

    bus.drop_connections();
    eventually("second epoch consumers", || bus.consumers_opened() >= 2).await;

    // a fresh client on the reconnected bus still gets work done
    let client = harness.client().await;
    let request = harness
        .registry
        .call("add", vec![json!(8), json!(9)])
        .unwrap();
    let result = client.apply(request).await.unwrap();
    assert_eq!(result.get_as::<i64>().await.unwrap(), 17);
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_one_queue_restarts_every_queue() {
    let harness = Harness::new();
    let runner = harness
        .start(vec![
            QueueSpec::work(16),
            QueueSpec::new("conveyor.math", 16),
        ])
        .await;

    let factory = harness.broker_factory.clone();
    eventually("engine to connect", move || factory.bus("local").is_some()).await;
    let bus = harness.bus();
    eventually("both queue watchers", || bus.consumers_opened() == 2).await;

    // kill only the math consumer; the sibling watcher must fall with it
    bus.sever_queue("conveyor.math");
    eventually("all watchers restarted", || bus.consumers_opened() >= 4).await;

    let client = harness.client().await;
    let result = client
        .apply(
            harness
                .registry
                .call("add.math", vec![json!(5), json!(6)])
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(result.get_as::<i64>().await.unwrap(), 11);
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lineage_records_start_and_outcome() {
    let harness = Harness::new();
    let runner = harness.start(vec![]).await;
    let client = harness.client().await;

    let request = harness
        .registry
        .call("add", vec![json!(6), json!(7)])
        .unwrap();
    let id = request.id();
    let result = client.apply(request).await.unwrap();
    assert_eq!(result.get_as::<i64>().await.unwrap(), 13);

    let backend = harness.graph_factory.backend("local").unwrap();
    eventually("lineage commit", || {
        backend
            .record(id)
            .map(|record| record.state == Some(State::Success))
            .unwrap_or(false)
    })
    .await;
    let record = backend.record(id).unwrap();
    assert_eq!(record.function, "add");
    assert_eq!(record.result, Some(json!(13)));
    assert!(record.finished_at.is_some());
    runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatch_failure_surfaces_and_leaves_no_result() {
    let harness = Harness::new();
    let client = harness.client().await;

    // fill the queue beyond capacity with nobody consuming
    let mut hit_capacity = false;
    for _ in 0..2048 {
        let request = harness
            .registry
            .call("add", vec![json!(1), json!(1)])
            .unwrap();
        match client.apply(request).await {
            Ok(_) => {}
            Err(TaskError::QueueBusy(queue)) => {
                assert_eq!(queue, WORK_QUEUE);
                hit_capacity = true;
                break;
            }
            Err(other) => panic!("unexpected dispatch error: {other}"),
        }
    }
    assert!(hit_capacity, "queue never reported capacity");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn results_expire_out_of_the_store() {
    let harness = Harness::new();
    let options = Options {
        store: "mem://expiring?timeout=1&keep=1".to_string(),
        ..harness.options.clone()
    };
    let engine = Arc::new(
        Engine::with_config(
            Harness::config(),
            &options,
            harness.schemes.clone(),
            harness.registry.clone(),
            vec![],
        )
        .await
        .unwrap(),
    );
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });
    let client = Client::connect(&options, &harness.schemes, harness.registry.clone())
        .await
        .unwrap();

    let request = harness
        .registry
        .call("add", vec![json!(1), json!(1)])
        .unwrap();
    let id = request.id();
    let result = client.apply(request).await.unwrap();
    assert_eq!(result.get_as::<i64>().await.unwrap(), 2);

    // a detached handle created after retention lapsed sees nothing
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let stale = client.result_for(id);
    assert_eq!(
        stale.get_within(Duration::from_millis(100)).await.unwrap_err(),
        ResolveError::Timeout
    );
    runner.abort();
}
