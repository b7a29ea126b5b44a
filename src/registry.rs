//! Maps stable function names to typed invokers.
//!
//! Instead of runtime reflection, registration builds, once at process
//! start, a [`Signature`] describing the declared parameters and a boxed
//! invoker that decodes arguments and encodes the return value. Anything
//! shaped like `async fn(Context, A1..An) -> Result<R>` registers as-is;
//! a trailing [`Rest<V>`] parameter makes the function variadic.

use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::vec::IntoIter;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::context::Context;
use crate::error::{Result, TaskError};
use crate::request::{PartialRequest, Request};

/// Collects the trailing variadic arguments of a task function.
#[derive(Debug, Clone, PartialEq)]
pub struct Rest<T>(pub Vec<T>);

/// One declared parameter: its Rust type name plus a serde probe answering
/// whether a candidate argument can decode into it.
#[derive(Clone, Copy)]
pub struct ParamSpec {
    name: &'static str,
    check: fn(&Value) -> bool,
}

impl ParamSpec {
    fn of<T: DeserializeOwned>() -> Self {
        ParamSpec {
            name: type_name::<T>(),
            check: probe::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn accepts(&self, value: &Value) -> bool {
        (self.check)(value)
    }
}

fn probe<T: DeserializeOwned>(value: &Value) -> bool {
    serde_json::from_value::<T>(value.clone()).is_ok()
}

/// Declared parameter shape of a registered function, minus the leading
/// [`Context`].
#[derive(Clone)]
pub struct Signature {
    params: Vec<ParamSpec>,
    variadic: Option<ParamSpec>,
}

impl Signature {
    /// Number of fixed parameters.
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic.is_some()
    }

    /// Validate an argument list against this signature. `partial` permits
    /// fewer arguments than the fixed arity; whatever is present is still
    /// type checked position by position.
    pub(crate) fn check(&self, args: &[Value], partial: bool) -> Result<()> {
        if !partial && args.len() < self.params.len() {
            return Err(TaskError::TooFewArguments);
        }
        if self.variadic.is_none() && args.len() > self.params.len() {
            return Err(TaskError::TooManyArguments);
        }
        for (position, arg) in args.iter().enumerate() {
            let spec = self
                .params
                .get(position)
                .or(self.variadic.as_ref())
                .expect("argument count checked above");
            if !spec.accepts(arg) {
                return Err(TaskError::TypeMismatch {
                    position,
                    expected: spec.name,
                });
            }
        }
        Ok(())
    }
}

/// Implemented for every function shape the registry accepts. The type
/// parameter is an inference marker; callers never name it.
pub trait TaskFn<P>: Send + Sync + 'static {
    fn signature() -> Signature;

    fn invoke(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>>;
}

fn take_arg<T: DeserializeOwned>(args: &mut IntoIter<Value>, position: usize) -> Result<T> {
    let value = args.next().ok_or(TaskError::TooFewArguments)?;
    serde_json::from_value(value).map_err(|_| TaskError::TypeMismatch {
        position,
        expected: type_name::<T>(),
    })
}

fn encode_return<R: Serialize>(value: R) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

macro_rules! fail_fast {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => return Box::pin(std::future::ready(Err(error))),
        }
    };
}

macro_rules! impl_task_fn {
    ($($p:ident),*) => {
        #[allow(unused_variables, unused_mut, unused_assignments, non_snake_case)]
        impl<Func, Fut, R, $($p,)*> TaskFn<(($($p,)*),)> for Func
        where
            Func: Fn(Context, $($p),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R>> + Send + 'static,
            R: Serialize,
            $($p: DeserializeOwned + Send + 'static,)*
        {
            fn signature() -> Signature {
                Signature {
                    params: vec![$(ParamSpec::of::<$p>()),*],
                    variadic: None,
                }
            }

            fn invoke(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
                let mut args = args.into_iter();
                let mut position = 0usize;
                $(
                    let $p: $p = fail_fast!(take_arg(&mut args, position));
                    position += 1;
                )*
                let fut = (self)(ctx, $($p),*);
                Box::pin(async move { fut.await.and_then(encode_return) })
            }
        }

        #[allow(unused_variables, unused_mut, unused_assignments, non_snake_case)]
        impl<Func, Fut, R, V, $($p,)*> TaskFn<(($($p,)*), Rest<V>)> for Func
        where
            Func: Fn(Context, $($p,)* Rest<V>) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R>> + Send + 'static,
            R: Serialize,
            V: DeserializeOwned + Send + 'static,
            $($p: DeserializeOwned + Send + 'static,)*
        {
            fn signature() -> Signature {
                Signature {
                    params: vec![$(ParamSpec::of::<$p>()),*],
                    variadic: Some(ParamSpec::of::<V>()),
                }
            }

            fn invoke(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
                let mut args = args.into_iter();
                let mut position = 0usize;
                $(
                    let $p: $p = fail_fast!(take_arg(&mut args, position));
                    position += 1;
                )*
                let mut rest = Vec::new();
                for value in args {
                    rest.push(fail_fast!(serde_json::from_value::<V>(value).map_err(
                        |_| TaskError::TypeMismatch {
                            position,
                            expected: type_name::<V>(),
                        }
                    )));
                    position += 1;
                }
                let fut = (self)(ctx, $($p,)* Rest(rest));
                Box::pin(async move { fut.await.and_then(encode_return) })
            }
        }
    };
}

impl_task_fn!();
impl_task_fn!(A1);
impl_task_fn!(A1, A2);
impl_task_fn!(A1, A2, A3);
impl_task_fn!(A1, A2, A3, A4);
impl_task_fn!(A1, A2, A3, A4, A5);
impl_task_fn!(A1, A2, A3, A4, A5, A6);
impl_task_fn!(A1, A2, A3, A4, A5, A6, A7);
impl_task_fn!(A1, A2, A3, A4, A5, A6, A7, A8);

trait ErasedTask: Send + Sync {
    fn call(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>>;
}

struct Handler<F, P> {
    task: F,
    _marker: PhantomData<fn(P)>,
}

impl<F, P> ErasedTask for Handler<F, P>
where
    F: TaskFn<P>,
    P: 'static,
{
    fn call(&self, ctx: Context, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        self.task.invoke(ctx, args)
    }
}

/// A registered function: its invoker, signature and optional dedicated
/// queue.
pub struct TaskEntry {
    name: String,
    queue: Option<String>,
    signature: Signature,
    handler: Arc<dyn ErasedTask>,
}

impl TaskEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dedicated queue this function consumes from, if any; functions
    /// without one share the default work queue.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn invoke(
        &self,
        ctx: Context,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value>> {
        self.handler.call(ctx, args)
    }
}

/// Table of registered task functions, read-only after startup.
///
/// Construct one per process, register every task, then share it (behind an
/// `Arc`) with the [`crate::Engine`] and every [`crate::Client`]. The three
/// composition builtins are pre-registered by [`Registry::new`].
///
/// Registration happens at process start, so the one failure the type system
/// cannot rule out (two functions claiming the same name) panics instead of
/// returning an error.
pub struct Registry {
    tasks: DashMap<String, Arc<TaskEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        let registry = Registry {
            tasks: DashMap::new(),
        };
        crate::builtin::register_builtins(&registry);
        registry
    }

    /// Register a task function under `name` on the shared work queue.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register<P, F>(&self, name: &str, task: F)
    where
        F: TaskFn<P>,
        P: 'static,
    {
        self.insert(name, None, task);
    }

    /// Register a task function bound to a dedicated queue. The engine only
    /// serves dedicated queues it was configured with.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register_on_queue<P, F>(&self, name: &str, queue: &str, task: F)
    where
        F: TaskFn<P>,
        P: 'static,
    {
        self.insert(name, Some(queue.to_string()), task);
    }

    fn insert<P, F>(&self, name: &str, queue: Option<String>, task: F)
    where
        F: TaskFn<P>,
        P: 'static,
    {
        let entry = Arc::new(TaskEntry {
            name: name.to_string(),
            queue,
            signature: F::signature(),
            handler: Arc::new(Handler {
                task,
                _marker: PhantomData,
            }),
        });
        if self.tasks.insert(name.to_string(), entry).is_some() {
            panic!("task function '{name}' registered twice");
        }
        debug!(function = name, "registered task function");
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<TaskEntry>> {
        self.tasks.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Build a validated [`Request`]. Fails with `UnknownFunction`,
    /// `TooFewArguments`, `TooManyArguments` or `TypeMismatch` naming the
    /// offending position and the expected type.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Request> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| TaskError::UnknownFunction(name.to_string()))?;
        entry.signature.check(&args, false)?;
        Ok(Request::new(name, args))
    }

    /// Like [`Registry::call`] but permits fewer arguments than the fixed
    /// arity, for later completion via [`PartialRequest::append`] and
    /// [`Registry::complete`].
    pub fn partial_call(&self, name: &str, args: Vec<Value>) -> Result<PartialRequest> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| TaskError::UnknownFunction(name.to_string()))?;
        entry.signature.check(&args, true)?;
        Ok(PartialRequest::new(name, args))
    }

    /// Finalize a partial into a full request, re-running the complete
    /// validation over the accumulated argument list.
    pub fn complete(&self, partial: PartialRequest) -> Result<Request> {
        let (function, args) = partial.into_parts();
        self.call(&function, args)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
