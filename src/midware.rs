//! Hooks wrapped around every task invocation.

use std::sync::Arc;

use crate::context::Context;

/// An Enter/Exit pair run around each task invocation.
///
/// Both hooks default to no-ops, so a middleware only implements the side it
/// cares about. Hooks talk to task bodies through the context value bag.
pub trait Middleware: Send + Sync {
    /// Runs before the task function, in registration order.
    fn enter(&self, _ctx: &Context) {}

    /// Runs after the task function, in reverse registration order, whether
    /// the invocation succeeded or failed.
    fn exit(&self, _ctx: &Context) {}
}

/// Ordered middleware list, applied scope-like: first in, last out.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    stack: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.stack.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub(crate) fn enter(&self, ctx: &Context) {
        for middleware in &self.stack {
            middleware.enter(ctx);
        }
    }

    pub(crate) fn exit(&self, ctx: &Context) {
        for middleware in self.stack.iter().rev() {
            middleware.exit(ctx);
        }
    }
}
