//! The composition primitives, registered as ordinary tasks.
//!
//! Group, chain and chord have no orchestration machinery of their own: each
//! runs inside a worker and drives its children through the same
//! apply/get surface any task author would use. The price is that a composed
//! pipeline holds a worker slot for its whole duration; see
//! [`crate::EngineConfig::max_composition_depth`].

use serde_json::Value;
use uuid::Uuid;

use crate::context::Context;
use crate::error::Result;
use crate::registry::{Registry, Rest};
use crate::request::{PartialRequest, Request};

pub(crate) const GROUP: &str = "conveyor.group";
pub(crate) const CHAIN: &str = "conveyor.chain";
pub(crate) const CHORD: &str = "conveyor.chord";

pub(crate) fn register_builtins(registry: &Registry) {
    registry.register(GROUP, group);
    registry.register(CHAIN, chain);
    registry.register(CHORD, chord);
}

/// Dispatch every request without waiting and return the ordered child ids.
/// The first dispatch failure aborts the group; children already dispatched
/// keep running.
async fn group(ctx: Context, requests: Rest<Request>) -> Result<Vec<Uuid>> {
    let mut ids = Vec::with_capacity(requests.0.len());
    for request in requests.0 {
        let result = ctx.apply(request).await?;
        ids.push(result.id());
    }
    Ok(ids)
}

/// Run the first request, then feed each step's value into the next partial
/// as its appended trailing argument. Resolves to the final step's value.
async fn chain(ctx: Context, first: Request, rest: Rest<PartialRequest>) -> Result<Value> {
    let mut result = ctx.apply(first).await?;
    for mut partial in rest.0 {
        let value = result.get().await?;
        partial.append(value);
        let request = ctx.complete(partial)?;
        result = ctx.apply(request).await?;
    }
    Ok(result.get().await?)
}

/// Fan the requests out as a group, wait on every child in request order,
/// and apply the callback over the collected values.
async fn chord(ctx: Context, callback: PartialRequest, requests: Rest<Request>) -> Result<Value> {
    let group = ctx.group(requests.0).await?;

    let mut callback = callback;
    for index in 0..group.count().await? {
        let child = group.result_of(index).await?;
        callback.append(child.get().await?);
    }

    let request = ctx.complete(callback)?;
    Ok(ctx.apply(request).await?.get().await?)
}
