use std::sync::Arc;
use std::time::Duration;

use rhai::{Array, Dynamic, Engine, EvalAltResult, Scope};
use tokio::runtime::Handle;

use super::{Capability, CapabilityContext};
use crate::store::{CommandReply, Store};

/// Exposes the shared store to scripts as `redis`.
pub(crate) struct StoreCapability;

#[derive(Clone)]
struct StoreApi {
    store: Arc<dyn Store>,
    rt: Handle,
}

impl StoreApi {
    /// Issue a raw command; every argument is stringified first.
    fn run(&self, args: &[Dynamic]) -> Result<Dynamic, Box<EvalAltResult>> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        let reply = self
            .rt
            .block_on(self.store.command(&args))
            .map_err(|e| -> Box<EvalAltResult> { format!("{e:#}").into() })?;
        Ok(reply_to_dynamic(reply))
    }

    fn blpop(&self, timeout_seconds: i64, key: &str) -> Result<String, Box<EvalAltResult>> {
        let timeout = Duration::from_secs(timeout_seconds.max(0) as u64);
        let value = self
            .rt
            .block_on(self.store.blpop(key, timeout))
            .map_err(|e| -> Box<EvalAltResult> { format!("{e:#}").into() })?;
        Ok(value.unwrap_or_default())
    }
}

fn reply_to_dynamic(reply: CommandReply) -> Dynamic {
    match reply {
        CommandReply::Nil => Dynamic::UNIT,
        CommandReply::Int(v) => Dynamic::from(v),
        CommandReply::Text(v) => Dynamic::from(v),
        CommandReply::List(items) => {
            Dynamic::from(items.into_iter().map(reply_to_dynamic).collect::<Array>())
        }
    }
}

impl Capability for StoreCapability {
    fn name(&self) -> &str {
        "redis"
    }

    fn install(
        &self,
        engine: &mut Engine,
        scope: &mut Scope<'static>,
        ctx: &CapabilityContext,
    ) -> anyhow::Result<()> {
        engine.register_type_with_name::<StoreApi>("Redis");

        // rhai has no variadics; register `Do` for each useful arity.
        engine.register_fn("Do", |api: &mut StoreApi, a: Dynamic| api.run(&[a]));
        engine.register_fn("Do", |api: &mut StoreApi, a: Dynamic, b: Dynamic| {
            api.run(&[a, b])
        });
        engine.register_fn(
            "Do",
            |api: &mut StoreApi, a: Dynamic, b: Dynamic, c: Dynamic| api.run(&[a, b, c]),
        );
        engine.register_fn(
            "Do",
            |api: &mut StoreApi, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
                api.run(&[a, b, c, d])
            },
        );
        engine.register_fn(
            "Do",
            |api: &mut StoreApi, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic, e: Dynamic| {
                api.run(&[a, b, c, d, e])
            },
        );
        engine.register_fn(
            "Do",
            |api: &mut StoreApi,
             a: Dynamic,
             b: Dynamic,
             c: Dynamic,
             d: Dynamic,
             e: Dynamic,
             f: Dynamic| { api.run(&[a, b, c, d, e, f]) },
        );

        engine.register_fn("Blpop", |api: &mut StoreApi, timeout: i64, key: String| {
            api.blpop(timeout, &key)
        });

        scope.push(
            "redis",
            StoreApi {
                store: ctx.shared.store.clone(),
                rt: ctx.rt.clone(),
            },
        );

        Ok(())
    }
}
