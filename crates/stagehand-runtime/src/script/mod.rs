//! The embedded script host and the capability bundle exposed to user code.
//!
//! Every task owns one [`ScriptHost`]: a rhai engine with a persistent scope,
//! the capability bundle installed, and an [`Interrupt`] that cancels an
//! evaluation at the engine's next safe point. Evaluations always run on
//! blocking threads; capability bindings bridge back into async I/O through a
//! captured runtime handle, and a panic inside a script is contained to its
//! task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use tokio::runtime::Handle;

use crate::error::Interrupted;
use crate::flag::ShutdownFlag;
use crate::worker::SharedState;

mod env;
mod http;
mod sql;
mod store;

pub(crate) use self::env::EnvCapability;
pub(crate) use self::http::HttpCapability;
pub(crate) use self::sql::SqlCapability;
pub(crate) use self::store::StoreCapability;

/// Cooperative cancellation for one script host.
///
/// Raising it makes the engine's progress hook terminate the current
/// evaluation; the resulting error is reported as [`Interrupted`].
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything a capability needs to wire itself into an interpreter.
pub struct CapabilityContext {
    pub(crate) shared: Arc<SharedState>,
    /// Handle of the worker runtime, captured so bindings running on
    /// blocking threads can issue async I/O.
    pub(crate) rt: Handle,
}

impl CapabilityContext {
    pub fn store(&self) -> &Arc<dyn crate::store::Store> {
        &self.shared.store
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.shared.client
    }

    /// Handle of the worker runtime. Bindings run on blocking threads and
    /// must `block_on` this handle for any async I/O.
    pub fn runtime(&self) -> &Handle {
        &self.rt
    }

    pub fn worker_name(&self) -> &str {
        &self.shared.config.worker_name
    }

    pub fn cluster(&self) -> &str {
        self.shared.keys.cluster()
    }
}

/// One entry of the capability bundle.
///
/// A capability registers its types and functions on the engine and pushes
/// its binding object into the scope, before the first evaluation. The
/// default bundle covers the store, outbound HTTP, SQL, the process
/// environment and worker identity; embedders can append their own through
/// the worker builder.
pub trait Capability: Send + Sync {
    /// Name used in error messages when installation fails.
    fn name(&self) -> &str;

    fn install(
        &self,
        engine: &mut Engine,
        scope: &mut Scope<'static>,
        ctx: &CapabilityContext,
    ) -> anyhow::Result<()>;
}

pub(crate) fn default_capabilities() -> Vec<Box<dyn Capability>> {
    vec![
        Box::new(StoreCapability),
        Box::new(HttpCapability),
        Box::new(SqlCapability),
        Box::new(EnvCapability),
        Box::new(WorkerCapability),
    ]
}

struct Inner {
    engine: Engine,
    scope: Mutex<Scope<'static>>,
    /// Function definitions of the loaded source, kept for lifecycle hooks.
    ast: Mutex<Option<AST>>,
    interrupt: Interrupt,
}

/// One task's interpreter instance. Cloning is cheap and shares the
/// underlying engine and scope.
#[derive(Clone)]
pub struct ScriptHost {
    inner: Arc<Inner>,
}

impl ScriptHost {
    /// Create a host with the worker's capability bundle installed.
    pub(crate) fn new(shared: &Arc<SharedState>, interrupt: Interrupt) -> anyhow::Result<Self> {
        let mut engine = Engine::new();

        let flag = interrupt.clone();
        engine.on_progress(move |_| flag.is_raised().then(|| Dynamic::UNIT));

        let mut scope = Scope::new();
        let ctx = CapabilityContext {
            shared: shared.clone(),
            rt: Handle::current(),
        };

        for capability in shared.capabilities.iter() {
            capability
                .install(&mut engine, &mut scope, &ctx)
                .with_context(|| format!("failed to install capability `{}`", capability.name()))?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                engine,
                scope: Mutex::new(scope),
                ast: Mutex::new(None),
                interrupt,
            }),
        })
    }

    pub(crate) fn interrupt(&self) -> &Interrupt {
        &self.inner.interrupt
    }

    /// Access the engine to register per-task bindings. Only valid before the
    /// host has been cloned for an evaluation.
    pub(crate) fn engine_mut(&mut self) -> &mut Engine {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("per-task bindings must be installed before the host is shared");
        &mut inner.engine
    }

    /// Push a per-task binding object into the scope. Same uniqueness rule as
    /// [`ScriptHost::engine_mut`].
    pub(crate) fn push_binding(
        &mut self,
        name: &str,
        value: impl rhai::Variant + Clone + Send + Sync,
    ) {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("per-task bindings must be installed before the host is shared");
        inner.scope.get_mut().push(name.to_owned(), value);
    }

    /// Load the task source: compile, evaluate the top level once, and retain
    /// the function definitions for later hook calls.
    fn load_sync(&self, source: &str) -> anyhow::Result<()> {
        let ast = self
            .inner
            .engine
            .compile(source)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let mut scope = self.inner.scope.lock();
        self.inner
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(map_eval_error)?;
        drop(scope);

        *self.inner.ast.lock() = Some(ast.clone_functions_only());
        Ok(())
    }

    /// Evaluate a standalone snippet against the persistent scope. Endpoint
    /// template blocks use this.
    fn eval_sync(&self, code: &str) -> anyhow::Result<()> {
        let mut scope = self.inner.scope.lock();
        self.inner
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, code)
            .map(|_| ())
            .map_err(map_eval_error)
    }

    /// Call a lifecycle hook if the loaded source defines it.
    fn call_sync(&self, hook: &str) -> anyhow::Result<()> {
        let ast = self.inner.ast.lock();
        let Some(ast) = ast.as_ref() else {
            return Ok(());
        };
        if !ast.iter_functions().any(|f| f.name == hook) {
            return Ok(());
        }

        let mut scope = self.inner.scope.lock();
        self.inner
            .engine
            .call_fn::<Dynamic>(&mut scope, ast, hook, ())
            .map(|_| ())
            .map_err(map_eval_error)
    }

    /// Run `load_sync` on a blocking thread.
    pub(crate) async fn load(&self, source: String) -> anyhow::Result<()> {
        let host = self.clone();
        offload(move || host.load_sync(&source)).await
    }

    /// Run `eval_sync` on a blocking thread.
    pub(crate) async fn eval(&self, code: String) -> anyhow::Result<()> {
        let host = self.clone();
        offload(move || host.eval_sync(&code)).await
    }

    /// Run `call_sync` on a blocking thread.
    pub(crate) async fn call(&self, hook: &'static str) -> anyhow::Result<()> {
        let host = self.clone();
        offload(move || host.call_sync(hook)).await
    }
}

/// Run a script operation on a blocking thread, containing panics to the
/// task.
async fn offload<F>(op: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result,
        Err(join_error) => match join_error.try_into_panic() {
            Ok(payload) => {
                let message: &str = if let Some(message) = payload.downcast_ref::<String>() {
                    message
                } else if let Some(message) = payload.downcast_ref::<&str>() {
                    message
                } else {
                    "Box<dyn Any>"
                };
                Err(anyhow::anyhow!("script panicked: {message}"))
            }
            Err(e) => Err(anyhow::anyhow!(e)),
        },
    }
}

fn map_eval_error(error: Box<EvalAltResult>) -> anyhow::Error {
    if matches!(*error, EvalAltResult::ErrorTerminated(..)) {
        anyhow::Error::new(Interrupted)
    } else {
        anyhow::anyhow!("{error}")
    }
}

/// Exposes the worker's identity to scripts as `worker`.
pub(crate) struct WorkerCapability;

#[derive(Clone)]
struct WorkerApi {
    name: String,
    cluster: String,
    shutdown: ShutdownFlag,
}

impl Capability for WorkerCapability {
    fn name(&self) -> &str {
        "worker"
    }

    fn install(
        &self,
        engine: &mut Engine,
        scope: &mut Scope<'static>,
        ctx: &CapabilityContext,
    ) -> anyhow::Result<()> {
        engine.register_type_with_name::<WorkerApi>("Worker");
        engine.register_get("Name", |api: &mut WorkerApi| api.name.clone());
        engine.register_get("Cluster", |api: &mut WorkerApi| api.cluster.clone());
        engine.register_fn("ShuttingDown", |api: &mut WorkerApi| {
            api.shutdown.is_raised()
        });

        scope.push(
            "worker",
            WorkerApi {
                name: ctx.shared.config.worker_name.clone(),
                cluster: ctx.shared.keys.cluster().to_owned(),
                shutdown: ctx.shared.shutdown.clone(),
            },
        );

        Ok(())
    }
}
