use rhai::{Dynamic, Engine, Scope};

use super::{Capability, CapabilityContext};

/// Exposes the process environment to scripts as `env`.
///
/// `Get` of an unset variable returns unit. Calls with missing required
/// parameters fail at function resolution, which scripts observe as an
/// ordinary error.
pub(crate) struct EnvCapability;

#[derive(Clone)]
struct EnvApi;

impl Capability for EnvCapability {
    fn name(&self) -> &str {
        "env"
    }

    fn install(
        &self,
        engine: &mut Engine,
        scope: &mut Scope<'static>,
        _ctx: &CapabilityContext,
    ) -> anyhow::Result<()> {
        engine.register_type_with_name::<EnvApi>("Env");

        engine.register_fn("Get", |_: &mut EnvApi, name: String| {
            match std::env::var(&name) {
                Ok(value) => Dynamic::from(value),
                Err(_) => Dynamic::UNIT,
            }
        });
        engine.register_fn("Set", |_: &mut EnvApi, name: String, value: String| {
            std::env::set_var(name, value);
        });
        engine.register_fn("Unset", |_: &mut EnvApi, name: String| {
            std::env::remove_var(name);
        });

        scope.push("env", EnvApi);

        Ok(())
    }
}
