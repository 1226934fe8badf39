use std::sync::Once;

use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Scope};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Column, Row};
use tokio::runtime::Handle;

use super::{Capability, CapabilityContext};

/// Exposes SQL access to scripts as `sql`.
///
/// `sql.New(connection_string, driver)` opens a pooled connection; the
/// returned session offers `Ping`, `Close`, `Exec` and `Query`. Query rows
/// come back as column-name to value maps with byte columns converted to
/// strings. Like the HTTP capability, per-statement failures are logged and
/// reported as empty results instead of crashing the task.
pub(crate) struct SqlCapability;

fn ensure_drivers() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(sqlx::any::install_default_drivers);
}

#[derive(Clone)]
struct SqlApi {
    rt: Handle,
}

impl SqlApi {
    fn new_session(
        &self,
        connection: String,
        driver: String,
    ) -> Result<SqlSession, Box<EvalAltResult>> {
        ensure_drivers();

        // The driver name becomes the URL scheme when the connection string
        // does not already carry one.
        let url = if connection.contains("://") {
            connection
        } else {
            format!("{driver}://{connection}")
        };

        let pool = self
            .rt
            .block_on(AnyPool::connect(&url))
            .map_err(|e| -> Box<EvalAltResult> { format!("failed to open database: {e}").into() })?;

        Ok(SqlSession {
            pool,
            rt: self.rt.clone(),
        })
    }
}

#[derive(Clone)]
struct SqlSession {
    pool: AnyPool,
    rt: Handle,
}

impl SqlSession {
    fn ping(&self) -> bool {
        match self.rt.block_on(sqlx::query("SELECT 1").execute(&self.pool)) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("database ping failed: {e}");
                false
            }
        }
    }

    fn close(&self) {
        self.rt.block_on(self.pool.close());
    }

    fn exec(&self, statement: &str, binds: &[Dynamic]) -> Dynamic {
        let mut query = sqlx::query(statement);
        for value in binds {
            query = bind(query, value);
        }

        match self.rt.block_on(query.execute(&self.pool)) {
            Ok(result) => Dynamic::from(result.rows_affected() as i64),
            Err(e) => {
                tracing::warn!("failed to execute statement: {e}");
                Dynamic::UNIT
            }
        }
    }

    fn query(&self, statement: &str, binds: &[Dynamic]) -> Array {
        let mut query = sqlx::query(statement);
        for value in binds {
            query = bind(query, value);
        }

        let rows = match self.rt.block_on(query.fetch_all(&self.pool)) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("failed to query database: {e}");
                return Array::new();
            }
        };

        rows.iter()
            .map(|row| {
                let mut map = Map::new();
                for (index, column) in row.columns().iter().enumerate() {
                    map.insert(column.name().into(), decode(row, index));
                }
                Dynamic::from(map)
            })
            .collect()
    }
}

type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>;

fn bind<'q>(query: AnyQuery<'q>, value: &Dynamic) -> AnyQuery<'q> {
    if let Some(v) = value.clone().try_cast::<i64>() {
        query.bind(v)
    } else if let Some(v) = value.clone().try_cast::<f64>() {
        query.bind(v)
    } else if let Some(v) = value.clone().try_cast::<bool>() {
        query.bind(v)
    } else {
        query.bind(value.to_string())
    }
}

fn decode(row: &AnyRow, index: usize) -> Dynamic {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Dynamic::from).unwrap_or(Dynamic::UNIT);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(Dynamic::from).unwrap_or(Dynamic::UNIT);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(Dynamic::from).unwrap_or(Dynamic::UNIT);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Dynamic::from).unwrap_or(Dynamic::UNIT);
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return value
            .map(|bytes| Dynamic::from(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Dynamic::UNIT);
    }
    Dynamic::UNIT
}

impl Capability for SqlCapability {
    fn name(&self) -> &str {
        "sql"
    }

    fn install(
        &self,
        engine: &mut Engine,
        scope: &mut Scope<'static>,
        ctx: &CapabilityContext,
    ) -> anyhow::Result<()> {
        engine.register_type_with_name::<SqlApi>("Sql");
        engine.register_type_with_name::<SqlSession>("SqlSession");

        engine.register_fn(
            "New",
            |api: &mut SqlApi, connection: String, driver: String| {
                api.new_session(connection, driver)
            },
        );

        engine.register_fn("Ping", |session: &mut SqlSession| session.ping());
        engine.register_fn("Close", |session: &mut SqlSession| session.close());
        engine.register_fn("Exec", |session: &mut SqlSession, statement: String| {
            session.exec(&statement, &[])
        });
        engine.register_fn(
            "Exec",
            |session: &mut SqlSession, statement: String, binds: Array| {
                session.exec(&statement, &binds)
            },
        );
        engine.register_fn("Query", |session: &mut SqlSession, statement: String| {
            session.query(&statement, &[])
        });
        engine.register_fn(
            "Query",
            |session: &mut SqlSession, statement: String, binds: Array| {
                session.query(&statement, &binds)
            },
        );

        scope.push("sql", SqlApi { rt: ctx.rt.clone() });

        Ok(())
    }
}
