use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CommandReply, Store};

/// [`Store`] backed by a redis deployment.
///
/// All operations go through a [`ConnectionManager`], which transparently
/// reconnects after transient failures; individual command errors still
/// surface so callers can skip the affected iteration.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `address` (`host:port`) and verify the connection.
    pub async fn connect(address: &str, password: &str) -> anyhow::Result<Self> {
        let url = if password.is_empty() {
            format!("redis://{address}/")
        } else {
            format!("redis://:{password}@{address}/")
        };

        let client = redis::Client::open(url).context("invalid redis address")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        anyhow::ensure!(reply == "PONG", "unexpected ping reply: {reply}");
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let reply: Option<(String, String)> = conn.blpop(key, timeout.as_secs_f64()).await?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn command(&self, args: &[String]) -> anyhow::Result<CommandReply> {
        let (name, rest) = args.split_first().context("empty store command")?;

        let mut cmd = redis::cmd(name);
        for arg in rest {
            cmd.arg(arg);
        }

        let mut conn = self.conn.clone();
        let value: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(convert(value))
    }
}

fn convert(value: redis::Value) -> CommandReply {
    match value {
        redis::Value::Nil => CommandReply::Nil,
        redis::Value::Int(v) => CommandReply::Int(v),
        redis::Value::Okay => CommandReply::Text("OK".to_owned()),
        redis::Value::SimpleString(v) => CommandReply::Text(v),
        redis::Value::BulkString(v) => CommandReply::Text(String::from_utf8_lossy(&v).into_owned()),
        redis::Value::Double(v) => CommandReply::Text(v.to_string()),
        redis::Value::Boolean(v) => CommandReply::Int(v as i64),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            CommandReply::List(items.into_iter().map(convert).collect())
        }
        redis::Value::Map(pairs) => CommandReply::List(
            pairs
                .into_iter()
                .flat_map(|(k, v)| [convert(k), convert(v)])
                .collect(),
        ),
        other => CommandReply::Text(format!("{other:?}")),
    }
}
