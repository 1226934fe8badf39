use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{CommandReply, Store};

/// An in-process [`Store`] with redis-shaped semantics.
///
/// Implements the hash, key and list surface the runtime needs plus the small
/// command subset scripts commonly issue. Intended for tests and single
/// process embedding; it is not a persistence layer.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
}

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to a list, waking any blocked `blpop` callers.
    pub fn push_back(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock();
        inner
            .lists
            .entry(key.to_owned())
            .or_default()
            .push_back(value.to_owned());
        drop(inner);
        self.pushed.notify_waiters();
    }

    fn pop_front(&self, key: &str) -> Option<String> {
        self.inner.lock().lists.get_mut(key)?.pop_front()
    }

    fn matches(pattern: &str, key: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .hashes
            .keys()
            .chain(inner.strings.keys())
            .chain(inner.lists.keys())
            .filter(|key| Self::matches(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> anyhow::Result<Option<String>> {
        // A zero timeout blocks until a value arrives.
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);

        loop {
            // Register before checking so a concurrent push is not missed.
            let pushed = self.pushed.notified();
            if let Some(value) = self.pop_front(key) {
                return Ok(Some(value));
            }

            match deadline {
                Some(deadline) => tokio::select! {
                    _ = pushed => {}
                    _ = tokio::time::sleep_until(deadline) => return Ok(None),
                },
                None => pushed.await,
            }
        }
    }

    async fn command(&self, args: &[String]) -> anyhow::Result<CommandReply> {
        let (name, rest) = args.split_first().context("empty store command")?;
        let name = name.to_ascii_uppercase();

        let arg = |index: usize| -> anyhow::Result<&str> {
            rest.get(index)
                .map(String::as_str)
                .with_context(|| format!("{name} is missing argument {index}"))
        };

        match name.as_str() {
            "PING" => Ok(CommandReply::Text("PONG".to_owned())),
            "GET" => {
                let inner = self.inner.lock();
                Ok(match inner.strings.get(arg(0)?) {
                    Some(value) => CommandReply::Text(value.clone()),
                    None => CommandReply::Nil,
                })
            }
            "SET" => {
                let (key, value) = (arg(0)?.to_owned(), arg(1)?.to_owned());
                self.inner.lock().strings.insert(key, value);
                Ok(CommandReply::Text("OK".to_owned()))
            }
            "DEL" => {
                let mut inner = self.inner.lock();
                let mut removed = 0;
                for key in rest {
                    if inner.strings.remove(key).is_some()
                        || inner.hashes.remove(key).is_some()
                        || inner.lists.remove(key).is_some()
                    {
                        removed += 1;
                    }
                }
                Ok(CommandReply::Int(removed))
            }
            "INCR" | "INCRBY" => {
                let key = arg(0)?.to_owned();
                let delta = if name == "INCR" {
                    1
                } else {
                    arg(1)?.parse::<i64>().context("INCRBY amount is not an integer")?
                };

                let mut inner = self.inner.lock();
                let slot = inner.strings.entry(key).or_insert_with(|| "0".to_owned());
                let value = slot
                    .parse::<i64>()
                    .context("value is not an integer")?
                    + delta;
                *slot = value.to_string();
                Ok(CommandReply::Int(value))
            }
            "LPUSH" | "RPUSH" => {
                let key = arg(0)?.to_owned();
                let mut inner = self.inner.lock();
                let list = inner.lists.entry(key).or_default();
                for value in &rest[1..] {
                    if name == "LPUSH" {
                        list.push_front(value.clone());
                    } else {
                        list.push_back(value.clone());
                    }
                }
                let len = list.len() as i64;
                drop(inner);
                self.pushed.notify_waiters();
                Ok(CommandReply::Int(len))
            }
            "LLEN" => {
                let inner = self.inner.lock();
                let len = inner.lists.get(arg(0)?).map_or(0, VecDeque::len);
                Ok(CommandReply::Int(len as i64))
            }
            "HGET" => Ok(match self.hget(arg(0)?, arg(1)?).await? {
                Some(value) => CommandReply::Text(value),
                None => CommandReply::Nil,
            }),
            "HSET" => {
                self.hset(arg(0)?, arg(1)?, arg(2)?).await?;
                Ok(CommandReply::Int(1))
            }
            other => anyhow::bail!("unsupported store command: {other}"),
        }
    }
}
