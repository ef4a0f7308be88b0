use anyhow::Context;
use log::{info, warn};
use redis::FromRedisValue;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Collection, DedupKey, Store};

/// Redis-backed store.
///
/// KEY LAYOUT (all keys prefixed with the configured database name):
/// - `{db}:config:tracked_clans`         SET of clan tags
/// - `{db}:{collection}:{entity}`        LIST of appended snapshots
/// - `{db}:{collection}:{entity}:keyed`  HASH natural timestamp → record
/// - `{db}:{collection}`                 HASH composite key → record
///
/// History inserts use HSETNX, so the existence check and the write
/// are a single atomic command.
///
/// The multiplexed connection is opened on first use and shared by
/// every caller. A failed command discards it, so a restarted server
/// is picked up again by the next command. [`Store::close`] drops it.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    pub fn new(url: &str, database: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("invalid store URL {url}"))?;
        Ok(Self {
            client,
            prefix: database.to_string(),
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> anyhow::Result<MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("connecting to store")?;
        info!("store connected (namespace '{}')", self.prefix);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Runs one command on the shared connection. Any failure drops the
    /// cached connection so the next command reconnects.
    async fn query<T, F>(&self, cmd: &redis::Cmd, what: F) -> anyhow::Result<T>
    where
        T: FromRedisValue,
        F: FnOnce() -> String,
    {
        let mut conn = self.connection().await?;
        match cmd.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if self.conn.lock().await.take().is_some() {
                    warn!("store command failed, reconnecting on next use: {}", e);
                }
                Err(anyhow::Error::new(e).context(what()))
            }
        }
    }

    fn tracked_key(&self) -> String {
        format!("{}:config:tracked_clans", self.prefix)
    }

    fn list_key(&self, collection: Collection, entity: &str) -> String {
        format!("{}:{}:{}", self.prefix, collection, entity)
    }

    fn keyed_key(&self, collection: Collection, entity: &str) -> String {
        format!("{}:{}:{}:keyed", self.prefix, collection, entity)
    }

    fn hash_key(&self, collection: Collection) -> String {
        format!("{}:{}", self.prefix, collection)
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn tracked_entities(&self) -> anyhow::Result<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(self.tracked_key());
        let mut tags: Vec<String> = self.query(&cmd, || "SMEMBERS tracked clans".to_string()).await?;
        tags.sort();
        Ok(tags)
    }

    async fn track_entity(&self, tag: &str) -> anyhow::Result<bool> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(self.tracked_key()).arg(tag);
        let added: i64 = self.query(&cmd, || format!("SADD tracked clan {tag}")).await?;
        Ok(added > 0)
    }

    async fn append(&self, collection: Collection, entity: &str, record: &Value) -> anyhow::Result<()> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(self.list_key(collection, entity))
            .arg(serde_json::to_string(record)?);
        let _: i64 = self.query(&cmd, || format!("RPUSH {collection} {entity}")).await?;
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        collection: Collection,
        key: &DedupKey,
        record: &Value,
    ) -> anyhow::Result<bool> {
        let mut cmd = redis::cmd("HSETNX");
        cmd.arg(self.keyed_key(collection, &key.entity))
            .arg(&key.natural_ts)
            .arg(serde_json::to_string(record)?);
        let inserted: i64 = self.query(&cmd, || format!("HSETNX {collection} {key}")).await?;
        Ok(inserted == 1)
    }

    async fn upsert(&self, collection: Collection, key: &str, record: &Value) -> anyhow::Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.hash_key(collection))
            .arg(key)
            .arg(serde_json::to_string(record)?);
        let _: i64 = self.query(&cmd, || format!("HSET {collection} {key}")).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            info!("store connection released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    /// Reads one RESP command array.
    async fn read_command<R: AsyncBufReadExt + AsyncReadExt + Unpin>(reader: &mut R) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let n: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

        let mut args = Vec::with_capacity(n);
        for _ in 0..n {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(String::from_utf8(buf).ok()?);
        }
        Some(args)
    }

    /// Minimal server: tracks one clan and acknowledges everything else.
    /// Hangs up without answering when it sees `hang_up_on`.
    async fn serve(stream: TcpStream, hang_up_on: Option<&str>) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        while let Some(args) = read_command(&mut reader).await {
            let name = args[0].to_ascii_uppercase();
            if hang_up_on == Some(name.as_str()) {
                return;
            }
            let reply: &[u8] = match name.as_str() {
                "SMEMBERS" => &b"*1\r\n$2\r\n#A\r\n"[..],
                "SADD" | "RPUSH" | "HSETNX" | "HSET" => &b":1\r\n"[..],
                "PING" => &b"+PONG\r\n"[..],
                _ => &b"+OK\r\n"[..],
            };
            if write.write_all(reply).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn broken_connection_is_replaced_on_next_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            serve(first, Some("SMEMBERS")).await;
            let (second, _) = listener.accept().await.unwrap();
            serve(second, None).await;
        });

        let store = RedisStore::new(&format!("redis://127.0.0.1:{port}"), "coc").unwrap();

        assert!(store.tracked_entities().await.is_err());
        assert!(store.conn.lock().await.is_none());

        assert_eq!(store.tracked_entities().await.unwrap(), vec!["#A"]);
        assert!(store.track_entity("#B").await.unwrap());
    }

    #[test]
    fn keys_are_namespaced_by_database() {
        let store = RedisStore::new("redis://127.0.0.1:6379", "research").unwrap();

        assert_eq!(store.tracked_key(), "research:config:tracked_clans");
        assert_eq!(
            store.list_key(Collection::PlayersHistory, "#P1"),
            "research:players_history:#P1"
        );
        assert_eq!(
            store.keyed_key(Collection::WarsHistory, "#C"),
            "research:wars_history:#C:keyed"
        );
        assert_eq!(store.hash_key(Collection::WarAttacks), "research:war_attacks");
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(RedisStore::new("not a url", "db").is_err());
    }
}
