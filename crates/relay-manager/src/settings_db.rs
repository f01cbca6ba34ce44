//! SQLite-backed [`SettingsStore`].
//!
//! One key/value table, values JSON-encoded. Missing keys read as defaults.
//! Each setter writes through to the database before notifying watchers.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::RelayError;
use crate::ports::{SettingsStore, DEFAULT_SYNC_INTERVAL};
use crate::types::NodeId;

const KEY_AUTO_SELECT: &str = "relay.auto_select_enabled";
const KEY_MANUAL_NODE: &str = "relay.manual_node_id";
const KEY_LAST_SYNC: &str = "relay.last_sync_timestamp";
const KEY_SYNC_INTERVAL: &str = "relay.sync_interval_secs";

pub struct SqliteSettingsStore {
    conn: Mutex<Connection>,
    auto_select: watch::Sender<bool>,
    manual_node_id: watch::Sender<Option<NodeId>>,
    last_sync: watch::Sender<Option<u64>>,
    sync_interval: watch::Sender<Duration>,
}

impl SqliteSettingsStore {
    /// Open (or create) the settings database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, RelayError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );",
        )?;

        let auto_select = read::<bool>(&conn, KEY_AUTO_SELECT)?.unwrap_or(true);
        let manual_node_id = read::<NodeId>(&conn, KEY_MANUAL_NODE)?;
        let last_sync = read::<u64>(&conn, KEY_LAST_SYNC)?;
        let sync_interval = read::<u64>(&conn, KEY_SYNC_INTERVAL)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SYNC_INTERVAL);

        Ok(Self {
            conn: Mutex::new(conn),
            auto_select: watch::channel(auto_select).0,
            manual_node_id: watch::channel(manual_node_id).0,
            last_sync: watch::channel(last_sync).0,
            sync_interval: watch::channel(sync_interval).0,
        })
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RelayError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        read(&conn, key)
    }

    fn put<T: Serialize>(&self, key: &str, value: Option<&T>) -> Result<(), RelayError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match value {
            Some(value) => {
                let encoded = serde_json::to_string(value)?;
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, encoded],
                )?;
            }
            None => {
                conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
            }
        }
        tracing::trace!(key, "setting written");
        Ok(())
    }
}

fn read<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>, RelayError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

#[async_trait::async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn auto_select_enabled(&self) -> Result<bool, RelayError> {
        Ok(self.get(KEY_AUTO_SELECT)?.unwrap_or(true))
    }

    fn watch_auto_select_enabled(&self) -> watch::Receiver<bool> {
        self.auto_select.subscribe()
    }

    async fn set_auto_select_enabled(&self, enabled: bool) -> Result<(), RelayError> {
        self.put(KEY_AUTO_SELECT, Some(&enabled))?;
        self.auto_select.send_replace(enabled);
        Ok(())
    }

    async fn manual_node_id(&self) -> Result<Option<NodeId>, RelayError> {
        self.get(KEY_MANUAL_NODE)
    }

    fn watch_manual_node_id(&self) -> watch::Receiver<Option<NodeId>> {
        self.manual_node_id.subscribe()
    }

    async fn set_manual_node_id(&self, node_id: Option<NodeId>) -> Result<(), RelayError> {
        self.put(KEY_MANUAL_NODE, node_id.as_ref())?;
        self.manual_node_id.send_replace(node_id);
        Ok(())
    }

    async fn last_sync_timestamp(&self) -> Result<Option<u64>, RelayError> {
        self.get(KEY_LAST_SYNC)
    }

    fn watch_last_sync_timestamp(&self) -> watch::Receiver<Option<u64>> {
        self.last_sync.subscribe()
    }

    async fn set_last_sync_timestamp(&self, timestamp_ms: u64) -> Result<(), RelayError> {
        self.put(KEY_LAST_SYNC, Some(&timestamp_ms))?;
        self.last_sync.send_replace(Some(timestamp_ms));
        Ok(())
    }

    async fn sync_interval(&self) -> Result<Duration, RelayError> {
        Ok(self
            .get::<u64>(KEY_SYNC_INTERVAL)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SYNC_INTERVAL))
    }

    fn watch_sync_interval(&self) -> watch::Receiver<Duration> {
        self.sync_interval.subscribe()
    }

    async fn set_sync_interval(&self, interval: Duration) -> Result<(), RelayError> {
        self.put(KEY_SYNC_INTERVAL, Some(&interval.as_secs()))?;
        self.sync_interval.send_replace(interval);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NODE_ID_LEN;

    #[tokio::test]
    async fn defaults_when_empty() {
        let store = SqliteSettingsStore::open_in_memory().unwrap();
        assert!(store.auto_select_enabled().await.unwrap());
        assert_eq!(store.manual_node_id().await.unwrap(), None);
        assert_eq!(store.last_sync_timestamp().await.unwrap(), None);
        assert_eq!(store.sync_interval().await.unwrap(), DEFAULT_SYNC_INTERVAL);
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.db");
        let node = NodeId::from_bytes([0x5a; NODE_ID_LEN]);

        {
            let store = SqliteSettingsStore::open(&path).unwrap();
            store.set_auto_select_enabled(false).await.unwrap();
            store.set_manual_node_id(Some(node)).await.unwrap();
            store
                .set_last_sync_timestamp(1_700_000_000_000)
                .await
                .unwrap();
            store
                .set_sync_interval(Duration::from_secs(900))
                .await
                .unwrap();
        }

        let store = SqliteSettingsStore::open(&path).unwrap();
        assert!(!store.auto_select_enabled().await.unwrap());
        assert_eq!(store.manual_node_id().await.unwrap(), Some(node));
        assert_eq!(
            store.last_sync_timestamp().await.unwrap(),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            store.sync_interval().await.unwrap(),
            Duration::from_secs(900)
        );
        assert_eq!(*store.watch_manual_node_id().borrow(), Some(node));
    }

    #[tokio::test]
    async fn clearing_manual_node_removes_row() {
        let store = SqliteSettingsStore::open_in_memory().unwrap();
        let node = NodeId::from_bytes([1; NODE_ID_LEN]);
        store.set_manual_node_id(Some(node)).await.unwrap();
        store.set_manual_node_id(None).await.unwrap();
        assert_eq!(store.manual_node_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn setter_notifies_watchers() {
        let store = SqliteSettingsStore::open_in_memory().unwrap();
        let mut rx = store.watch_auto_select_enabled();
        store.set_auto_select_enabled(false).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn corrupt_value_is_a_settings_error() {
        let store = SqliteSettingsStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)",
                params![KEY_LAST_SYNC, "\"not a number\""],
            )
            .unwrap();
        }
        assert!(matches!(
            store.last_sync_timestamp().await,
            Err(RelayError::Settings(_))
        ));
    }
}
