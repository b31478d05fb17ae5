use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::membership::NodeInfo;
use crate::{lock_or_err, map_db_err, unix_timestamp, DfsError, DfsResult};

/// Persisted identity of one data node. `id` is assigned once by the store and never changes
/// for a given `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u64,
    pub node_id: String,
    pub info: NodeInfo,
    pub create_at: u64,
    pub update_at: u64,
}

/// Small record store remembering data nodes across restarts, keyed by the opaque node id.
pub trait NodeRecordStore: Send + Sync {
    /// Insert a new record and return its numeric id.
    fn add(&self, node_id: &str, info: &NodeInfo) -> DfsResult<u64>;
    fn update(&self, node_id: &str, info: &NodeInfo) -> DfsResult<()>;
    fn get(&self, node_id: &str) -> DfsResult<Option<NodeRecord>>;
    /// All records, ordered by numeric id.
    fn list(&self) -> DfsResult<Vec<NodeRecord>>;
    fn delete(&self, node_id: &str) -> DfsResult<bool>;
}

pub struct SqliteNodeStore {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteNodeStore {
    pub fn new(db_path: impl Into<String>) -> DfsResult<Self> {
        let db_path = db_path.into();
        debug!("SqliteNodeStore: open db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("SqliteNodeStore: open db failed! {}", e);
            map_db_err(e)
        })?;
        Self::with_connection(db_path, conn)
    }

    pub fn open_in_memory() -> DfsResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_db_err)?;
        Self::with_connection(":memory:".to_string(), conn)
    }

    fn with_connection(db_path: String, conn: Connection) -> DfsResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS data_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL UNIQUE,
                info TEXT NOT NULL,
                create_at INTEGER NOT NULL,
                update_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            warn!("SqliteNodeStore: create table data_nodes failed! {}", e);
            map_db_err(e)
        })?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    fn encode_info(info: &NodeInfo) -> DfsResult<String> {
        serde_json::to_string(info).map_err(|e| DfsError::DecodeError(e.to_string()))
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, i64, i64)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn to_record(raw: (i64, String, String, i64, i64)) -> DfsResult<NodeRecord> {
        let (id, node_id, info, create_at, update_at) = raw;
        let info: NodeInfo = serde_json::from_str(&info)
            .map_err(|e| DfsError::DecodeError(format!("node {} info: {}", node_id, e)))?;
        Ok(NodeRecord {
            id: id as u64,
            node_id,
            info,
            create_at: create_at as u64,
            update_at: update_at as u64,
        })
    }
}

impl NodeRecordStore for SqliteNodeStore {
    fn add(&self, node_id: &str, info: &NodeInfo) -> DfsResult<u64> {
        let info_str = Self::encode_info(info)?;
        let now = unix_timestamp() as i64;
        let conn = lock_or_err(&self.conn, "node store")?;
        conn.execute(
            "INSERT INTO data_nodes (node_id, info, create_at, update_at) VALUES (?1, ?2, ?3, ?3)",
            params![node_id, info_str, now],
        )
        .map_err(map_db_err)?;
        let id = conn.last_insert_rowid() as u64;
        debug!("SqliteNodeStore: add data node {} as id {}", node_id, id);
        Ok(id)
    }

    fn update(&self, node_id: &str, info: &NodeInfo) -> DfsResult<()> {
        let info_str = Self::encode_info(info)?;
        let conn = lock_or_err(&self.conn, "node store")?;
        let changed = conn
            .execute(
                "UPDATE data_nodes SET info = ?1, update_at = ?2 WHERE node_id = ?3",
                params![info_str, unix_timestamp() as i64, node_id],
            )
            .map_err(map_db_err)?;
        if changed == 0 {
            return Err(DfsError::DbError(format!("data node {} not found", node_id)));
        }
        Ok(())
    }

    fn get(&self, node_id: &str) -> DfsResult<Option<NodeRecord>> {
        let conn = lock_or_err(&self.conn, "node store")?;
        let raw = conn
            .query_row(
                "SELECT id, node_id, info, create_at, update_at FROM data_nodes WHERE node_id = ?1",
                params![node_id],
                Self::parse_row,
            )
            .optional()
            .map_err(map_db_err)?;
        raw.map(Self::to_record).transpose()
    }

    fn list(&self) -> DfsResult<Vec<NodeRecord>> {
        let conn = lock_or_err(&self.conn, "node store")?;
        let mut stmt = conn
            .prepare("SELECT id, node_id, info, create_at, update_at FROM data_nodes ORDER BY id")
            .map_err(map_db_err)?;
        let rows = stmt.query_map([], Self::parse_row).map_err(map_db_err)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(Self::to_record(raw.map_err(map_db_err)?)?);
        }
        Ok(records)
    }

    fn delete(&self, node_id: &str) -> DfsResult<bool> {
        let conn = lock_or_err(&self.conn, "node store")?;
        let changed = conn
            .execute("DELETE FROM data_nodes WHERE node_id = ?1", params![node_id])
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }
}
