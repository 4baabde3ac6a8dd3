//! Chunk store: SQLite table of chunk records keyed by (file id, order), insert-if-absent.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chunkpod_core::identity::{checksum_from_hex, checksum_to_hex};
use chunkpod_core::{ChunkRecord, FileId, Node};
use rusqlite::{params, Connection, OptionalExtension, Row};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS file_chunks (
    file_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    size INTEGER NOT NULL,
    chunk_order INTEGER NOT NULL,
    num_chunks INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    next_ip TEXT,
    next_port INTEGER,
    data BLOB NOT NULL,
    PRIMARY KEY (file_id, chunk_order)
);";

const SELECT_COLUMNS: &str =
    "SELECT file_id, file_name, size, chunk_order, num_chunks, checksum, next_ip, next_port, data FROM file_chunks";

/// Summary of one file held locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub file_id: FileId,
    pub file_name: String,
    pub num_chunks: u16,
    pub chunks_held: usize,
}

/// Shared handle; SQLite calls run on the blocking pool.
#[derive(Clone)]
pub struct ChunkStore {
    conn: Arc<Mutex<Connection>>,
}

impl ChunkStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await?
    }

    /// Insert a chunk unless (file id, order) already exists. Returns true if a row was added;
    /// an existing row is never overwritten.
    pub async fn insert(&self, chunk: ChunkRecord) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO file_chunks
                 (file_id, file_name, size, chunk_order, num_chunks, checksum, next_ip, next_port, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    chunk.file_id.to_hex(),
                    chunk.file_name,
                    chunk.size(),
                    chunk.order,
                    chunk.num_chunks,
                    checksum_to_hex(&chunk.file_checksum),
                    chunk.next_node.ip.to_string(),
                    chunk.next_node.port,
                    chunk.data,
                ],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Every stored chunk of `file_id`, ascending by order.
    pub async fn chunks_for_file(&self, file_id: FileId) -> Result<Vec<ChunkRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE file_id = ?1 ORDER BY chunk_order"
            ))?;
            let rows = stmt.query_map(params![file_id.to_hex()], read_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row_to_chunk(row?)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn chunk(
        &self,
        file_id: FileId,
        order: u16,
    ) -> Result<Option<ChunkRecord>, StoreError> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE file_id = ?1 AND chunk_order = ?2"),
                    params![file_id.to_hex(), order],
                    read_row,
                )
                .optional()?;
            row.map(row_to_chunk).transpose()
        })
        .await
    }

    pub async fn stored_files(&self) -> Result<Vec<StoredFile>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT file_id, MIN(file_name), MAX(num_chunks), COUNT(*)
                 FROM file_chunks GROUP BY file_id ORDER BY MIN(file_name)",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u16>(2)?,
                    row.get::<_, usize>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (file_id, file_name, num_chunks, chunks_held) = row?;
                out.push(StoredFile {
                    file_id: parse_file_id(&file_id)?,
                    file_name,
                    num_chunks,
                    chunks_held,
                });
            }
            Ok(out)
        })
        .await
    }
}

struct RawRow {
    file_id: String,
    file_name: String,
    size: u16,
    order: u16,
    num_chunks: u16,
    checksum: String,
    next_ip: Option<String>,
    next_port: Option<u16>,
    data: Vec<u8>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        file_id: row.get(0)?,
        file_name: row.get(1)?,
        size: row.get(2)?,
        order: row.get(3)?,
        num_chunks: row.get(4)?,
        checksum: row.get(5)?,
        next_ip: row.get(6)?,
        next_port: row.get(7)?,
        data: row.get(8)?,
    })
}

fn parse_file_id(s: &str) -> Result<FileId, StoreError> {
    FileId::from_hex(s.as_bytes()).map_err(|e| StoreError::Corrupt(format!("file_id: {e}")))
}

fn row_to_chunk(raw: RawRow) -> Result<ChunkRecord, StoreError> {
    if raw.data.len() != raw.size as usize {
        return Err(StoreError::Corrupt(format!(
            "size {} but {} data bytes",
            raw.size,
            raw.data.len()
        )));
    }
    let next_node = match (raw.next_ip, raw.next_port) {
        (Some(ip), Some(port)) => {
            let ip: Ipv4Addr = ip
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("next_ip {ip:?}")))?;
            Node::new(ip, port)
        }
        _ => Node::NULL,
    };
    Ok(ChunkRecord {
        file_id: parse_file_id(&raw.file_id)?,
        order: raw.order,
        num_chunks: raw.num_chunks,
        file_checksum: checksum_from_hex(raw.checksum.as_bytes())
            .map_err(|e| StoreError::Corrupt(format!("checksum: {e}")))?,
        next_node,
        file_name: raw.file_name,
        data: raw.data,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
