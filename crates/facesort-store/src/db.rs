//! Opening, validating and transacting on a folder database.

use crate::error::StoreError;
use crate::schema::{self, REQUIRED_TABLES, SCHEMA, SCHEMA_VERSION};
use facesort_core::Metric;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to one folder's database.
///
/// Many handles (and processes) may read concurrently; writes go through
/// `BEGIN IMMEDIATE` transactions so at most one writer holds the lock, and
/// only for the duration of a single update.
pub struct Database {
    pub(crate) conn: Connection,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open the database at `path`, creating it if absent.
    ///
    /// An existing database is integrity-checked; any failure is reported as
    /// [`StoreError::Corrupt`] and nothing is repaired.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mut db = Self { conn, path: path.to_path_buf() };
        db.prepare().map_err(|e| db.classify(e))?;
        Ok(db)
    }

    /// Open an existing database; never creates one.
    pub fn open_existing(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::Missing(path.to_path_buf()));
        }
        Self::open(path)
    }

    /// Delete the database at `path` (including WAL side files) and create an
    /// empty one in its place.
    pub fn rebuild(path: &Path) -> Result<Self, StoreError> {
        for suffix in ["", "-wal", "-shm"] {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            let file = PathBuf::from(name);
            if file.exists() {
                std::fs::remove_file(&file)?;
            }
        }
        tracing::warn!(path = %path.display(), "database removed for rebuild");
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn prepare(&mut self) -> Result<(), StoreError> {
        self.conn.busy_timeout(BUSY_TIMEOUT)?;
        self.conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        self.conn.execute("PRAGMA foreign_keys=ON;", [])?;

        let tables = self.table_names()?;
        if tables.is_empty() {
            self.initialize()?;
            tracing::info!(path = %self.path.display(), "created database");
            return Ok(());
        }
        self.check_integrity(&tables)
    }

    /// Map low-level corruption into [`StoreError::Corrupt`].
    fn classify(&self, err: StoreError) -> StoreError {
        match err {
            StoreError::Sqlite(ref e) if StoreError::is_corruption(e) => self.corrupt(e.to_string()),
            other => other,
        }
    }

    pub(crate) fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt { path: self.path.clone(), reason: reason.into() }
    }

    fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn initialize(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA)?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2), (?3, '1')",
            params![
                schema::META_SCHEMA_VERSION,
                SCHEMA_VERSION.to_string(),
                schema::META_NEXT_CLUSTER_ID
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn check_integrity(&self, tables: &[String]) -> Result<(), StoreError> {
        let verdict: String = self.conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
        if verdict != "ok" {
            return Err(self.corrupt(format!("quick_check: {verdict}")));
        }

        for required in REQUIRED_TABLES {
            if !tables.iter().any(|t| t == required) {
                return Err(self.corrupt(format!("missing table '{required}'")));
            }
        }

        let version = self
            .meta(schema::META_SCHEMA_VERSION)?
            .ok_or_else(|| self.corrupt("missing schema version"))?;
        if version != SCHEMA_VERSION.to_string() {
            return Err(self.corrupt(format!("unsupported schema version {version}")));
        }

        let next_id = self.next_cluster_id()?;
        let max_id: i64 = self.conn.query_row(
            "SELECT MAX(COALESCE((SELECT MAX(id) FROM clusters), 0),
                        COALESCE((SELECT MAX(alias_id) FROM cluster_aliases), 0))",
            [],
            |r| r.get(0),
        )?;
        if next_id <= max_id {
            return Err(self.corrupt(format!("cluster id counter {next_id} behind existing id {max_id}")));
        }

        let checks: [(&str, &str); 5] = [
            (
                "alias points at a missing cluster",
                "SELECT a.alias_id FROM cluster_aliases a
                 LEFT JOIN clusters c ON c.id = a.canonical_id WHERE c.id IS NULL LIMIT 1",
            ),
            (
                "alias id is still a live cluster",
                "SELECT a.alias_id FROM cluster_aliases a
                 JOIN clusters c ON c.id = a.alias_id LIMIT 1",
            ),
            (
                "observation references a missing cluster",
                "SELECT o.cluster_id FROM observations o
                 LEFT JOIN clusters c ON c.id = o.cluster_id WHERE c.id IS NULL LIMIT 1",
            ),
            (
                "label references a missing cluster",
                "SELECT l.cluster_id FROM labels l
                 LEFT JOIN clusters c ON c.id = l.cluster_id WHERE c.id IS NULL LIMIT 1",
            ),
            (
                "member count disagrees with observations",
                "SELECT c.id FROM clusters c
                 LEFT JOIN (SELECT cluster_id, COUNT(*) AS n FROM observations GROUP BY cluster_id) o
                   ON o.cluster_id = c.id
                 WHERE c.member_count != COALESCE(o.n, 0) LIMIT 1",
            ),
        ];
        for (problem, sql) in checks {
            let hit: Option<i64> = self.conn.query_row(sql, [], |r| r.get(0)).optional()?;
            if let Some(id) = hit {
                return Err(self.corrupt(format!("{problem} (id {id})")));
            }
        }

        if let Some(dim) = self.embedding_dim()? {
            let bytes = (dim * 4) as i64;
            let bad: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM clusters WHERE length(centroid) != ?1 LIMIT 1",
                    [bytes],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = bad {
                return Err(self.corrupt(format!("cluster {id} centroid is not {dim}-dimensional")));
            }
        }

        tracing::debug!(path = %self.path.display(), "database integrity ok");
        Ok(())
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// Commits only if `f` returns `Ok`; an error or a panic rolls back, so
    /// readers never observe a partial update.
    pub fn write_txn<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub(crate) fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        read_meta(&self.conn, key)
    }

    pub fn next_cluster_id(&self) -> Result<i64, StoreError> {
        let raw = self
            .meta(schema::META_NEXT_CLUSTER_ID)?
            .ok_or_else(|| self.corrupt("missing cluster id counter"))?;
        raw.parse()
            .map_err(|_| self.corrupt(format!("cluster id counter '{raw}' is not a number")))
    }

    /// Version of the cluster table. A writer that loaded clusters at one
    /// generation may only commit cluster rows while it is still current.
    pub fn cluster_generation(&self) -> Result<u64, StoreError> {
        read_generation(&self.conn)
    }

    pub fn embedding_dim(&self) -> Result<Option<usize>, StoreError> {
        match self.meta(schema::META_EMBEDDING_DIM)? {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| self.corrupt(format!("embedding dimension '{raw}' is not a number"))),
        }
    }

    /// Metric recorded for this database, if any scan has run.
    pub fn metric(&self) -> Result<Option<Metric>, StoreError> {
        match self.meta(schema::META_METRIC)? {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|e: String| self.corrupt(e)),
        }
    }

    pub fn model_version(&self) -> Result<Option<String>, StoreError> {
        self.meta(schema::META_MODEL_VERSION)
    }

    /// Bind this database to a model version and metric.
    ///
    /// The first call records them; later calls must match exactly, since
    /// embeddings from different models or metrics are not comparable.
    pub fn bind_model(&mut self, model_version: &str, metric: Metric) -> Result<(), StoreError> {
        let fields = [
            (schema::META_MODEL_VERSION, "model version", model_version),
            (schema::META_METRIC, "metric", metric.as_str()),
        ];
        self.write_txn(|tx| {
            for (key, field, current) in fields {
                match read_meta(tx, key)? {
                    Some(stored) if stored != current => {
                        return Err(StoreError::ModelMismatch {
                            field,
                            stored,
                            current: current.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => write_meta(tx, key, current)?,
                }
            }
            Ok(())
        })
    }
}

pub(crate) fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", [key], |r| r.get(0))
        .optional()?;
    Ok(value)
}

pub(crate) fn read_generation(conn: &Connection) -> Result<u64, StoreError> {
    match read_meta(conn, schema::META_CLUSTER_GENERATION)? {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            StoreError::Sqlite(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("cluster generation '{raw}'").into(),
            ))
        }),
    }
}

/// Advance the cluster generation, failing if it moved since `expected`.
pub(crate) fn bump_generation(conn: &Connection, expected: Option<u64>) -> Result<u64, StoreError> {
    let found = read_generation(conn)?;
    if let Some(expected) = expected {
        if found != expected {
            return Err(StoreError::Conflict { expected, found });
        }
    }
    write_meta(conn, schema::META_CLUSTER_GENERATION, &(found + 1).to_string())?;
    Ok(found + 1)
}

pub(crate) fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/faces.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.next_cluster_id().unwrap(), 1);
        assert_eq!(db.embedding_dim().unwrap(), None);
        drop(db);
        // Re-open passes the integrity check.
        Database::open(&path).unwrap();
    }

    #[test]
    fn test_open_existing_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Database::open_existing(&tmp.path().join("none.db")).unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("faces.db");
        std::fs::write(&path, vec![0x5au8; 8192]).unwrap();
        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "got {err:?}");
    }

    #[test]
    fn test_foreign_database_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("faces.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE photos (id INTEGER PRIMARY KEY)", []).unwrap();
        }
        let err = Database::open(&path).unwrap_err();
        match err {
            StoreError::Corrupt { reason, .. } => assert!(reason.contains("missing table")),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_member_count_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("faces.db");
        Database::open(&path).unwrap();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO clusters VALUES (1, x'0000803f', 3, x'', 'now', 'now')",
                [],
            )
            .unwrap();
            conn.execute("UPDATE meta SET value = '2' WHERE key = 'next_cluster_id'", [])
                .unwrap();
        }
        let err = Database::open(&path).unwrap_err();
        match err {
            StoreError::Corrupt { reason, .. } => assert!(reason.contains("member count")),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_rebuild_replaces_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("faces.db");
        std::fs::write(&path, b"definitely not sqlite, just some bytes padding it out").unwrap();
        assert!(Database::open(&path).is_err());
        let db = Database::rebuild(&path).unwrap();
        assert_eq!(db.next_cluster_id().unwrap(), 1);
    }

    #[test]
    fn test_bind_model_records_then_enforces() {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = Database::open(&tmp.path().join("faces.db")).unwrap();
        db.bind_model("m1", Metric::Cosine).unwrap();
        db.bind_model("m1", Metric::Cosine).unwrap();
        assert_eq!(db.model_version().unwrap().as_deref(), Some("m1"));
        assert_eq!(db.metric().unwrap(), Some(Metric::Cosine));

        match db.bind_model("m2", Metric::Cosine).unwrap_err() {
            StoreError::ModelMismatch { field, stored, current } => {
                assert_eq!(field, "model version");
                assert_eq!((stored.as_str(), current.as_str()), ("m1", "m2"));
            }
            other => panic!("expected ModelMismatch, got {other:?}"),
        }
        assert!(matches!(
            db.bind_model("m1", Metric::Euclidean),
            Err(StoreError::ModelMismatch { field: "metric", .. })
        ));
    }
}
