//! SQLite-backed `StorageBackend`, the daemon's stand-in for the real
//! object store's on-disk format. Grounded in the same `sqlx::SqlitePool` +
//! inline schema pattern used for the daemon's incident history.

use async_trait::async_trait;
use lfsck_proto::LfsckError;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::fid::Fid;
use crate::store::{ObjectKind, Op, StorageBackend, StoredObject, Transaction};

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(path: &str) -> Result<Self, LfsckError> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}?mode=rwc")
        };
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await
            .map_err(|e| LfsckError::Io(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS objects (
                fid_seq INTEGER NOT NULL,
                fid_oid INTEGER NOT NULL,
                fid_ver INTEGER NOT NULL,
                kind TEXT NOT NULL,
                nlink INTEGER NOT NULL DEFAULT 0,
                remote INTEGER NOT NULL DEFAULT 0,
                xattrs TEXT NOT NULL DEFAULT '{}',
                record BLOB NOT NULL DEFAULT x'',
                PRIMARY KEY (fid_seq, fid_oid, fid_ver)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| LfsckError::Io(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dirents (
                parent_seq INTEGER NOT NULL,
                parent_oid INTEGER NOT NULL,
                parent_ver INTEGER NOT NULL,
                name TEXT NOT NULL,
                target_seq INTEGER NOT NULL,
                target_oid INTEGER NOT NULL,
                target_ver INTEGER NOT NULL,
                PRIMARY KEY (parent_seq, parent_oid, parent_ver, name)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| LfsckError::Io(e.to_string()))?;

        tracing::info!(path, "opened sqlite storage backend");
        Ok(SqliteStorage { pool })
    }
}

fn kind_str(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Regular => "regular",
        ObjectKind::Directory => "directory",
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn commit(&self, txn: Transaction) -> Result<(), LfsckError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LfsckError::Io(e.to_string()))?;

        for op in txn.take_ops() {
            match op {
                Op::Create { fid, kind, remote } => {
                    sqlx::query(
                        "INSERT INTO objects (fid_seq, fid_oid, fid_ver, kind, remote) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(fid.seq as i64)
                    .bind(fid.oid as i64)
                    .bind(fid.ver as i64)
                    .bind(kind_str(kind))
                    .bind(remote as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LfsckError::Io(e.to_string()))?;
                }
                Op::Insert { parent, name, target } => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO dirents
                         (parent_seq, parent_oid, parent_ver, name, target_seq, target_oid, target_ver)
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(parent.seq as i64)
                    .bind(parent.oid as i64)
                    .bind(parent.ver as i64)
                    .bind(name)
                    .bind(target.seq as i64)
                    .bind(target.oid as i64)
                    .bind(target.ver as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LfsckError::Io(e.to_string()))?;
                }
                Op::Unlink { parent, name } => {
                    sqlx::query(
                        "DELETE FROM dirents WHERE parent_seq = ? AND parent_oid = ? AND parent_ver = ? AND name = ?",
                    )
                    .bind(parent.seq as i64)
                    .bind(parent.oid as i64)
                    .bind(parent.ver as i64)
                    .bind(name)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LfsckError::Io(e.to_string()))?;
                }
                Op::RefAdd(fid) => {
                    let res = sqlx::query(
                        "UPDATE objects SET nlink = nlink + 1 WHERE fid_seq = ? AND fid_oid = ? AND fid_ver = ?",
                    )
                    .bind(fid.seq as i64)
                    .bind(fid.oid as i64)
                    .bind(fid.ver as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LfsckError::Io(e.to_string()))?;
                    if res.rows_affected() == 0 {
                        return Err(LfsckError::Io(format!("ref_add on unknown fid {fid}")));
                    }
                }
                Op::RefDel(fid) => {
                    let res = sqlx::query(
                        "UPDATE objects SET nlink = MAX(nlink - 1, 0) WHERE fid_seq = ? AND fid_oid = ? AND fid_ver = ?",
                    )
                    .bind(fid.seq as i64)
                    .bind(fid.oid as i64)
                    .bind(fid.ver as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LfsckError::Io(e.to_string()))?;
                    if res.rows_affected() == 0 {
                        return Err(LfsckError::Io(format!("ref_del on unknown fid {fid}")));
                    }
                }
                Op::Destroy(fid) => {
                    sqlx::query("DELETE FROM objects WHERE fid_seq = ? AND fid_oid = ? AND fid_ver = ?")
                        .bind(fid.seq as i64)
                        .bind(fid.oid as i64)
                        .bind(fid.ver as i64)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| LfsckError::Io(e.to_string()))?;
                }
                Op::WriteRecord { fid, data } => {
                    let res = sqlx::query(
                        "UPDATE objects SET record = ? WHERE fid_seq = ? AND fid_oid = ? AND fid_ver = ?",
                    )
                    .bind(data)
                    .bind(fid.seq as i64)
                    .bind(fid.oid as i64)
                    .bind(fid.ver as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LfsckError::Io(e.to_string()))?;
                    if res.rows_affected() == 0 {
                        return Err(LfsckError::Io(format!("record_write on unknown fid {fid}")));
                    }
                }
            }
        }

        tx.commit().await.map_err(|e| LfsckError::Io(e.to_string()))
    }

    async fn lookup(&self, parent: Fid, name: &str) -> Result<Option<Fid>, LfsckError> {
        let row = sqlx::query(
            "SELECT target_seq, target_oid, target_ver FROM dirents
             WHERE parent_seq = ? AND parent_oid = ? AND parent_ver = ? AND name = ?",
        )
        .bind(parent.seq as i64)
        .bind(parent.oid as i64)
        .bind(parent.ver as i64)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LfsckError::Io(e.to_string()))?;

        Ok(row.map(|r| {
            Fid::new(
                r.get::<i64, _>("target_seq") as u64,
                r.get::<i64, _>("target_oid") as u32,
                r.get::<i64, _>("target_ver") as u32,
            )
        }))
    }

    async fn locate(&self, fid: Fid) -> Result<Option<StoredObject>, LfsckError> {
        let row = sqlx::query(
            "SELECT kind, nlink, remote, xattrs, record FROM objects
             WHERE fid_seq = ? AND fid_oid = ? AND fid_ver = ?",
        )
        .bind(fid.seq as i64)
        .bind(fid.oid as i64)
        .bind(fid.ver as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LfsckError::Io(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        let kind = if row.get::<String, _>("kind") == "directory" {
            ObjectKind::Directory
        } else {
            ObjectKind::Regular
        };
        let xattrs_json: String = row.get("xattrs");
        let xattrs = serde_json::from_str(&xattrs_json).unwrap_or_default();
        Ok(Some(StoredObject {
            fid,
            kind,
            nlink: row.get::<i64, _>("nlink") as u32,
            remote: row.get::<i64, _>("remote") != 0,
            xattrs,
            record: row.get("record"),
        }))
    }

    async fn try_as_dir(&self, fid: Fid) -> Result<bool, LfsckError> {
        Ok(matches!(self.locate(fid).await?, Some(o) if o.kind == ObjectKind::Directory))
    }

    async fn xattr_get(&self, fid: Fid, name: &str) -> Result<Option<Vec<u8>>, LfsckError> {
        Ok(self
            .locate(fid)
            .await?
            .and_then(|o| o.xattrs.get(name).cloned()))
    }

    async fn record_read(&self, fid: Fid) -> Result<Vec<u8>, LfsckError> {
        self.locate(fid)
            .await?
            .map(|o| o.record)
            .ok_or(LfsckError::NotFound(format!("record for {fid}")))
    }
}
