//! Catalog repository: the scanner-owned `file_inventory` table.
//!
//! Besides reads, this core only ever writes two things here: the lease
//! columns and the `deleted` flag.

use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: i64,
    pub path: String,
    pub md5: Option<String>,
    pub size: Option<i64>,
    pub mime_type: Option<String>,
    pub mount_uuid: Option<String>,
    pub relative_path: Option<String>,
    pub deleted: bool,
}

impl CatalogEntry {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            path: row.get("path")?,
            md5: row.get("md5")?,
            size: row.get("size")?,
            mime_type: row.get("mime_type")?,
            mount_uuid: row.get("mount_uuid")?,
            relative_path: row.get("relative_path")?,
            deleted: row.get::<_, i64>("deleted")? != 0,
        })
    }
}

/// Fields a scanner supplies when cataloguing a file.
#[derive(Debug, Clone, Default)]
pub struct NewCatalogEntry {
    pub path: String,
    pub md5: Option<String>,
    pub size: Option<i64>,
    pub mime_type: Option<String>,
    pub mount_uuid: Option<String>,
    pub relative_path: Option<String>,
}

/// Position of a candidate in selection order. Candidates are sorted by
/// `(size, last_ended_at, id)` descending, so the next page holds the rows
/// strictly below the last cursor seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateCursor {
    pub size: i64,
    pub last_ended_at: String,
    pub id: i64,
}

#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub entry: CatalogEntry,
    pub cursor: CandidateCursor,
}

/// Selection criteria for one candidate page.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub id_min: i64,
    pub id_max: i64,
    pub mime_prefixes: Vec<String>,
    pub excluded_mime_types: Vec<String>,
    /// Files whose latest failed attempt ended after this instant are not
    /// retried yet.
    pub retry_cutoff: String,
    pub after: Option<CandidateCursor>,
    pub limit: usize,
}

const LATEST_RUN_ENDED: &str = "(SELECT tl.ended_at FROM transcription_log tl
      WHERE tl.file_id = f.id ORDER BY tl.id DESC LIMIT 1)";

/// Returns the next page of files needing transcription.
///
/// A file qualifies when it is not deleted, has a media mime type, no
/// successful run exists for its content checksum or for the file itself,
/// and its latest attempt is older than the retry cutoff.
pub fn select_candidates(
    db: &Database,
    query: &CandidateQuery,
) -> Result<Vec<CandidateRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = vec![
            "f.deleted = 0".to_string(),
            "f.id BETWEEN ?1 AND ?2".to_string(),
            "NOT EXISTS (SELECT 1 FROM transcription_log s
                WHERE s.status = 'success' AND (s.md5 = f.md5 OR s.file_id = f.id))"
                .to_string(),
            format!("COALESCE({}, '') <= ?3", LATEST_RUN_ENDED),
        ];
        let mut values: Vec<rusqlite::types::Value> = vec![
            query.id_min.into(),
            query.id_max.into(),
            query.retry_cutoff.clone().into(),
        ];

        if !query.mime_prefixes.is_empty() {
            let mut alternatives = Vec::new();
            for prefix in &query.mime_prefixes {
                values.push(format!("{}%", prefix.to_lowercase()).into());
                alternatives.push(format!("LOWER(f.mime_type) LIKE ?{}", values.len()));
            }
            conditions.push(format!("({})", alternatives.join(" OR ")));
        }

        for excluded in &query.excluded_mime_types {
            values.push(excluded.to_lowercase().into());
            conditions.push(format!("LOWER(f.mime_type) != ?{}", values.len()));
        }

        if let Some(ref after) = query.after {
            values.push(after.size.into());
            values.push(after.last_ended_at.clone().into());
            values.push(after.id.into());
            let n = values.len();
            conditions.push(format!(
                "(COALESCE(f.size, 0), COALESCE({}, ''), f.id) < (?{}, ?{}, ?{})",
                LATEST_RUN_ENDED,
                n - 2,
                n - 1,
                n
            ));
        }

        values.push((query.limit as i64).into());
        let sql = format!(
            "SELECT f.*, COALESCE(f.size, 0) AS sort_size,
                    COALESCE({ended}, '') AS sort_ended
             FROM file_inventory f
             WHERE {where_clause}
             ORDER BY sort_size DESC, sort_ended DESC, f.id DESC
             LIMIT ?{limit}",
            ended = LATEST_RUN_ENDED,
            where_clause = conditions.join(" AND "),
            limit = values.len()
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                let entry = CatalogEntry::from_row(row)?;
                let cursor = CandidateCursor {
                    size: row.get("sort_size")?,
                    last_ended_at: row.get("sort_ended")?,
                    id: entry.id,
                };
                Ok(CandidateRow { entry, cursor })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Inserts a catalog row and returns its id.
pub fn insert(db: &Database, entry: &NewCatalogEntry) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO file_inventory (path, md5, size, mime_type, mount_uuid, relative_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.path,
                entry.md5,
                entry.size,
                entry.mime_type,
                entry.mount_uuid,
                entry.relative_path,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

pub fn find_by_id(db: &Database, id: i64) -> Result<Option<CatalogEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let entry = conn
            .query_row(
                "SELECT * FROM file_inventory WHERE id = ?1",
                params![id],
                CatalogEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    })
}

/// Returns up to `limit` non-deleted rows with `id > after_id`, by id.
pub fn list_active_page(
    db: &Database,
    after_id: i64,
    limit: usize,
) -> Result<Vec<CatalogEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM file_inventory WHERE deleted = 0 AND id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after_id, limit as i64], CatalogEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn mark_deleted(db: &Database, id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE file_inventory SET deleted = 1 WHERE id = ?1 AND deleted = 0",
            params![id],
        )?;
        Ok(changed == 1)
    })
}

/// Result of a lease claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another holder owns an unexpired lease, the row is gone, or the
    /// catalog stayed locked past the statement timeout.
    Contended,
}

/// Takes the lease on a row if nobody holds an unexpired one. Never waits
/// beyond the connection's busy timeout.
pub fn try_claim(
    db: &Database,
    id: i64,
    owner: &str,
    now: &str,
    expires_at: &str,
) -> Result<ClaimOutcome, DatabaseError> {
    let result = db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE file_inventory SET lease_owner = ?2, lease_expires_at = ?3
             WHERE id = ?1 AND deleted = 0
               AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at < ?4)",
            params![id, owner, expires_at, now],
        )?;
        Ok(changed)
    });

    match result {
        Ok(1) => Ok(ClaimOutcome::Claimed),
        Ok(_) => Ok(ClaimOutcome::Contended),
        Err(e) if e.is_busy() => Ok(ClaimOutcome::Contended),
        Err(e) => Err(e),
    }
}

/// Extends a lease still held by `owner`. Returns false if it was lost.
pub fn renew_lease(
    db: &Database,
    id: i64,
    owner: &str,
    expires_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE file_inventory SET lease_expires_at = ?3
             WHERE id = ?1 AND lease_owner = ?2",
            params![id, owner, expires_at],
        )?;
        Ok(changed == 1)
    })
}

/// Clears the lease if `owner` still holds it.
pub fn release_lease(db: &Database, id: i64, owner: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE file_inventory SET lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND lease_owner = ?2",
            params![id, owner],
        )?;
        Ok(())
    })
}

/// Current lease holder of a row, if any.
pub fn lease_owner(db: &Database, id: i64) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let owner: Option<Option<String>> = conn
            .query_row(
                "SELECT lease_owner FROM file_inventory WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(owner.flatten())
    })
}
