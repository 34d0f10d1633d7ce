//! Mount audit repository: where each volume has been seen mounted.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};
use crate::volume::VolumeMount;

#[derive(Debug, Clone)]
pub struct MountRow {
    pub id: i64,
    pub uuid: String,
    pub mount_path: String,
    pub device: Option<String>,
    pub filesystem_type: Option<String>,
    pub label: Option<String>,
    pub is_external: Option<bool>,
    pub partition_uuid: Option<String>,
    pub mounted_at: String,
}

impl MountRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            uuid: row.get("uuid")?,
            mount_path: row.get("mount_path")?,
            device: row.get("device")?,
            filesystem_type: row.get("filesystem_type")?,
            label: row.get("label")?,
            is_external: row.get("is_external")?,
            partition_uuid: row.get("partition_uuid")?,
            mounted_at: row.get("mounted_at")?,
        })
    }
}

/// Records every mount of a snapshot. A mount already known under the same
/// `(uuid, mount_path, device, filesystem_type, partition_uuid)` only gets
/// its `mounted_at` refreshed; NULL columns compare equal. Returns the
/// number of newly inserted rows.
pub fn upsert_all(
    db: &Database,
    mounts: &[VolumeMount],
    mounted_at: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn_mut(|conn| {
        let tx = conn.transaction()?;
        let mut inserted = 0;

        for mount in mounts {
            let updated = tx.execute(
                "UPDATE mount_info
                 SET mounted_at = ?6,
                     label = COALESCE(?7, label),
                     is_external = COALESCE(?8, is_external)
                 WHERE uuid = ?1 AND mount_path = ?2 AND device IS ?3
                   AND filesystem_type IS ?4 AND partition_uuid IS ?5",
                params![
                    mount.uuid,
                    mount.mount_path,
                    mount.device,
                    mount.fs_type,
                    mount.partition_uuid,
                    mounted_at,
                    mount.label,
                    mount.is_external,
                ],
            )?;

            if updated == 0 {
                tx.execute(
                    "INSERT INTO mount_info (uuid, mount_path, device, filesystem_type, label,
                     is_external, partition_uuid, mounted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        mount.uuid,
                        mount.mount_path,
                        mount.device,
                        mount.fs_type,
                        mount.label,
                        mount.is_external,
                        mount.partition_uuid,
                        mounted_at,
                    ],
                )?;
                inserted += 1;
            }
        }

        tx.commit()?;
        Ok(inserted)
    })
}

/// All audit rows, most recently mounted first.
pub fn list(db: &Database) -> Result<Vec<MountRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM mount_info ORDER BY mounted_at DESC, id DESC")?;
        let rows = stmt
            .query_map([], MountRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
