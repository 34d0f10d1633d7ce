//! Time-bounded exclusive claims on catalog rows.
//!
//! A lease is taken with a single conditional UPDATE that either succeeds
//! at once or reports contention; it never queues behind another holder.
//! While held, a background thread pushes the expiry forward every third
//! of the TTL. A holder that crashes simply stops renewing and the row
//! becomes claimable again once the lease expires.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::db::catalog_repo::{self, ClaimOutcome};
use crate::db::{self, Database, DatabaseError};

/// Identifies this dispatcher process across hosts sharing a catalog.
pub fn owner_id() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string());
    format!("{}:{}:{}", host, std::process::id(), uuid::Uuid::new_v4())
}

#[derive(Debug)]
pub enum LeaseOutcome {
    Acquired(Lease),
    /// Someone else holds the row. Try again in a later run.
    Contended,
}

/// A held claim. Released when dropped.
pub struct Lease {
    db: Database,
    file_id: i64,
    owner: String,
    stop: Option<Sender<()>>,
    renewer: Option<JoinHandle<()>>,
}

impl Lease {
    /// Attempts to claim `file_id` for `ttl`.
    pub fn try_acquire(
        db: &Database,
        file_id: i64,
        owner: &str,
        ttl: Duration,
    ) -> Result<LeaseOutcome, DatabaseError> {
        let now = Utc::now();
        let expires_at = expiry(now, ttl).ok_or_else(|| DatabaseError::InvalidValue {
            column: "lease_expires_at",
            reason: format!("lease TTL {:?} is out of range", ttl),
        })?;

        match catalog_repo::try_claim(
            db,
            file_id,
            owner,
            &db::timestamp(now),
            &db::timestamp(expires_at),
        )? {
            ClaimOutcome::Contended => {
                debug!("File {} is claimed elsewhere", file_id);
                Ok(LeaseOutcome::Contended)
            }
            ClaimOutcome::Claimed => {
                let (stop, renewer) = spawn_renewer(db.clone(), file_id, owner.to_string(), ttl);
                Ok(LeaseOutcome::Acquired(Lease {
                    db: db.clone(),
                    file_id,
                    owner: owner.to_string(),
                    stop: Some(stop),
                    renewer,
                }))
            }
        }
    }

    pub fn file_id(&self) -> i64 {
        self.file_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("file_id", &self.file_id)
            .field("owner", &self.owner)
            .finish()
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

fn spawn_renewer(
    db: Database,
    file_id: i64,
    owner: String,
    ttl: Duration,
) -> (Sender<()>, Option<JoinHandle<()>>) {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let interval = (ttl / 3).max(Duration::from_millis(100));

    let handle = thread::Builder::new()
        .name(format!("lease-{}", file_id))
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(expires_at) = expiry(Utc::now(), ttl) else {
                        break;
                    };
                    match catalog_repo::renew_lease(&db, file_id, &owner, &db::timestamp(expires_at))
                    {
                        Ok(true) => debug!("Renewed lease on file {}", file_id),
                        Ok(false) => {
                            warn!("Lease on file {} was lost", file_id);
                            break;
                        }
                        Err(e) => warn!("Failed to renew lease on file {}: {}", file_id, e),
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });

    match handle {
        Ok(handle) => (stop_tx, Some(handle)),
        Err(e) => {
            // Without renewal the lease still holds for one full TTL
            warn!("Cannot start lease renewal for file {}: {}", file_id, e);
            (stop_tx, None)
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.renewer.take() {
            let _ = handle.join();
        }
        if let Err(e) = catalog_repo::release_lease(&self.db, self.file_id, &self.owner) {
            warn!("Failed to release lease on file {}: {}", self.file_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::catalog_repo::NewCatalogEntry;

    fn catalog_with_file() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let id = catalog_repo::insert(
            &db,
            &NewCatalogEntry {
                path: "/media/card/a.wav".to_string(),
                md5: Some("aaa".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        (db, id)
    }

    #[test]
    fn test_unrepresentable_ttl_is_an_error() {
        let (db, id) = catalog_with_file();
        assert!(matches!(
            Lease::try_acquire(&db, id, "host-a", Duration::MAX),
            Err(DatabaseError::InvalidValue { .. })
        ));
        assert_eq!(catalog_repo::lease_owner(&db, id).unwrap(), None);
    }

    #[test]
    fn test_second_claim_is_contended_until_release() {
        let (db, id) = catalog_with_file();
        let ttl = Duration::from_secs(60);

        let first = match Lease::try_acquire(&db, id, "host-a", ttl).unwrap() {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Contended => panic!("first claim must succeed"),
        };
        assert!(matches!(
            Lease::try_acquire(&db, id, "host-b", ttl).unwrap(),
            LeaseOutcome::Contended
        ));
        assert_eq!(catalog_repo::lease_owner(&db, id).unwrap().as_deref(), Some("host-a"));

        drop(first);
        assert_eq!(catalog_repo::lease_owner(&db, id).unwrap(), None);
        assert!(matches!(
            Lease::try_acquire(&db, id, "host-b", ttl).unwrap(),
            LeaseOutcome::Acquired(_)
        ));
    }

    #[test]
    fn test_renewal_extends_expiry() {
        let (db, id) = catalog_with_file();
        let expiry = |db: &Database| -> String {
            db.with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT lease_expires_at FROM file_inventory WHERE id = ?1",
                    [id],
                    |r| r.get(0),
                )?)
            })
            .unwrap()
        };

        let lease = match Lease::try_acquire(&db, id, "host-a", Duration::from_millis(300)).unwrap()
        {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Contended => panic!("claim must succeed"),
        };
        let initial = expiry(&db);
        thread::sleep(Duration::from_millis(450));
        assert!(expiry(&db) > initial);
        drop(lease);
    }

    #[test]
    fn test_owner_ids_are_unique() {
        assert_ne!(owner_id(), owner_id());
    }
}
