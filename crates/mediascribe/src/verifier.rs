//! Catalog verification: flags rows whose file no longer exists.

use log::{debug, info};

use crate::db::catalog_repo;
use crate::db::{Database, DatabaseError};
use crate::sanitize::redact_path;
use crate::selector::{resolve_entry, Resolution};
use crate::volume::MountSnapshot;

const PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: usize,
    pub present: usize,
    pub marked_deleted: usize,
    /// Rows on volumes that are not mounted; left untouched.
    pub unavailable: usize,
}

/// Walks every non-deleted catalog row and marks those whose file is gone
/// as deleted. Files on unmounted volumes are only temporarily unavailable
/// and keep their state.
pub fn verify_catalog(db: &Database, snapshot: &MountSnapshot) -> Result<VerifyReport, DatabaseError> {
    let mut report = VerifyReport::default();
    let mut after_id = 0;

    loop {
        let page = catalog_repo::list_active_page(db, after_id, PAGE_SIZE)?;
        let Some(last) = page.last() else {
            break;
        };
        after_id = last.id;

        for entry in &page {
            report.checked += 1;
            match resolve_entry(entry, snapshot) {
                Resolution::NotMounted => report.unavailable += 1,
                Resolution::Physical(path) if path.exists() => report.present += 1,
                Resolution::Physical(path) => {
                    debug!("File {} is gone: {}", entry.id, redact_path(&path));
                    if catalog_repo::mark_deleted(db, entry.id)? {
                        report.marked_deleted += 1;
                    }
                }
            }
        }
    }

    info!(
        "Verified {} files: {} present, {} marked deleted, {} unavailable",
        report.checked, report.present, report.marked_deleted, report.unavailable
    );
    Ok(report)
}
