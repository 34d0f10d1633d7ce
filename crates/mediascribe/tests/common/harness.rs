//! Test harness for isolated dispatch runs.
//!
//! Each `TestHarness` owns a temporary directory holding a file-backed
//! catalog and a `volume/` directory that stands in for a mounted
//! removable volume.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use mediascribe::db::catalog_repo::{self, NewCatalogEntry};
use mediascribe::db::run_repo::{self, RunRow};
use mediascribe::db::Database;
use mediascribe::volume::{MountSnapshot, VolumeMount};

pub const VOLUME_UUID: &str = "7C4A8D09-CA37-4F4B-9E41-2A0D7B1C5E3F";

pub struct TestHarness {
    temp_dir: TempDir,
    /// Root of the fake volume.
    pub volume_dir: PathBuf,
    pub db_path: PathBuf,
    pub db: Database,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let volume_dir = temp_dir.path().join("volume");
        std::fs::create_dir_all(&volume_dir).expect("Failed to create volume dir");

        let db_path = temp_dir.path().join("data").join("catalog.db");
        let db = Database::open(&db_path).expect("Failed to open catalog");

        Self {
            temp_dir,
            volume_dir,
            db_path,
            db,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A second connection to the same catalog, as another dispatcher
    /// process would have.
    pub fn second_handle(&self) -> Database {
        Database::open(&self.db_path).expect("Failed to open second handle")
    }

    pub fn volume(&self) -> VolumeMount {
        VolumeMount {
            uuid: VOLUME_UUID.to_string(),
            partition_uuid: None,
            mount_path: self.volume_dir.to_string_lossy().into_owned(),
            device: Some("/dev/sdz1".to_string()),
            fs_type: Some("exfat".to_string()),
            label: Some("FIELD REC".to_string()),
            is_external: Some(true),
        }
    }

    pub fn snapshot(&self) -> MountSnapshot {
        MountSnapshot::from_mounts(vec![self.volume()])
    }

    /// Writes a media file on the fake volume.
    pub fn write_media(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.volume_dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create media dir");
        }
        std::fs::write(&path, content).expect("Failed to write media file");
        path
    }

    pub fn catalog(&self, entry: NewCatalogEntry) -> i64 {
        catalog_repo::insert(&self.db, &entry).expect("Failed to insert catalog row")
    }

    pub fn runs_for(&self, file_id: i64) -> Vec<RunRow> {
        run_repo::list_for_file(&self.db, file_id).expect("Failed to list runs")
    }

    pub fn lease_owner(&self, file_id: i64) -> Option<String> {
        catalog_repo::lease_owner(&self.db, file_id).expect("Failed to read lease")
    }
}
