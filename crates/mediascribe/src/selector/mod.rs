//! Work selection: which catalog entries still need a transcript, and
//! where they can be read right now.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::debug;

use crate::config::DispatchConfig;
use crate::db::catalog_repo::{self, CandidateCursor, CandidateQuery, CatalogEntry};
use crate::db::{self, Database, DatabaseError};
use crate::paths::LogicalPath;
use crate::sanitize::redact_path;
use crate::volume::MountSnapshot;
use crate::worker::TranscriptionTask;

pub mod audio;

pub use audio::{AudioProbe, FfprobeAudioProbe};

/// Where a catalog entry lives at the moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Physical(PathBuf),
    /// The entry's volume is not in the snapshot. Temporary, not a loss.
    NotMounted,
}

/// Resolves an entry to a physical path, preferring its logical path. Rows
/// the scanner catalogued without volume information fall back to the
/// stored path.
pub fn resolve_entry(entry: &CatalogEntry, snapshot: &MountSnapshot) -> Resolution {
    match (&entry.mount_uuid, &entry.relative_path) {
        (Some(identity), Some(relative)) if !identity.is_empty() => {
            match snapshot.to_physical(&LogicalPath::new(identity.clone(), relative)) {
                Some(path) => Resolution::Physical(path),
                None => Resolution::NotMounted,
            }
        }
        _ => Resolution::Physical(PathBuf::from(&entry.path)),
    }
}

/// Selection bounds for one dispatch run.
#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub id_min: i64,
    pub id_max: i64,
    pub mime_prefixes: Vec<String>,
    pub excluded_mime_types: Vec<String>,
    pub retry_failed_after: chrono::Duration,
    pub batch_size: usize,
}

impl SelectorSettings {
    pub fn from_config(config: &DispatchConfig, id_min: Option<i64>, id_max: Option<i64>) -> Self {
        Self {
            id_min: id_min.unwrap_or(0),
            id_max: id_max.unwrap_or(i64::MAX),
            mime_prefixes: config.media_mime_prefixes.clone(),
            excluded_mime_types: config.excluded_mime_types.clone(),
            retry_failed_after: config.retry_failed_after(),
            batch_size: config.batch_size.max(1),
        }
    }
}

/// Pages through candidates in selection order: largest first, then most
/// recently attempted, then highest id.
pub struct WorkSelector {
    db: Database,
    settings: SelectorSettings,
    cursor: Option<CandidateCursor>,
    exhausted: bool,
}

impl WorkSelector {
    pub fn new(db: Database, settings: SelectorSettings) -> Self {
        Self {
            db,
            settings,
            cursor: None,
            exhausted: false,
        }
    }

    /// Fetches the next batch. An empty batch means selection is done.
    pub fn next_batch(&mut self) -> Result<Vec<CatalogEntry>, DatabaseError> {
        self.next_batch_at(Utc::now())
    }

    pub fn next_batch_at(&mut self, now: DateTime<Utc>) -> Result<Vec<CatalogEntry>, DatabaseError> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let query = CandidateQuery {
            id_min: self.settings.id_min,
            id_max: self.settings.id_max,
            mime_prefixes: self.settings.mime_prefixes.clone(),
            excluded_mime_types: self.settings.excluded_mime_types.clone(),
            retry_cutoff: db::timestamp(
                now.checked_sub_signed(self.settings.retry_failed_after)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
            after: self.cursor.clone(),
            limit: self.settings.batch_size,
        };

        let rows = catalog_repo::select_candidates(&self.db, &query)?;
        if rows.len() < self.settings.batch_size {
            self.exhausted = true;
        }
        self.cursor = rows.last().map(|r| r.cursor.clone()).or(self.cursor.take());

        debug!("Selected {} candidates", rows.len());
        Ok(rows.into_iter().map(|r| r.entry).collect())
    }
}

/// Why candidates were passed over, for the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCounters {
    pub not_mounted: usize,
    pub non_existing: usize,
    pub no_audio: usize,
    pub duplicate_content: usize,
}

impl SkipCounters {
    pub fn total(&self) -> usize {
        self.not_mounted + self.non_existing + self.no_audio + self.duplicate_content
    }
}

/// Second-stage check on selected entries: the file must be reachable,
/// carry audio, and not repeat content already queued in this run.
pub struct CandidateFilter<'a> {
    audio: &'a dyn AudioProbe,
    counters: SkipCounters,
    queued_md5: HashSet<String>,
}

impl<'a> CandidateFilter<'a> {
    pub fn new(audio: &'a dyn AudioProbe) -> Self {
        Self {
            audio,
            counters: SkipCounters::default(),
            queued_md5: HashSet::new(),
        }
    }

    pub fn counters(&self) -> SkipCounters {
        self.counters
    }

    pub fn filter(
        &mut self,
        entries: Vec<CatalogEntry>,
        snapshot: &MountSnapshot,
    ) -> Vec<TranscriptionTask> {
        let mut tasks = Vec::with_capacity(entries.len());

        for entry in entries {
            if let Some(task) = self.check(entry, snapshot) {
                tasks.push(task);
            }
        }
        tasks
    }

    fn check(&mut self, entry: CatalogEntry, snapshot: &MountSnapshot) -> Option<TranscriptionTask> {
        let physical_path = match resolve_entry(&entry, snapshot) {
            Resolution::Physical(path) => path,
            Resolution::NotMounted => {
                debug!("File {} skipped: volume not mounted", entry.id);
                self.counters.not_mounted += 1;
                return None;
            }
        };

        if !physical_path.is_file() {
            debug!("File {} skipped: {} does not exist", entry.id, redact_path(&physical_path));
            self.counters.non_existing += 1;
            return None;
        }

        if let Some(md5) = &entry.md5 {
            if self.queued_md5.contains(md5) {
                self.counters.duplicate_content += 1;
                return None;
            }
        }

        let mime_type = entry.mime_type.clone().or_else(|| {
            mime_guess::from_path(&physical_path)
                .first()
                .map(|m| m.essence_str().to_string())
        });
        let is_audio = mime_type
            .as_deref()
            .map(|m| m.to_ascii_lowercase().starts_with("audio/"))
            .unwrap_or(false);

        if !is_audio && !self.audio.has_audio(&physical_path) {
            debug!("File {} skipped: no audio stream", entry.id);
            self.counters.no_audio += 1;
            return None;
        }

        if let Some(md5) = &entry.md5 {
            self.queued_md5.insert(md5.clone());
        }

        Some(TranscriptionTask {
            file_id: entry.id,
            physical_path,
            md5: entry.md5,
            mime_type,
        })
    }
}
