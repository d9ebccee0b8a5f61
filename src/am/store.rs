use std::fs;
use std::path::{Path, PathBuf};

use crate::am::app::AppRecord;
use crate::am::daemon::am_event;

/// Durable, ordered list of app records, serialized as one JSON file and
/// rewritten in full after every mutation. Single source of truth for the
/// set of known apps.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    records: Vec<AppRecord>,
}

impl MetadataStore {
    /// A missing file starts empty; a corrupt file is logged and discarded
    /// rather than blocking startup.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Vec<AppRecord>>(&text) {
                Ok(records) => records,
                Err(e) => {
                    am_event("metadata", None, format!("discard_unreadable file={} err={e}", path.display()));
                    Vec::new()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    am_event("metadata", None, format!("load_failed file={} err={e}", path.display()));
                }
                Vec::new()
            }
        };
        Self { path, records }
    }

    /// Full rewrite through a temp file + rename, so a crashed write can
    /// never leave a half-written metadata file behind.
    fn save(&self) {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        if let Err(e) = fs::create_dir_all(parent) {
            am_event("metadata", None, format!("save_failed mkdir {} err={e}", parent.display()));
            return;
        }
        let json = match serde_json::to_vec_pretty(&self.records) {
            Ok(j) => j,
            Err(e) => {
                am_event("metadata", None, format!("save_failed serialize err={e}"));
                return;
            }
        };
        let tmp = parent.join(format!(".apps.json.tmp.{}", std::process::id()));
        if let Err(e) = fs::write(&tmp, &json) {
            am_event("metadata", None, format!("save_failed write {} err={e}", tmp.display()));
            return;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            am_event("metadata", None, format!("save_failed rename {} err={e}", self.path.display()));
        }
    }

    /// Replace the record with the same name, or append a new one.
    pub fn upsert(&mut self, record: AppRecord) {
        match self.records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        self.save();
    }

    pub fn find(&self, name: &str) -> Option<&AppRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Snapshot copy, in insertion order. Mutations go through `upsert` /
    /// `update_fields`, never through the returned vector.
    pub fn all(&self) -> Vec<AppRecord> {
        self.records.clone()
    }

    /// Apply a partial update to one record and persist. Returns false when
    /// the name is unknown (nothing is written).
    pub fn update_fields<F: FnOnce(&mut AppRecord)>(&mut self, name: &str, f: F) -> bool {
        match self.records.iter_mut().find(|r| r.name == name) {
            Some(rec) => {
                f(rec);
                self.save();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::app::AppKind;
    use std::collections::BTreeMap;

    fn record(name: &str) -> AppRecord {
        AppRecord {
            name: name.to_string(),
            kind: AppKind::Streamlit,
            repo: "https://example.com/r.git".to_string(),
            entry: "app.py".to_string(),
            owner: "a@b.com".to_string(),
            environment: BTreeMap::new(),
            last_known_port: None,
            active: false,
            last_start_ms: 0,
        }
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::load(dir.path().join("apps.json"));
        assert!(store.all().is_empty());
    }

    #[test]
    fn corrupt_file_is_discarded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        fs::write(&path, "{ this is not json").unwrap();
        let store = MetadataStore::load(&path);
        assert!(store.all().is_empty());
    }

    #[test]
    fn upsert_persists_and_reloads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");

        let mut store = MetadataStore::load(&path);
        store.upsert(record("alpha"));
        store.upsert(record("beta"));

        let reloaded = MetadataStore::load(&path);
        let names: Vec<String> = reloaded.all().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn upsert_replaces_by_name_keeping_uniqueness() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::load(dir.path().join("apps.json"));
        store.upsert(record("alpha"));
        let mut changed = record("alpha");
        changed.owner = "new@owner".to_string();
        store.upsert(changed);

        assert_eq!(store.all().len(), 1);
        assert_eq!(store.find("alpha").unwrap().owner, "new@owner");
    }

    #[test]
    fn update_fields_persists_and_reports_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        let mut store = MetadataStore::load(&path);
        store.upsert(record("alpha"));

        assert!(store.update_fields("alpha", |r| {
            r.active = true;
            r.last_known_port = Some(8081);
        }));
        assert!(!store.update_fields("ghost", |r| r.active = true));

        let reloaded = MetadataStore::load(&path);
        let rec = reloaded.find("alpha").unwrap();
        assert!(rec.active);
        assert_eq!(rec.last_known_port, Some(8081));
    }

    #[test]
    fn no_temp_file_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::load(dir.path().join("apps.json"));
        store.upsert(record("alpha"));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".apps.json.tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
