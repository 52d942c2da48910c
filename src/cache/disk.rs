//! Durable on-disk tier
//!
//! One directory per namespace, one record file per sanitized key:
//!
//! ```text
//! {storage_root}/{namespace}/{key}.json
//! ```
//!
//! All methods here do blocking filesystem I/O. The store only calls them
//! from `tokio::task::spawn_blocking`.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::debug;

use super::entry::{RecordCodec, StoredEntry};
use crate::error::CacheError;

/// Reads and writes records under a storage root
#[derive(Debug, Clone)]
pub struct DiskTier {
    root: PathBuf,
    codec: Arc<dyn RecordCodec>,
}

impl DiskTier {
    pub fn new(root: PathBuf, codec: Arc<dyn RecordCodec>) -> Self {
        Self { root, codec }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a namespace's records
    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    /// Path of the record for a sanitized key
    pub fn record_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.{}", key, self.codec.extension()))
    }

    /// Makes sure the namespace directory exists and is writable
    pub fn prepare(&self, namespace: &str) -> Result<(), CacheError> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)?;
        // Creating a directory succeeds on read-only mounts when it already exists
        NamedTempFile::new_in(&dir)?;
        Ok(())
    }

    /// Reads a record; `Ok(None)` when there is none
    pub fn read(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let bytes = match fs::read(self.record_path(namespace, key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.codec.decode(&bytes).map(Some)
    }

    /// Writes a record via a temporary file renamed over the target
    ///
    /// Readers see either the previous record or the new one, never a
    /// partial write.
    pub fn write(&self, namespace: &str, key: &str, entry: &StoredEntry) -> Result<(), CacheError> {
        let bytes = self.codec.encode(entry)?;
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path(namespace, key))
            .map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    /// Deletes a record; returns whether one existed
    pub fn remove(&self, namespace: &str, key: &str) -> Result<bool, CacheError> {
        match fs::remove_file(self.record_path(namespace, key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every record in a namespace; returns how many there were
    pub fn clear(&self, namespace: &str) -> Result<usize, CacheError> {
        let removed = self.record_files(namespace)?.len();
        match fs::remove_dir_all(self.namespace_dir(namespace)) {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes records whose TTL has elapsed at `now`
    ///
    /// Unreadable records are deleted too but not counted.
    pub fn remove_expired(&self, namespace: &str, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let mut removed = 0;

        for path in self.record_files(namespace)? {
            let expired = match fs::read(&path) {
                Ok(bytes) => match self.codec.decode(&bytes) {
                    Ok(entry) => entry.is_expired(now),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Removing unreadable cache record");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                },
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if expired {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(removed)
    }

    /// Number of records in a namespace
    pub fn count(&self, namespace: &str) -> Result<usize, CacheError> {
        Ok(self.record_files(namespace)?.len())
    }

    /// Namespaces that have a directory under the root
    pub fn namespaces(&self) -> Result<Vec<String>, CacheError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // Sanitized namespaces never start with a dot
            match entry.file_name().to_str() {
                Some(name) if !name.starts_with('.') => names.push(name.to_string()),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }

    fn record_files(&self, namespace: &str) -> Result<Vec<PathBuf>, CacheError> {
        let entries = match fs::read_dir(self.namespace_dir(namespace)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let extension = self.codec.extension();
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_record = path.is_file()
                && path.extension().and_then(|ext| ext.to_str()) == Some(extension)
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
            if is_record {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CacheEntry, JsonCodec, Metadata};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_tier() -> (DiskTier, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let tier = DiskTier::new(temp_dir.path().to_path_buf(), Arc::new(JsonCodec));
        (tier, temp_dir)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap()
    }

    fn entry(value: serde_json::Value, ttl_minutes: Option<i64>) -> StoredEntry {
        CacheEntry::new(value, noon(), ttl_minutes.map(Duration::minutes), Metadata::new())
    }

    #[test]
    fn test_write_creates_record_in_namespace_directory() {
        let (tier, temp_dir) = create_test_tier();

        tier.write("weather", "KJFK", &entry(json!({"temp": 22}), Some(15)))
            .expect("Write should succeed");

        let expected = temp_dir.path().join("weather").join("KJFK.json");
        assert!(expected.exists(), "Record file should exist");
        let content = fs::read_to_string(&expected).expect("Should read file");
        assert!(content.contains("\"cachedAt\""));
        assert!(content.contains("\"temp\""));
    }

    #[test]
    fn test_read_missing_record_is_none() {
        let (tier, _temp_dir) = create_test_tier();

        assert!(tier.read("weather", "KJFK").expect("read").is_none());
    }

    #[test]
    fn test_read_returns_written_entry() {
        let (tier, _temp_dir) = create_test_tier();
        let written = entry(json!(["A1", "A2"]), None);

        tier.write("notam", "KJFK", &written).expect("write");

        assert_eq!(tier.read("notam", "KJFK").expect("read"), Some(written));
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let (tier, temp_dir) = create_test_tier();
        fs::create_dir_all(temp_dir.path().join("weather")).unwrap();
        fs::write(temp_dir.path().join("weather").join("KJFK.json"), "{not json").unwrap();

        assert!(matches!(
            tier.read("weather", "KJFK"),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_overwrite_leaves_no_temporary_files() {
        let (tier, temp_dir) = create_test_tier();

        tier.write("weather", "KJFK", &entry(json!(1), None)).unwrap();
        tier.write("weather", "KJFK", &entry(json!(2), None)).unwrap();

        let files: Vec<_> = fs::read_dir(temp_dir.path().join("weather"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(tier.read("weather", "KJFK").unwrap().unwrap().value, json!(2));
    }

    #[test]
    fn test_remove_and_clear() {
        let (tier, _temp_dir) = create_test_tier();
        tier.write("weather", "KJFK", &entry(json!(1), None)).unwrap();
        tier.write("weather", "KLGA", &entry(json!(2), None)).unwrap();
        tier.write("notam", "KJFK", &entry(json!(3), None)).unwrap();

        assert!(tier.remove("weather", "KJFK").unwrap());
        assert!(!tier.remove("weather", "KJFK").unwrap());
        assert_eq!(tier.clear("weather").unwrap(), 1);
        assert_eq!(tier.count("weather").unwrap(), 0);
        assert_eq!(tier.count("notam").unwrap(), 1);
    }

    #[test]
    fn test_remove_expired_only_touches_expired_records() {
        let (tier, _temp_dir) = create_test_tier();
        tier.write("weather", "old", &entry(json!(1), Some(15))).unwrap();
        tier.write("weather", "new", &entry(json!(2), Some(240))).unwrap();
        tier.write("weather", "forever", &entry(json!(3), None)).unwrap();

        let removed = tier
            .remove_expired("weather", noon() + Duration::hours(1))
            .unwrap();

        assert_eq!(removed, 1);
        assert!(tier.read("weather", "old").unwrap().is_none());
        assert_eq!(tier.count("weather").unwrap(), 2);
    }

    #[test]
    fn test_namespaces_lists_directories() {
        let (tier, _temp_dir) = create_test_tier();
        assert!(tier.namespaces().unwrap().is_empty());

        tier.write("weather", "KJFK", &entry(json!(1), None)).unwrap();
        tier.write("notam", "KJFK", &entry(json!(1), None)).unwrap();
        fs::create_dir_all(tier.root().join(".limits")).unwrap();

        assert_eq!(tier.namespaces().unwrap(), vec!["notam", "weather"]);
    }

    #[test]
    fn test_prepare_creates_nested_root() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested").join("cache");
        let tier = DiskTier::new(nested.clone(), Arc::new(JsonCodec));

        tier.prepare("weather").expect("prepare should succeed");

        assert!(nested.join("weather").is_dir());
    }
}
