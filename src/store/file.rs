//! Record store backed by one JSON file per user.
//!
//! Several processes (CLI invocations, a long-running `serve`) can share one
//! directory. Every mutation takes an exclusive advisory lock on the user's
//! `.lock` file, re-reads the record from disk, applies the change, and
//! renames a fresh copy into place before releasing the lock. No process ever
//! writes state it read earlier, so a stale handle cannot undo newer updates.
//!
//! All file I/O runs on the blocking pool. Locks are per user, so writers to
//! different users never wait on each other.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::debug;

use super::{QuotaRecordStore, RecordPatch, ResetOutcome};
use crate::error::{QuotaError, Result};
use crate::quota::QuotaRecord;

const RECORD_EXT: &str = "json";
const LOCK_EXT: &str = "lock";

/// Directory of per-user record files.
///
/// Clone is cheap; clones share the directory path.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    dir: Arc<PathBuf>,
}

impl FileRecordStore {
    /// Open (creating if needed) the record directory at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!(path = %dir.display(), "Opened quota record directory");
        Ok(Self { dir: Arc::new(dir) })
    }

    /// Default record directory: `~/.quotagate/records`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".quotagate")
            .join("records")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run `f` on the blocking pool with the record directory.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        let dir = Arc::clone(&self.dir);
        tokio::task::spawn_blocking(move || f(dir.as_path()))
            .await
            .map_err(|e| QuotaError::Store(format!("record store task failed: {e}")))?
    }

    /// Run `f` on the user's record path while holding the user's lock.
    async fn locked<T, F>(&self, user_id: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        let stem = file_stem(user_id)?;
        self.blocking(move |dir| {
            let lock = open_lock(&dir.join(format!("{stem}.{LOCK_EXT}")))?;
            lock.lock_exclusive()?;
            let result = f(&dir.join(format!("{stem}.{RECORD_EXT}")));
            // Closing the handle releases the lock as well.
            let _ = FileExt::unlock(&lock);
            result
        })
        .await
    }

    /// Apply `mutate` to the current on-disk record and write it back.
    async fn update<F>(&self, user_id: &str, mutate: F) -> Result<QuotaRecord>
    where
        F: FnOnce(&mut QuotaRecord) + Send + 'static,
    {
        let user = user_id.to_string();
        self.locked(user_id, move |path| {
            let mut record = read_record(path)?.ok_or(QuotaError::NotFound(user))?;
            mutate(&mut record);
            record.updated_at = Utc::now();
            write_record(path, &record)?;
            Ok(record)
        })
        .await
    }

    async fn scan<F>(&self, keep: F) -> Result<Vec<QuotaRecord>>
    where
        F: Fn(&QuotaRecord) -> bool + Send + 'static,
    {
        self.blocking(move |dir| {
            let mut records = Vec::new();
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                    continue;
                }
                if let Some(record) = read_record(&path)? {
                    if keep(&record) {
                        records.push(record);
                    }
                }
            }
            records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
            Ok(records)
        })
        .await
    }
}

/// File-name-safe form of a user id. Bytes outside `[A-Za-z0-9_-]` are
/// percent-encoded, so distinct ids never share a file.
fn file_stem(user_id: &str) -> Result<String> {
    if user_id.is_empty() {
        return Err(QuotaError::Validation("user id must not be empty".into()));
    }
    let mut stem = String::with_capacity(user_id.len());
    for byte in user_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    Ok(stem)
}

fn open_lock(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

fn read_record(path: &Path) -> Result<Option<QuotaRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace `path` atomically via a sibling temp file.
fn write_record(path: &Path, record: &QuotaRecord) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_vec_pretty(record)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| QuotaError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl QuotaRecordStore for FileRecordStore {
    async fn get(&self, user_id: &str) -> Result<QuotaRecord> {
        let user = user_id.to_string();
        let stem = file_stem(user_id)?;
        // Renames are atomic, so a reader sees either the old or the new file.
        self.blocking(move |dir| {
            read_record(&dir.join(format!("{stem}.{RECORD_EXT}")))?
                .ok_or(QuotaError::NotFound(user))
        })
        .await
    }

    async fn insert(&self, record: QuotaRecord) -> Result<()> {
        let user_id = record.user_id.clone();
        self.locked(&user_id, move |path| {
            if path.exists() {
                return Err(QuotaError::AlreadyExists(record.user_id));
            }
            write_record(path, &record)
        })
        .await
    }

    async fn add_usage(&self, user_id: &str, requests: u64, tokens: u64) -> Result<QuotaRecord> {
        self.update(user_id, move |record| {
            record.daily_requests_used = record.daily_requests_used.saturating_add(requests);
            record.daily_tokens_used = record.daily_tokens_used.saturating_add(tokens);
        })
        .await
    }

    async fn apply_patch(&self, user_id: &str, patch: &RecordPatch) -> Result<QuotaRecord> {
        let patch = patch.clone();
        self.update(user_id, move |record| patch.apply_to(record))
            .await
    }

    async fn reset_period(
        &self,
        user_id: &str,
        expected_reset_at: DateTime<Utc>,
        next_reset_at: DateTime<Utc>,
    ) -> Result<ResetOutcome> {
        let user = user_id.to_string();
        self.locked(user_id, move |path| {
            let mut record = read_record(path)?.ok_or(QuotaError::NotFound(user))?;
            if record.quota_reset_at != expected_reset_at {
                return Ok(ResetOutcome::BoundaryMoved {
                    current: record.quota_reset_at,
                });
            }
            record.daily_requests_used = 0;
            record.daily_tokens_used = 0;
            record.quota_reset_at = next_reset_at;
            record.updated_at = Utc::now();
            write_record(path, &record)?;
            Ok(ResetOutcome::Reset)
        })
        .await
    }

    async fn due_records(&self, now: DateTime<Utc>) -> Result<Vec<QuotaRecord>> {
        self.scan(move |record| record.is_due(now)).await
    }

    async fn all_records(&self) -> Result<Vec<QuotaRecord>> {
        self.scan(|_| true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::testing::record;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("records");

        let store = FileRecordStore::open(&dir).unwrap();
        store.insert(record("alice")).await.unwrap();
        store.add_usage("alice", 1, 250).await.unwrap();
        assert!(dir.join("alice.json").exists());

        let reopened = FileRecordStore::open(&dir).unwrap();
        let rec = reopened.get("alice").await.unwrap();
        assert_eq!(rec.daily_requests_used, 1);
        assert_eq!(rec.daily_tokens_used, 250);
    }

    #[tokio::test]
    async fn test_two_handles_on_one_directory_lose_no_increments() {
        let tmp = TempDir::new().unwrap();
        let first = FileRecordStore::open(tmp.path()).unwrap();
        let second = FileRecordStore::open(tmp.path()).unwrap();
        first.insert(record("alice")).await.unwrap();

        first.add_usage("alice", 1, 100).await.unwrap();
        second.add_usage("alice", 1, 100).await.unwrap();

        let rec = FileRecordStore::open(tmp.path())
            .unwrap()
            .get("alice")
            .await
            .unwrap();
        assert_eq!(rec.daily_requests_used, 2);
        assert_eq!(rec.daily_tokens_used, 200);
    }

    #[tokio::test]
    async fn test_concurrent_handles_serialise_on_the_record_lock() {
        let tmp = TempDir::new().unwrap();
        let seed = FileRecordStore::open(tmp.path()).unwrap();
        seed.insert(record("alice")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            // A fresh handle per task, as separate CLI processes would have.
            let store = FileRecordStore::open(tmp.path()).unwrap();
            handles.push(tokio::spawn(async move {
                store.add_usage("alice", 1, 10).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rec = seed.get("alice").await.unwrap();
        assert_eq!(rec.daily_requests_used, 16);
        assert_eq!(rec.daily_tokens_used, 160);
    }

    #[tokio::test]
    async fn test_older_handle_does_not_drop_newer_users() {
        let tmp = TempDir::new().unwrap();
        let long_running = FileRecordStore::open(tmp.path()).unwrap();
        long_running.insert(record("alice")).await.unwrap();

        let cli = FileRecordStore::open(tmp.path()).unwrap();
        cli.insert(record("bob")).await.unwrap();

        long_running.add_usage("alice", 1, 100).await.unwrap();
        let bob = long_running.get("bob").await.unwrap();
        assert_eq!(bob.user_id, "bob");
        let all: Vec<String> = long_running
            .all_records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(all, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_insert_twice_is_already_exists() {
        let tmp = TempDir::new().unwrap();
        let store = FileRecordStore::open(tmp.path()).unwrap();
        store.insert(record("u1")).await.unwrap();
        assert!(matches!(
            store.insert(record("u1")).await,
            Err(QuotaError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_user_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FileRecordStore::open(tmp.path()).unwrap();
        assert!(matches!(store.get("ghost").await, Err(QuotaError::NotFound(_))));
        assert!(matches!(
            store.add_usage("ghost", 1, 1).await,
            Err(QuotaError::NotFound(_))
        ));
        // A failed update must not leave a record behind.
        assert!(store.all_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_period_compare_and_set_across_handles() {
        let tmp = TempDir::new().unwrap();
        let scheduler_view = FileRecordStore::open(tmp.path()).unwrap();
        let mut rec = record("u1");
        rec.daily_requests_used = 7;
        let boundary = rec.quota_reset_at;
        scheduler_view.insert(rec).await.unwrap();
        let next = boundary + Duration::hours(24);

        // Another process resets first.
        let admin_view = FileRecordStore::open(tmp.path()).unwrap();
        assert_eq!(
            admin_view.reset_period("u1", boundary, next).await.unwrap(),
            ResetOutcome::Reset
        );
        admin_view.add_usage("u1", 3, 30).await.unwrap();

        // The stale expectation misses and leaves the new usage alone.
        assert_eq!(
            scheduler_view
                .reset_period("u1", boundary, next)
                .await
                .unwrap(),
            ResetOutcome::BoundaryMoved { current: next }
        );
        assert_eq!(scheduler_view.get("u1").await.unwrap().daily_requests_used, 3);
    }

    #[tokio::test]
    async fn test_due_records_filters_sorts_and_ignores_lock_files() {
        let tmp = TempDir::new().unwrap();
        let store = FileRecordStore::open(tmp.path()).unwrap();
        let now = Utc::now();
        for (id, offset) in [("c", -1), ("a", -5), ("b", 3)] {
            let mut rec = record(id);
            rec.quota_reset_at = now + Duration::hours(offset);
            store.insert(rec).await.unwrap();
        }
        assert!(tmp.path().join("a.lock").exists());
        let due: Vec<String> = store
            .due_records(now)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(due, vec!["a", "c"]);
    }

    #[test]
    fn test_file_stem_escapes_unsafe_bytes() {
        assert_eq!(file_stem("alice_01-x").unwrap(), "alice_01-x");
        assert_eq!(file_stem("a/b.c").unwrap(), "a%2Fb%2Ec");
        assert_eq!(file_stem("..").unwrap(), "%2E%2E");
        assert_ne!(file_stem("a%2F").unwrap(), file_stem("a/").unwrap());
        assert!(file_stem("").is_err());
    }

    #[tokio::test]
    async fn test_user_ids_with_path_characters_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = FileRecordStore::open(tmp.path()).unwrap();
        store.insert(record("team/alice@example.com")).await.unwrap();
        let rec = store.get("team/alice@example.com").await.unwrap();
        assert_eq!(rec.user_id, "team/alice@example.com");
    }

    #[tokio::test]
    async fn test_corrupt_record_is_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("alice.json"), "{not json").unwrap();
        let store = FileRecordStore::open(tmp.path()).unwrap();
        assert!(matches!(store.get("alice").await, Err(QuotaError::Json(_))));
        assert!(matches!(store.all_records().await, Err(QuotaError::Json(_))));
    }
}
