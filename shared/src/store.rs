use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::EmergencyRecord;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 16 * 1024 * 1024;
const MAX_RECORDS: usize = 100_000;
const STORE_MAGIC: &[u8; 4] = b"SZHS";

/// Size bounds shared by save and load, so a file that was written is
/// always a file that can be read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_bytes: usize,
    pub max_records: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_bytes: MAX_STORE_BYTES,
            max_records: MAX_RECORDS,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many records: {count}, max {max}")]
    TooManyRecords { count: usize, max: usize },

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("lock acquisition failed")]
    LockFailed,
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Durable home of the emergency history. The engine loads once at start and
/// saves the full history after every mutation.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self) -> Result<Vec<EmergencyRecord>, StoreError>;
    async fn save(&self, records: &[EmergencyRecord]) -> Result<(), StoreError>;

    /// Moves unreadable contents out of the way so the next save starts
    /// fresh. Returns where they went, if anywhere.
    async fn set_aside(&self) -> Result<Option<PathBuf>, StoreError> {
        Ok(None)
    }
}

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<EmergencyRecord>>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_records(records: Vec<EmergencyRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<EmergencyRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self) -> Result<Vec<EmergencyRecord>, StoreError> {
        self.records
            .lock()
            .map(|r| r.clone())
            .map_err(|_| StoreError::LockFailed)
    }

    async fn save(&self, records: &[EmergencyRecord]) -> Result<(), StoreError> {
        let mut guard = self.records.lock().map_err(|_| StoreError::LockFailed)?;
        *guard = records.to_vec();
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct StorePayload {
    records: Vec<EmergencyRecord>,
}

/// CBOR snapshot file with a blake3 checksum, replaced atomically on save.
///
/// Saves run on the blocking pool and may outlive the caller (the engine
/// bounds them with a timeout). Each save takes a generation number when it
/// is issued; writes are serialized and a save whose generation is older
/// than what is already on disk is skipped, so a slow write never lands over
/// a newer one.
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    path: PathBuf,
    limits: StoreLimits,
    writer: Arc<Writer>,
}

#[derive(Debug, Default)]
struct Writer {
    issued: AtomicU64,
    written: Mutex<u64>,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            limits: StoreLimits::default(),
            writer: Arc::new(Writer::default()),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn aside_path(&self) -> PathBuf {
        self.path.with_extension("corrupt")
    }
}

#[async_trait::async_trait]
impl HistoryStore for FileHistoryStore {
    async fn load(&self) -> Result<Vec<EmergencyRecord>, StoreError> {
        let path = self.path.clone();
        let limits = self.limits;
        tokio::task::spawn_blocking(move || load_from_path(&path, &limits))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn save(&self, records: &[EmergencyRecord]) -> Result<(), StoreError> {
        let generation = self.writer.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.path.clone();
        let limits = self.limits;
        let writer = Arc::clone(&self.writer);
        let records = records.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut written = writer.written.lock().map_err(|_| StoreError::LockFailed)?;
            if *written > generation {
                debug!(generation, written = *written, "newer history already on disk, save skipped");
                return Ok(());
            }
            save_to_path(&path, &records, &limits)?;
            *written = generation;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn set_aside(&self) -> Result<Option<PathBuf>, StoreError> {
        let from = self.path.clone();
        let to = self.aside_path();
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let _written = writer.written.lock().map_err(|_| StoreError::LockFailed)?;
            if !from.exists() {
                return Ok(None);
            }
            std::fs::rename(&from, &to)?;
            Ok(Some(to))
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Writes the newest records that fit `limits`; the oldest finished records
/// are left out of the file when the whole history does not fit.
pub fn save_to_path(
    path: &Path,
    records: &[EmergencyRecord],
    limits: &StoreLimits,
) -> Result<(), StoreError> {
    let (bytes, dropped) = serialize_within_limits(records, limits)?;
    if dropped > 0 {
        warn!(
            dropped,
            kept = records.len() - dropped,
            "history exceeds store limits, oldest finished records not persisted"
        );
    }

    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

pub fn load_from_path(
    path: &Path,
    limits: &StoreLimits,
) -> Result<Vec<EmergencyRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let bytes = std::fs::read(path)?;

    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty file",
        });
    }

    deserialize(&bytes, limits)
}

/// Encodes exactly `records`, failing with the same errors `deserialize`
/// would report for the result.
pub fn serialize(
    records: &[EmergencyRecord],
    limits: &StoreLimits,
) -> Result<Vec<u8>, StoreError> {
    if records.len() > limits.max_records {
        return Err(StoreError::TooManyRecords {
            count: records.len(),
            max: limits.max_records,
        });
    }

    let payload = StorePayload {
        records: records.to_vec(),
    };

    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);

    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;

    if envelope_bytes.len() > limits.max_bytes {
        return Err(StoreError::StoreTooLarge {
            size: envelope_bytes.len(),
            max: limits.max_bytes,
        });
    }
    Ok(envelope_bytes)
}

/// Encodes `records`, leaving out the oldest finished ones until the result
/// fits `limits`. Active records are always kept. Returns the bytes and the
/// number of records left out.
pub fn serialize_within_limits(
    records: &[EmergencyRecord],
    limits: &StoreLimits,
) -> Result<(Vec<u8>, usize), StoreError> {
    let mut finished: Vec<usize> = (0..records.len())
        .filter(|&i| !records[i].is_active())
        .collect();
    finished.sort_by_key(|&i| records[i].started_at());

    let mut dropped = records
        .len()
        .saturating_sub(limits.max_records)
        .min(finished.len());

    loop {
        let left_out: HashSet<usize> = finished[..dropped].iter().copied().collect();
        let kept: Vec<EmergencyRecord> = records
            .iter()
            .enumerate()
            .filter(|(i, _)| !left_out.contains(i))
            .map(|(_, r)| r.clone())
            .collect();

        match serialize(&kept, limits) {
            Ok(bytes) => return Ok((bytes, dropped)),
            Err(StoreError::StoreTooLarge { size, max }) if dropped < finished.len() => {
                // Records are roughly uniform in size; shed the overshoot
                // proportionally, plus one so every round makes progress.
                let excess = kept.len() * (size - max) / size + 1;
                dropped = (dropped + excess).min(finished.len());
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn deserialize(
    bytes: &[u8],
    limits: &StoreLimits,
) -> Result<Vec<EmergencyRecord>, StoreError> {
    if bytes.len() > limits.max_bytes {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: limits.max_bytes,
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if envelope.schema_version < CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnknownSchema(envelope.schema_version));
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let payload: StorePayload = ciborium::from_reader(&envelope.payload[..])?;

    if payload.records.len() > limits.max_records {
        return Err(StoreError::TooManyRecords {
            count: payload.records.len(),
            max: limits.max_records,
        });
    }

    if !payload.records.iter().all(EmergencyRecord::is_consistent) {
        return Err(StoreError::Corrupted {
            reason: "record violates lifecycle invariants",
        });
    }

    Ok(payload.records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContactId, Coordinate, EmergencyKind, Notes, UnixTimeMs};
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_records() -> Vec<EmergencyRecord> {
        let mut timer = EmergencyRecord::open(
            EmergencyKind::SafetyTimer,
            UnixTimeMs(1_000),
            Some(Duration::from_secs(300)),
        );
        timer.set_location(Coordinate::new(59.93, 30.33).unwrap());
        timer.push_contact(ContactId::new("sister"));
        timer.finalize(Duration::from_secs(300));

        let sos = EmergencyRecord::open(EmergencyKind::Sos, UnixTimeMs(301_000), None);
        vec![timer, sos]
    }

    fn finished(at: u64, notes_len: usize) -> EmergencyRecord {
        let mut record = EmergencyRecord::open(EmergencyKind::Manual, UnixTimeMs(at), None);
        if notes_len > 0 {
            record.set_notes(Some(Notes::new("n".repeat(notes_len)).unwrap()));
        }
        record.finalize(Duration::from_secs(1));
        record
    }

    #[test]
    fn roundtrip_empty_history() {
        let bytes = serialize(&[], &StoreLimits::default()).unwrap();
        assert!(deserialize(&bytes, &StoreLimits::default()).unwrap().is_empty());
    }

    #[test]
    fn roundtrip_with_data() {
        let records = sample_records();
        let bytes = serialize(&records, &StoreLimits::default()).unwrap();
        assert_eq!(deserialize(&bytes, &StoreLimits::default()).unwrap(), records);
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let records = sample_records();
        let mut payload = Vec::new();
        ciborium::into_writer(&StorePayload { records }, &mut payload).unwrap();

        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: [0u8; 32],
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        assert!(matches!(
            deserialize(&bytes, &StoreLimits::default()),
            Err(StoreError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn bad_magic_is_corrupted() {
        let envelope = StoreEnvelope {
            magic: *b"NOPE",
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: [0u8; 32],
            payload: Vec::new(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        assert!(matches!(
            deserialize(&bytes, &StoreLimits::default()),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn future_schema_rejected() {
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            checksum: [0u8; 32],
            payload: Vec::new(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        assert!(matches!(
            deserialize(&bytes, &StoreLimits::default()),
            Err(StoreError::FutureSchema { .. })
        ));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let records = load_from_path(&dir.path().join("history.bin"), &StoreLimits::default()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn empty_file_is_corrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.bin");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            load_from_path(&path, &StoreLimits::default()),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("history.bin"));
        let records = sample_records();

        store.save(&records).await.unwrap();
        assert!(!dir.path().join("history.tmp").exists());
        assert_eq!(store.load().await.unwrap(), records);
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryHistoryStore::new();
        let records = sample_records();
        store.save(&records).await.unwrap();
        assert_eq!(store.load().await.unwrap(), records);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn serialize_refuses_what_load_would_reject() {
        let limits = StoreLimits {
            max_bytes: MAX_STORE_BYTES,
            max_records: 2,
        };
        let records = vec![finished(1, 0), finished(2, 0), finished(3, 0)];
        assert!(matches!(
            serialize(&records, &limits),
            Err(StoreError::TooManyRecords { count: 3, max: 2 })
        ));

        let tiny = StoreLimits {
            max_bytes: 64,
            max_records: MAX_RECORDS,
        };
        assert!(matches!(
            serialize(&[finished(1, 512)], &tiny),
            Err(StoreError::StoreTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_history_is_written_loadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.bin");
        let limits = StoreLimits {
            max_bytes: 16 * 1024,
            max_records: MAX_RECORDS,
        };
        let mut records: Vec<EmergencyRecord> = (0..40).map(|i| finished(i * 10, 1024)).collect();
        let active = EmergencyRecord::open(EmergencyKind::Sos, UnixTimeMs(5), None);
        records.insert(3, active.clone());

        save_to_path(&path, &records, &limits).unwrap();
        let loaded = load_from_path(&path, &limits).unwrap();

        assert!(loaded.len() < records.len());
        assert!(loaded.contains(&active));
        assert_eq!(loaded.last(), records.last());
        let oldest_kept = loaded
            .iter()
            .filter(|r| !r.is_active())
            .map(EmergencyRecord::started_at)
            .min()
            .unwrap();
        let dropped = records.iter().filter(|r| !loaded.contains(r));
        assert!(dropped.into_iter().all(|r| r.started_at() < oldest_kept));
    }

    #[tokio::test]
    async fn record_limit_drops_oldest_finished_first() {
        let dir = tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("history.bin")).with_limits(StoreLimits {
            max_bytes: MAX_STORE_BYTES,
            max_records: 3,
        });
        let active = EmergencyRecord::open(EmergencyKind::Sos, UnixTimeMs(1), None);
        let records = vec![
            active.clone(),
            finished(10, 0),
            finished(20, 0),
            finished(30, 0),
            finished(40, 0),
        ];

        store.save(&records).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded, vec![active, records[3].clone(), records[4].clone()]);
    }

    #[tokio::test]
    async fn stale_save_never_lands_over_newer_one() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileHistoryStore::new(dir.path().join("history.bin")));
        let older = vec![finished(1, 0)];
        let newer = sample_records();

        // Hold the writer so both saves queue up on the blocking pool.
        let gate = store.writer.written.lock().unwrap();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), store.save(&older)).await;
        assert!(timed_out.is_err());

        let pending = tokio::spawn({
            let store = Arc::clone(&store);
            let newer = newer.clone();
            async move { store.save(&newer).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(gate);

        pending.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.load().await.unwrap(), newer);
    }

    #[tokio::test]
    async fn unreadable_file_can_be_set_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.bin");
        std::fs::write(&path, b"garbage").unwrap();
        let store = FileHistoryStore::new(&path);
        assert!(store.load().await.is_err());

        let moved = store.set_aside().await.unwrap().unwrap();

        assert!(!path.exists());
        assert_eq!(std::fs::read(&moved).unwrap(), b"garbage");
        assert!(store.load().await.unwrap().is_empty());
        assert_eq!(store.set_aside().await.unwrap(), None);
    }
}
