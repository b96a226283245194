//! File-backed write-ahead log.
//!
//! Single file, `wal/checkflow.wal`:
//!
//! ```text
//! header  "CKFW" | version u8 | 3 reserved bytes
//! entry   len u32 | sequence u64 | record JSON (len bytes) | crc32 u32
//! ```
//!
//! Integers are little-endian. The CRC covers the sequence bytes and the
//! JSON. A short final frame (a crash mid-append) ends the read and is cut
//! off the file on the next open, so later appends stay readable; a frame
//! whose CRC does not match is skipped with a warning. Compaction rewrites
//! the surviving frames through a temp file and a rename.

use std::path::{Path, PathBuf};

use checkflow_core::transaction::WalLog;
use checkflow_types::config::WalSyncMode;
use checkflow_types::error::StorageError;
use checkflow_types::transaction::{WalEntry, WalRecord};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::filesystem::write_atomic;

const MAGIC: &[u8; 4] = b"CKFW";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 8;
/// `len` + `sequence` prefix.
const FRAME_PREFIX: usize = 12;
const CRC_LEN: usize = 4;
/// Frames claiming more than this are treated as a torn tail.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn header() -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    header[4] = FORMAT_VERSION;
    header
}

fn checksum(sequence: &[u8], json: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(sequence);
    hasher.update(json);
    hasher.finalize()
}

/// Encode one entry as a frame.
fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>, StorageError> {
    let json = serde_json::to_vec(&entry.record)?;
    let len = u32::try_from(json.len())
        .map_err(|_| StorageError::Serialization("WAL record too large".to_string()))?;
    let sequence = entry.sequence.to_le_bytes();

    let mut frame = Vec::with_capacity(FRAME_PREFIX + json.len() + CRC_LEN);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&sequence);
    frame.extend_from_slice(&json);
    frame.extend_from_slice(&checksum(&sequence, &json).to_le_bytes());
    Ok(frame)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Readable entries of a log image and where the last whole frame ends.
#[derive(Debug)]
struct DecodedLog {
    entries: Vec<WalEntry>,
    valid_len: usize,
}

/// Decode every readable entry of a log file image.
///
/// An empty image is an empty log. A bad header is an error; bad frames are
/// not.
fn decode(bytes: &[u8]) -> Result<DecodedLog, StorageError> {
    if bytes.is_empty() {
        return Ok(DecodedLog {
            entries: Vec::new(),
            valid_len: 0,
        });
    }
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(StorageError::Corrupted("not a checkflow WAL file".to_string()));
    }
    if bytes[4] != FORMAT_VERSION {
        return Err(StorageError::Corrupted(format!(
            "unsupported WAL format version {}",
            bytes[4]
        )));
    }

    let mut entries = Vec::new();
    let mut offset = HEADER_LEN;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < FRAME_PREFIX {
            tracing::warn!(offset, remaining = rest.len(), "torn WAL tail ignored");
            break;
        }
        let len = read_u32(rest) as usize;
        let frame_len = FRAME_PREFIX + len + CRC_LEN;
        if len > MAX_RECORD_LEN || rest.len() < frame_len {
            tracing::warn!(offset, len, "torn WAL tail ignored");
            break;
        }

        let sequence_bytes = &rest[4..FRAME_PREFIX];
        let json = &rest[FRAME_PREFIX..FRAME_PREFIX + len];
        let stored = read_u32(&rest[FRAME_PREFIX + len..]);
        offset += frame_len;

        let sequence = read_u64(sequence_bytes);
        if checksum(sequence_bytes, json) != stored {
            tracing::warn!(sequence, "WAL entry failed CRC check, skipping");
            continue;
        }
        match serde_json::from_slice::<WalRecord>(json) {
            Ok(record) => entries.push(WalEntry { sequence, record }),
            Err(e) => {
                tracing::warn!(sequence, error = %e, "undecodable WAL entry, skipping");
            }
        }
    }
    Ok(DecodedLog {
        entries,
        valid_len: offset,
    })
}

#[derive(Debug)]
struct FileWalInner {
    last_sequence: u64,
}

/// `WalLog` backed by a single append-only file.
///
/// Appends and compactions are serialized by an internal mutex; the file
/// is owned by one process at a time.
#[derive(Debug)]
pub struct FileWal {
    path: PathBuf,
    sync: WalSyncMode,
    inner: Mutex<FileWalInner>,
}

impl FileWal {
    /// Open (or create) the log at `path`.
    ///
    /// Sequence numbering continues after the highest readable entry.
    pub async fn open(path: impl Into<PathBuf>, sync: WalSyncMode) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                let decoded = decode(&bytes)?;
                if decoded.valid_len < bytes.len() {
                    tracing::warn!(
                        path = %path.display(),
                        valid_len = decoded.valid_len,
                        file_len = bytes.len(),
                        "truncating torn WAL tail"
                    );
                    let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(decoded.valid_len as u64).await?;
                    file.sync_all().await?;
                }
                decoded.entries
            }
            Ok(_) => {
                write_atomic(&path, &header()).await?;
                Vec::new()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_atomic(&path, &header()).await?;
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let last_sequence = entries.iter().map(|e| e.sequence).max().unwrap_or(0);
        tracing::debug!(
            path = %path.display(),
            entries = entries.len(),
            last_sequence,
            "opened WAL"
        );
        Ok(Self {
            path,
            sync,
            inner: Mutex::new(FileWalInner { last_sequence }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> Result<Vec<WalEntry>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => decode(&bytes).map(|decoded| decoded.entries),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rewrite(&self, entries: &[WalEntry]) -> Result<(), StorageError> {
        let mut image = header().to_vec();
        for entry in entries {
            image.extend_from_slice(&encode_frame(entry)?);
        }
        write_atomic(&self.path, &image).await?;
        Ok(())
    }
}

impl WalLog for FileWal {
    async fn append(&self, record: WalRecord) -> Result<WalEntry, StorageError> {
        let mut inner = self.inner.lock().await;
        let entry = WalEntry {
            sequence: inner.last_sequence + 1,
            record,
        };
        let frame = encode_frame(&entry)?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&frame).await?;
        match self.sync {
            WalSyncMode::Immediate => file.sync_data().await?,
            WalSyncMode::OsManaged => file.flush().await?,
        }

        inner.last_sequence = entry.sequence;
        tracing::debug!(
            sequence = entry.sequence,
            transaction_id = %entry.transaction_id(),
            kind = ?entry.kind(),
            "WAL append"
        );
        Ok(entry)
    }

    async fn read_all(&self) -> Result<Vec<WalEntry>, StorageError> {
        let _guard = self.inner.lock().await;
        self.read_entries().await
    }

    async fn remove_transaction(&self, transaction_id: Uuid) -> Result<(), StorageError> {
        let _guard = self.inner.lock().await;
        let mut entries = self.read_entries().await?;
        let before = entries.len();
        entries.retain(|e| e.transaction_id() != transaction_id);
        if entries.len() != before {
            self.rewrite(&entries).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.inner.lock().await;
        self.rewrite(&[]).await
    }
}
