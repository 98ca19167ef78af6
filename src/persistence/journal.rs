//! Mutation journal
//!
//! An append-only JSON-lines log of committed mutations. Each record
//! carries a sequence number, the project version the mutation produced,
//! and a SHA-256 checksum of the mutation. After a crash the last saved
//! project is loaded and the journal replays every record newer than it.

use crate::graph::{GraphError, GraphStore, Mutation, Snapshot};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checksum mismatch
    #[error("Journal corruption detected at sequence {0}")]
    Corruption(u64),

    #[error("Invalid journal entry on line {line}: {message}")]
    InvalidEntry { line: usize, message: String },

    #[error("Replayed mutation {sequence} was rejected: {source}")]
    Rejected {
        sequence: u64,
        #[source]
        source: GraphError,
    },
}

pub type JournalResult<T> = Result<T, JournalError>;

/// One committed mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub sequence: u64,
    /// Project version after the mutation committed
    pub version: u64,
    pub mutation: Mutation,
    pub checksum: String,
}

impl JournalRecord {
    fn new(sequence: u64, version: u64, mutation: Mutation) -> JournalResult<Self> {
        let checksum = checksum(&mutation)?;
        Ok(Self {
            sequence,
            version,
            mutation,
            checksum,
        })
    }

    fn verify_checksum(&self) -> bool {
        checksum(&self.mutation)
            .map(|c| c == self.checksum)
            .unwrap_or(false)
    }
}

fn checksum(mutation: &Mutation) -> JournalResult<String> {
    let bytes = serde_json::to_vec(mutation)?;
    Ok(Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

pub struct Journal {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    sequence: u64,
    /// Flush after every append
    sync_mode: bool,
}

impl Journal {
    /// Open (or create) the journal file at `path`
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let scan = Self::scan(&path)?;
        if scan.file_len > scan.valid_len || !scan.terminated {
            Self::repair_tail(&path, &scan)?;
        }
        let sequence = scan.records.last().map(|r| r.sequence).unwrap_or(0);
        info!("Opened journal at {:?}, sequence: {}", path, sequence);

        Ok(Self {
            path,
            file: None,
            sequence,
            sync_mode: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sync_mode(&mut self, sync: bool) {
        self.sync_mode = sync;
        debug!("Journal sync mode: {}", sync);
    }

    /// Append a mutation that produced `snapshot`
    pub fn append(&mut self, mutation: &Mutation, snapshot: &Snapshot) -> JournalResult<u64> {
        let record = JournalRecord::new(self.sequence + 1, snapshot.schema_version(), mutation.clone())?;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if self.file.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.file = Some(BufWriter::new(file));
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&line)?;
            if self.sync_mode {
                file.flush()?;
            }
        }

        self.sequence = record.sequence;
        debug!("Journaled {} as sequence {}", mutation.name(), record.sequence);
        Ok(record.sequence)
    }

    pub fn flush(&mut self) -> JournalResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Records currently in the journal, oldest first
    pub fn records(&self) -> JournalResult<Vec<JournalRecord>> {
        Self::read_records(&self.path)
    }

    /// Re-apply every record newer than the store's current version.
    ///
    /// Returns the number of mutations applied.
    pub async fn replay(&self, store: &GraphStore) -> JournalResult<usize> {
        let from_version = store.snapshot().schema_version();
        info!("Replaying journal after version {}", from_version);

        let mut applied = 0;
        for record in self.records()? {
            if record.version <= from_version {
                continue;
            }
            let sequence = record.sequence;
            store
                .apply(record.mutation)
                .await
                .map_err(|source| JournalError::Rejected { sequence, source })?;
            applied += 1;
        }

        info!("Replayed {} journal entries", applied);
        Ok(applied)
    }

    /// Drop all records, typically right after the project was saved
    pub fn truncate(&mut self) -> JournalResult<()> {
        self.file = None;
        File::create(&self.path)?;
        info!("Truncated journal at sequence {}", self.sequence);
        Ok(())
    }

    fn read_records(path: &Path) -> JournalResult<Vec<JournalRecord>> {
        Ok(Self::scan(path)?.records)
    }

    /// Cut a torn final write so the next append starts on a fresh line
    fn repair_tail(path: &Path, scan: &Scan) -> JournalResult<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        if scan.file_len > scan.valid_len {
            warn!(
                "Truncating {} bytes of incomplete journal entry at {:?}",
                scan.file_len - scan.valid_len,
                path
            );
            file.set_len(scan.valid_len)?;
        }
        if !scan.terminated {
            file.seek(SeekFrom::Start(scan.valid_len))?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        Ok(())
    }

    fn scan(path: &Path) -> JournalResult<Scan> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Scan {
                    records: Vec::new(),
                    valid_len: 0,
                    file_len: 0,
                    terminated: true,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&[u8]> = data.split(|b| *b == b'\n').collect();
        let last = lines.iter().rposition(|l| !is_blank(l));

        let mut records = Vec::with_capacity(lines.len());
        let mut offset = 0usize;
        let mut valid_len = 0usize;
        let mut terminated = true;

        for (idx, line) in lines.iter().enumerate() {
            let end = offset + line.len();
            let has_newline = end < data.len();
            let next = if has_newline { end + 1 } else { end };

            if is_blank(line) {
                offset = next;
                continue;
            }
            let record: JournalRecord = match serde_json::from_slice(line) {
                Ok(record) => record,
                // A torn final write is dropped
                Err(e) if Some(idx) == last => {
                    warn!("Ignoring incomplete journal entry on line {}: {}", idx + 1, e);
                    break;
                }
                Err(e) => {
                    return Err(JournalError::InvalidEntry {
                        line: idx + 1,
                        message: e.to_string(),
                    })
                }
            };
            if !record.verify_checksum() {
                warn!("Journal corruption detected at sequence {}", record.sequence);
                return Err(JournalError::Corruption(record.sequence));
            }
            records.push(record);
            valid_len = next;
            terminated = has_newline;
            offset = next;
        }

        Ok(Scan {
            records,
            valid_len: valid_len as u64,
            file_len: data.len() as u64,
            terminated,
        })
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Result of reading the journal file
struct Scan {
    records: Vec<JournalRecord>,
    /// Bytes up to and including the last complete record
    valid_len: u64,
    file_len: u64,
    /// Whether the last complete record ends with a newline
    terminated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, NodeId, NodeKind, Project};
    use tempfile::TempDir;

    fn narration(id: u64) -> Mutation {
        Mutation::create_node(Node::new(NodeId::new(id), NodeKind::Narration).with_text("en", "..."))
    }

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let store = GraphStore::new(Project::new("j")).unwrap();

        let mut journal = Journal::open(&path).unwrap();
        assert_eq!(journal.sequence(), 0);
        for id in 0..3 {
            let m = narration(id);
            let snapshot = store.apply(m.clone()).await.unwrap();
            journal.append(&m, &snapshot).unwrap();
        }
        drop(journal);

        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.sequence(), 3);
        let versions: Vec<u64> = journal.records().unwrap().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_replay_skips_saved_versions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let live = GraphStore::new(Project::new("j")).unwrap();
        let mut journal = Journal::open(&path).unwrap();

        let mut saved = None;
        for id in 0..4 {
            let m = narration(id);
            let snapshot = live.apply(m.clone()).await.unwrap();
            journal.append(&m, &snapshot).unwrap();
            if id == 1 {
                saved = Some(snapshot.project().clone());
            }
        }

        let recovered = GraphStore::new(saved.unwrap()).unwrap();
        let applied = journal.replay(&recovered).await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(recovered.snapshot().node_count(), 4);
        assert_eq!(
            recovered.snapshot().content_hash(),
            live.snapshot().content_hash()
        );
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let record = JournalRecord {
            sequence: 1,
            version: 1,
            mutation: narration(0),
            checksum: "00".to_string(),
        };
        std::fs::write(&path, format!("{}\n", serde_json::to_string(&record).unwrap())).unwrap();

        assert!(matches!(Journal::open(&path), Err(JournalError::Corruption(1))));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let record = JournalRecord::new(1, 1, narration(0)).unwrap();
        let contents = format!("{}\n{{\"sequence\": 2, \"vers", serde_json::to_string(&record).unwrap());
        std::fs::write(&path, contents).unwrap();

        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.sequence(), 1);

        // The partial line is cut so the next append starts cleanly
        let expected = serde_json::to_string(&record).unwrap().len() as u64 + 1;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn test_unterminated_final_record_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let record = JournalRecord::new(1, 1, narration(0)).unwrap();
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.sequence(), 1);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let record = JournalRecord::new(1, 1, narration(0)).unwrap();
        std::fs::write(&path, format!("{}\n", serde_json::to_string(&record).unwrap())).unwrap();

        let mut journal = Journal::open(&path).unwrap();
        journal.truncate().unwrap();
        assert!(journal.records().unwrap().is_empty());
        assert_eq!(journal.sequence(), 1);
    }
}
