//! Append-only commit log for the state store
//!
//! Frame format: [MAGIC][REVISION u64][LEN u32][JSON mutations][CRC32]
//!
//! One frame per committed transaction. The CRC covers revision, length and
//! payload. A torn or corrupted tail is cut off on open; everything before it
//! is replayed.

use crate::common::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const WAL_MAGIC: [u8; 4] = *b"SDSW";
const SNAP_MAGIC: [u8; 8] = *b"SDSSNAP1";

/// Upper bound on a single frame; anything larger is treated as corruption
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A single key mutation inside a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Mutation {
    Put { key: String, value: Value },
    Delete { key: String },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }
}

/// One committed transaction
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub revision: u64,
    pub mutations: Vec<Mutation>,
}

pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Wal {
    /// Open or create the log, cutting off any torn tail.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let valid_len = Self::valid_prefix_len(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                "cutting corrupted tail off state log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn valid_prefix_len(path: &Path) -> Result<u64> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut offset = 0u64;
        while let Ok(Some((_, frame_len))) = Self::read_entry_internal(&mut reader) {
            offset += frame_len;
        }
        Ok(offset)
    }

    /// Append a commit and fsync it.
    pub fn append(&mut self, revision: u64, mutations: &[Mutation]) -> Result<()> {
        let payload = serde_json::to_vec(mutations)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|l| *l <= MAX_FRAME_LEN)
            .ok_or_else(|| Error::Internal("commit too large for state log".into()))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&revision.to_le_bytes());
        hasher.update(&len.to_le_bytes());
        hasher.update(&payload);
        let checksum = hasher.finalize();

        self.writer.write_all(&WAL_MAGIC)?;
        self.writer.write_all(&revision.to_le_bytes())?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.write_all(&checksum.to_le_bytes())?;

        self.sync()
    }

    /// Replay all intact entries in order.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(WalEntry) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        loop {
            match Self::read_entry_internal(&mut reader) {
                Ok(Some((entry, _))) => callback(entry)?,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "state log replay stopped at corrupted entry");
                    break;
                }
            }
        }
        Ok(())
    }

    fn read_entry_internal<R: Read>(reader: &mut R) -> Result<Option<(WalEntry, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != WAL_MAGIC {
            return Err(Error::Corrupted("invalid log magic".into()));
        }

        let mut rev_bytes = [0u8; 8];
        reader.read_exact(&mut rev_bytes)?;
        let revision = u64::from_le_bytes(rev_bytes);

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            return Err(Error::Corrupted(format!("frame length {} too large", len)));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&rev_bytes);
        hasher.update(&len_bytes);
        hasher.update(&payload);
        if hasher.finalize() != stored {
            return Err(Error::Corrupted("checksum mismatch".into()));
        }

        let mutations: Vec<Mutation> = serde_json::from_slice(&payload)?;
        let frame_len = (4 + 8 + 4 + payload.len() + 4) as u64;

        Ok(Some((
            WalEntry {
                revision,
                mutations,
            },
            frame_len,
        )))
    }

    /// Truncate the log (after a snapshot has been written)
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;
        drop(file);

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Write a snapshot file atomically: temp file, fsync, rename.
pub fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    let checksum = crc32fast::hash(&payload);

    let tmp = path.with_extension("snap.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&SNAP_MAGIC)?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Read a snapshot file; `None` when it does not exist.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    if data.len() < SNAP_MAGIC.len() + 8 + 4 || data[..8] != SNAP_MAGIC {
        return Err(Error::Corrupted("invalid snapshot header".into()));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[8..16]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if data.len() != 16 + len + 4 {
        return Err(Error::Corrupted("snapshot length mismatch".into()));
    }

    let payload = &data[16..16 + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[16 + len..]);
    if crc32fast::hash(payload) != u32::from_le_bytes(crc_bytes) {
        return Err(Error::Corrupted("snapshot checksum mismatch".into()));
    }

    Ok(Some(serde_json::from_slice(payload)?))
}
