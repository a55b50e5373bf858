//! Append-only, file-backed storage.
//!
//! Every mutation is appended to `dgate.db` as a length-prefixed record guarded by a CRC32
//! checksum. The full key space is kept in memory; on connect the log is replayed and then
//! rewritten with only live keys so the file does not grow without bound across restarts.
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufReader, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use crc32fast::Hasher;
use parking_lot::{Mutex, RwLock};

use super::memory::{apply_ops, page, scan_prefix};
use crate::ports::storage::{BatchOp, Storage, StorageError, StorageResult};

const LOG_FILE: &str = "dgate.db";

const OP_SET: u8 = 1;
const OP_DELETE: u8 = 2;

#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    writer: Mutex<Option<File>>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(None),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn append(&self, ops: &[BatchOp]) -> StorageResult<()> {
        let mut guard = self.writer.lock();
        let file = guard.as_mut().ok_or(StorageError::NotConnected)?;
        // A batch is written as one record so it replays atomically.
        write_record(file, &encode_ops(ops))?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn connect(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.log_path();
        let mut entries = BTreeMap::new();
        for ops in read_records(&path)? {
            apply_ops(&mut entries, ops);
        }

        let tmp_path = path.with_extension("db.tmp");
        {
            let mut out = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp_path)?;
            let live: Vec<BatchOp> = entries
                .iter()
                .map(|(key, value)| BatchOp::Set {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            if !live.is_empty() {
                write_record(&mut out, &encode_ops(&live))?;
            }
            out.flush()?;
            out.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        tracing::debug!(path = %path.display(), keys = entries.len(), "file storage opened");
        *self.entries.write() = entries;
        *self.writer.lock() = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.apply_batch(vec![BatchOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
        }])
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.apply_batch(vec![BatchOp::Delete {
            key: key.to_string(),
        }])
    }

    fn get_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(page(&self.entries.read(), prefix, offset, limit))
    }

    fn iterate_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> StorageResult<()> {
        let entries = self.entries.read();
        for (key, value) in scan_prefix(&entries, prefix) {
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        // Hold the map lock across the append so readers never see a write that is not durable.
        let mut entries = self.entries.write();
        self.append(&ops)?;
        apply_ops(&mut entries, ops);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        if let Some(file) = self.writer.lock().take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    file.write_all(&(payload.len() as u32).to_be_bytes())?;
    file.write_all(&hasher.finalize().to_be_bytes())?;
    file.write_all(payload)
}

fn read_records(path: &Path) -> StorageResult<Vec<Vec<BatchOp>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    loop {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                // Torn tail from a crash mid-append; the record was never acknowledged.
                tracing::warn!(path = %path.display(), "discarding truncated storage record");
                break;
            }
            Err(err) => return Err(err.into()),
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected {
            return Err(StorageError::Corrupted(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        records.push(decode_ops(&payload)?);
    }
    Ok(records)
}

fn encode_ops(ops: &[BatchOp]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(ops.len() as u32).to_be_bytes());
    for op in ops {
        match op {
            BatchOp::Set { key, value } => {
                out.push(OP_SET);
                put_bytes(&mut out, key.as_bytes());
                put_bytes(&mut out, value);
            }
            BatchOp::Delete { key } => {
                out.push(OP_DELETE);
                put_bytes(&mut out, key.as_bytes());
            }
        }
    }
    out
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> StorageResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(StorageError::Corrupted("short storage record".into()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u32(&mut self) -> StorageResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self) -> StorageResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> StorageResult<String> {
        String::from_utf8(self.bytes()?.to_vec())
            .map_err(|_| StorageError::Corrupted("storage key is not utf-8".into()))
    }
}

fn decode_ops(buf: &[u8]) -> StorageResult<Vec<BatchOp>> {
    let mut cursor = Cursor { buf };
    let count = cursor.u32()? as usize;
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = cursor.take(1)?[0];
        let op = match tag {
            OP_SET => BatchOp::Set {
                key: cursor.string()?,
                value: cursor.bytes()?.to_vec(),
            },
            OP_DELETE => BatchOp::Delete {
                key: cursor.string()?,
            },
            other => {
                return Err(StorageError::Corrupted(format!(
                    "unknown storage op tag {other}"
                )));
            }
        };
        ops.push(op);
    }
    Ok(ops)
}
