//! # file
//!
//! why: durable engine built on standard rust fs apis
//! relations: implements `KvStore` from lib.rs, opened by `open_engine("file", ..)`
//! what: FileKvStore, an append-only record file replayed into an ordered map on open
//!
//! every write appends one json record and syncs it before returning. the file is
//! compacted (rewritten from the live map, temp file then rename) once dead
//! records outnumber live keys by a wide margin.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{KvStore, Result, StorageError};

const RECORD_FILE: &str = "engine.log";
const COMPACT_FILE: &str = "engine.tmp";

/// compaction kicks in past this many records regardless of map size
const COMPACT_MIN_RECORDS: usize = 1024;

/// one mutation as written to the record file
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeletePrefix { prefix: Vec<u8> },
}

struct Inner {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    file: File,
    /// records in the file, live or dead
    records: usize,
    /// length of the file up to the last record that was fully written and synced
    len: u64,
}

/// file-backed engine
///
/// stores everything under one directory:
/// - engine.log: newline-delimited json records, replayed on open
pub struct FileKvStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl FileKvStore {
    /// open (or create) an engine rooted at `dir`
    ///
    /// a torn final record is discarded and the file trimmed back to the last
    /// complete record; a bad record anywhere else fails the open.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(RECORD_FILE);

        let mut map = BTreeMap::new();
        let mut records = 0;
        let mut valid_len = 0u64;

        if path.exists() {
            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;

            let mut offset = 0usize;
            while offset < raw.len() {
                let (line, complete) = match raw[offset..].iter().position(|b| *b == b'\n') {
                    Some(end) => (&raw[offset..offset + end], true),
                    None => (&raw[offset..], false),
                };
                let next = offset + line.len() + 1;
                let is_tail = next >= raw.len();

                let parsed = if complete {
                    serde_json::from_slice::<Record>(line).map_err(|e| e.to_string())
                } else {
                    Err("missing record terminator".to_string())
                };

                match parsed {
                    Ok(record) => {
                        apply(&mut map, record);
                        records += 1;
                        valid_len = next as u64;
                    }
                    Err(reason) if is_tail => {
                        tracing::warn!(
                            path = %path.display(),
                            record = records,
                            %reason,
                            "discarding torn record at end of engine file"
                        );
                        break;
                    }
                    Err(reason) => {
                        return Err(StorageError::Corrupt {
                            path: path.display().to_string(),
                            record: records,
                            reason,
                        });
                    }
                }
                offset = next;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        tracing::debug!(path = %path.display(), keys = map.len(), records, "opened file engine");

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                map,
                file,
                records,
                len: valid_len,
            }),
        })
    }

    /// directory this engine lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// rewrite the record file so it holds exactly one put per live key
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut Inner) -> Result<()> {
        let temp_path = self.dir.join(COMPACT_FILE);
        let mut temp = File::create(&temp_path)?;
        for (key, value) in &inner.map {
            let record = Record::Put {
                key: key.clone(),
                value: value.clone(),
            };
            temp.write_all(&encode(&record)?)?;
        }
        temp.sync_all()?;
        fs::rename(&temp_path, self.dir.join(RECORD_FILE))?;

        inner.file = OpenOptions::new()
            .append(true)
            .open(self.dir.join(RECORD_FILE))?;
        inner.records = inner.map.len();
        inner.len = inner.file.metadata()?.len();
        tracing::debug!(dir = %self.dir.display(), keys = inner.records, "compacted file engine");
        Ok(())
    }

    fn write(&self, record: Record) -> Result<()> {
        let bytes = encode(&record)?;
        let mut inner = self.inner.lock();

        // bytes past `len` are left over from a write that failed; drop them so
        // the next record does not land behind a torn one
        if inner.file.metadata()?.len() != inner.len {
            tracing::warn!(dir = %self.dir.display(), len = inner.len, "trimming partial record");
            inner.file.set_len(inner.len)?;
        }

        if let Err(e) = append_synced(&mut inner.file, &bytes) {
            if let Err(trim) = inner.file.set_len(inner.len) {
                tracing::error!(dir = %self.dir.display(), error = %trim, "cannot roll back failed write");
            }
            return Err(e.into());
        }
        inner.len += bytes.len() as u64;
        inner.records += 1;
        apply(&mut inner.map, record);

        if inner.records > COMPACT_MIN_RECORDS && inner.records > inner.map.len() * 4 {
            self.compact_locked(&mut inner)?;
        }
        Ok(())
    }
}

fn append_synced(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.sync_data()
}

fn encode(record: &Record) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(record)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn apply(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, record: Record) {
    match record {
        Record::Put { key, value } => {
            map.insert(key, value);
        }
        Record::Delete { key } => {
            map.remove(&key);
        }
        Record::DeletePrefix { prefix } => {
            for key in crate::keys_with_prefix(map, &prefix) {
                map.remove(&key);
            }
        }
    }
}

impl KvStore for FileKvStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(Record::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().map.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(Record::Delete { key: key.to_vec() })
    }

    fn seek_prefix_first(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(crate::first_with_prefix(&self.inner.lock().map, prefix))
    }

    fn dump_prefix(&self, prefix: &[u8], trim_prefix: bool) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        Ok(crate::dump_with_prefix(&self.inner.lock().map, prefix, trim_prefix))
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
        self.write(Record::DeletePrefix {
            prefix: prefix.to_vec(),
        })
    }

    fn seek_prefix_last(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(crate::last_with_prefix(&self.inner.lock().map, prefix))
    }

    fn seek_prefix_id_max(&self, prefix: &[u8]) -> Result<u64> {
        Ok(crate::id_max_with_prefix(&self.inner.lock().map, prefix))
    }

    fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}
