//! File-backed primary store.
//!
//! Features:
//! - append-only data log with crc32-framed records
//! - checkpointed key table with format versioning and checksum validation
//! - atomic checkpoint writes to prevent corruption
//! - background flush and compaction driven by the engine configuration
//!
//! Layout inside the store directory:
//! - `storethehash.data`: the record log, one put or tombstone per write
//! - `storethehash.index`: the latest key-table checkpoint plus the log
//!   offset it covers; on open the log is replayed from that watermark
//!
//! A torn record at the log tail is truncated away on open. A corrupt
//! checkpoint is surfaced as an error rather than silently dropped.

use crate::config::IndexConfig;
use crate::error::IndexerError;
use crate::primary::{PrimaryIter, PrimaryStorage};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

pub const DATA_FILE_NAME: &str = "storethehash.data";
pub const INDEX_FILE_NAME: &str = "storethehash.index";

/// Magic number identifying a checkpoint file.
const MAGIC: &[u8; 8] = b"IDXCORE1";

/// Current checkpoint format version - increment when the format changes.
const FORMAT_VERSION: u32 = 1;

const REC_PUT: u8 = 0;
const REC_DEL: u8 = 1;

/// tag + two u32 lengths + trailing crc32
const RECORD_OVERHEAD: u64 = 13;

/// Checkpoint file header.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointHeader {
    magic: [u8; 8],
    version: u32,
    /// CRC32 checksum of the serialized entry section.
    checksum: u32,
    entry_count: u64,
    /// Data-log offset already reflected in the entries; replay starts here.
    log_watermark: u64,
}

impl CheckpointHeader {
    fn new(checksum: u32, entry_count: u64, log_watermark: u64) -> Self {
        Self {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            checksum,
            entry_count,
            log_watermark,
        }
    }

    fn validate(&self) -> Result<(), IndexerError> {
        if &self.magic != MAGIC {
            return Err(IndexerError::Corrupt(format!(
                "checkpoint magic: expected {:?}, got {:?}",
                MAGIC, self.magic
            )));
        }
        if self.version != FORMAT_VERSION {
            return Err(IndexerError::Corrupt(format!(
                "checkpoint version: expected {}, got {}",
                FORMAT_VERSION, self.version
            )));
        }
        Ok(())
    }
}

/// Writer that only makes the target file visible on commit.
struct AtomicWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
}

impl AtomicWriter {
    fn new(path: &Path) -> Result<Self, IndexerError> {
        let final_path = path.to_path_buf();
        let temp_path = final_path.with_extension("tmp");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        Ok(Self {
            temp_path,
            final_path,
            writer: BufWriter::new(file),
        })
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IndexerError> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn commit(mut self) -> Result<(), IndexerError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        std::fs::rename(&self.temp_path, &self.final_path)?;
        Ok(())
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        // Clean up the temp file if commit wasn't reached.
        let _ = std::fs::remove_file(&self.temp_path);
    }
}

struct DataLog {
    writer: BufWriter<File>,
    /// Logical log length, including bytes still buffered in the writer.
    len: u64,
    unsynced: u64,
}

struct DiskInner {
    dir: PathBuf,
    config: IndexConfig,
    map: RwLock<HashMap<Box<[u8]>, Box<[u8]>>>,
    log: Mutex<DataLog>,
    /// Bytes of superseded records in the log; drives compaction.
    garbage: AtomicU64,
    async_error: Mutex<Option<IndexerError>>,
    closed: AtomicBool,
}

/// Embedded key-value store satisfying [`PrimaryStorage`].
///
/// The live key table is memory resident; durability comes from the record
/// log, with periodic checkpoints bounding replay time on reopen.
#[derive(Clone)]
pub struct DiskStore {
    inner: Arc<DiskInner>,
}

impl DiskStore {
    /// Open (or create) a store under `dir` and start its background flush
    /// and compaction threads.
    pub fn open(dir: impl AsRef<Path>, config: IndexConfig) -> Result<Self, IndexerError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE_NAME);
        let data_path = dir.join(DATA_FILE_NAME);

        // Capacity hint from the configured index width, clamped so small
        // deployments do not pre-reserve the full 2^24 table.
        let capacity = 1usize << config.index_bit_size.min(16);
        let mut map: HashMap<Box<[u8]>, Box<[u8]>> = HashMap::with_capacity(capacity);

        let mut watermark = 0u64;
        if index_path.exists() {
            let (entries, mark) = read_checkpoint(&index_path)?;
            watermark = mark;
            for (key, value) in entries {
                map.insert(key.into_boxed_slice(), value.into_boxed_slice());
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&data_path)?;
        let file_len = file.metadata()?.len();

        let mut garbage = 0u64;
        let mut pos = watermark.min(file_len);
        if pos < file_len {
            let mut reader = BufReader::new(file.try_clone()?);
            reader.seek(SeekFrom::Start(pos))?;
            loop {
                match read_log_record(&mut reader) {
                    Ok(Some((tag, key, value))) => {
                        let consumed = RECORD_OVERHEAD + key.len() as u64 + value.len() as u64;
                        apply_record(&mut map, &mut garbage, tag, key, value, consumed);
                        pos += consumed;
                    }
                    // Clean end of log.
                    Ok(None) => break,
                    // Torn tail from an interrupted write: drop it.
                    Err(_) => {
                        file.set_len(pos)?;
                        break;
                    }
                }
            }
        }

        let inner = Arc::new(DiskInner {
            dir,
            config,
            map: RwLock::new(map),
            log: Mutex::new(DataLog {
                writer: BufWriter::new(file),
                len: pos,
                unsynced: 0,
            }),
            garbage: AtomicU64::new(garbage),
            async_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        spawn_background(&inner);
        Ok(Self { inner })
    }

    fn check_open(&self) -> Result<(), IndexerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(IndexerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl DiskInner {
    fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE_NAME)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE_NAME)
    }

    fn append(&self, tag: u8, key: &[u8], value: &[u8]) -> Result<(), IndexerError> {
        let record = encode_record(tag, key, value);
        let mut log = self.log.lock();
        log.writer.write_all(&record)?;
        log.len += record.len() as u64;
        log.unsynced += record.len() as u64;
        // Backpressure: cap outstanding write work.
        if log.unsynced >= self.config.burst_rate {
            flush_log(&mut log)?;
        }

        let mut map = self.map.write();
        let consumed = record.len() as u64;
        match tag {
            REC_PUT => {
                if let Some(old) = map.insert(key.into(), value.into()) {
                    self.garbage.fetch_add(
                        RECORD_OVERHEAD + key.len() as u64 + old.len() as u64,
                        Ordering::Relaxed,
                    );
                }
            }
            _ => {
                // The tombstone itself is garbage the moment it lands.
                let mut reclaimed = consumed;
                if let Some(old) = map.remove(key) {
                    reclaimed += RECORD_OVERHEAD + key.len() as u64 + old.len() as u64;
                }
                self.garbage.fetch_add(reclaimed, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn flush_buffered(&self) -> Result<(), IndexerError> {
        let mut log = self.log.lock();
        flush_log(&mut log)
    }

    /// Rewrite the checkpoint from the live table and truncate the log.
    fn compact(&self) -> Result<(), IndexerError> {
        let mut log = self.log.lock();
        flush_log(&mut log)?;
        self.write_checkpoint_locked(0)?;
        log.writer.get_ref().set_len(0)?;
        log.len = 0;
        self.garbage.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn maybe_compact(&self) -> Result<bool, IndexerError> {
        let len = self.log.lock().len;
        let garbage = self.garbage.load(Ordering::Relaxed);
        if len > self.config.index_file_size || (len > 0 && garbage * 2 > len) {
            self.compact()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Caller must hold the log lock so the table and the watermark agree.
    fn write_checkpoint_locked(&self, watermark: u64) -> Result<(), IndexerError> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .map
            .read()
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        let body = bincode::serialize(&entries)?;
        let header = CheckpointHeader::new(crc32fast::hash(&body), entries.len() as u64, watermark);
        let header_bytes = bincode::serialize(&header)?;

        let mut writer = AtomicWriter::new(&self.index_path())?;
        writer.write_all(&header_bytes)?;
        writer.write_all(&body)?;
        writer.commit()
    }
}

impl PrimaryStorage for DiskStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        self.check_open()?;
        Ok(self.inner.map.read().get(key).map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexerError> {
        self.check_open()?;
        self.inner.append(REC_PUT, key, value)
    }

    fn remove(&self, key: &[u8]) -> Result<bool, IndexerError> {
        self.check_open()?;
        if !self.inner.map.read().contains_key(key) {
            return Ok(false);
        }
        self.inner.append(REC_DEL, key, &[])?;
        Ok(true)
    }

    fn flush(&self) -> Result<(), IndexerError> {
        self.check_open()?;
        let deferred = self.inner.async_error.lock().take();
        self.inner.flush_buffered()?;
        match deferred {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<(), IndexerError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut log = self.inner.log.lock();
        flush_log(&mut log)?;
        self.inner.write_checkpoint_locked(log.len)
    }

    fn iter(&self) -> Result<PrimaryIter<'_>, IndexerError> {
        self.check_open()?;
        // Push buffered records to the OS so the scan handle observes them.
        let end = {
            let mut log = self.inner.log.lock();
            log.writer.flush()?;
            log.len
        };

        let index_path = self.inner.index_path();
        let snapshot = if index_path.exists() {
            read_checkpoint(&index_path)?.0
        } else {
            Vec::new()
        };

        let file = File::open(self.inner.data_path())?;
        Ok(Box::new(DiskIter {
            snapshot: snapshot.into_iter(),
            reader: BufReader::new(file),
            pos: 0,
            end,
            done: false,
        }))
    }

    fn storage_size(&self) -> Result<u64, IndexerError> {
        self.check_open()?;
        let index_size = match std::fs::metadata(self.inner.index_path()) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(index_size + self.inner.log.lock().len)
    }
}

/// Scan over the checkpoint segment followed by the log segment. A key
/// rewritten since the last checkpoint surfaces in both.
struct DiskIter {
    snapshot: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    reader: BufReader<File>,
    pos: u64,
    end: u64,
    done: bool,
}

impl Iterator for DiskIter {
    type Item = Result<(Vec<u8>, Vec<u8>), IndexerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.snapshot.next() {
            return Some(Ok(entry));
        }
        if self.done || self.pos >= self.end {
            return None;
        }
        match read_log_record(&mut self.reader) {
            Ok(Some((_, key, value))) => {
                self.pos += RECORD_OVERHEAD + key.len() as u64 + value.len() as u64;
                Some(Ok((key, value)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn flush_log(log: &mut DataLog) -> Result<(), IndexerError> {
    log.writer.flush()?;
    log.writer.get_ref().sync_data()?;
    log.unsynced = 0;
    Ok(())
}

fn encode_record(tag: u8, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_OVERHEAD as usize + key.len() + value.len());
    out.push(tag);
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Read one log record. `Ok(None)` is a clean end of the stream; any
/// short read or checksum mismatch is reported as corruption and the
/// caller decides whether that means a torn tail or a failed scan.
fn read_log_record<R: Read>(
    reader: &mut R,
) -> Result<Option<(u8, Vec<u8>, Vec<u8>)>, IndexerError> {
    let corrupt = |why: &str| IndexerError::Corrupt(format!("log record: {}", why));

    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if tag[0] != REC_PUT && tag[0] != REC_DEL {
        return Err(corrupt("unknown tag"));
    }

    let mut lens = [0u8; 8];
    reader
        .read_exact(&mut lens)
        .map_err(|_| corrupt("truncated header"))?;
    let klen = u32::from_le_bytes([lens[0], lens[1], lens[2], lens[3]]) as usize;
    let vlen = u32::from_le_bytes([lens[4], lens[5], lens[6], lens[7]]) as usize;

    let mut key = vec![0u8; klen];
    reader
        .read_exact(&mut key)
        .map_err(|_| corrupt("truncated key"))?;
    let mut value = vec![0u8; vlen];
    reader
        .read_exact(&mut value)
        .map_err(|_| corrupt("truncated value"))?;

    let mut stored_crc = [0u8; 4];
    reader
        .read_exact(&mut stored_crc)
        .map_err(|_| corrupt("truncated checksum"))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&tag);
    hasher.update(&lens);
    hasher.update(&key);
    hasher.update(&value);
    if hasher.finalize() != u32::from_le_bytes(stored_crc) {
        return Err(corrupt("checksum mismatch"));
    }

    Ok(Some((tag[0], key, value)))
}

fn apply_record(
    map: &mut HashMap<Box<[u8]>, Box<[u8]>>,
    garbage: &mut u64,
    tag: u8,
    key: Vec<u8>,
    value: Vec<u8>,
    consumed: u64,
) {
    match tag {
        REC_PUT => {
            if let Some(old) = map.insert(key.clone().into_boxed_slice(), value.into_boxed_slice())
            {
                *garbage += RECORD_OVERHEAD + key.len() as u64 + old.len() as u64;
            }
        }
        _ => {
            let mut reclaimed = consumed;
            if let Some(old) = map.remove(key.as_slice()) {
                reclaimed += RECORD_OVERHEAD + key.len() as u64 + old.len() as u64;
            }
            *garbage += reclaimed;
        }
    }
}

fn read_checkpoint(path: &Path) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, u64), IndexerError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header: CheckpointHeader = bincode::deserialize_from(&mut reader)
        .map_err(|e| IndexerError::Corrupt(format!("checkpoint header: {}", e)))?;
    header.validate()?;

    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;
    if crc32fast::hash(&body) != header.checksum {
        return Err(IndexerError::Corrupt(
            "checkpoint checksum mismatch".to_string(),
        ));
    }

    let entries: Vec<(Vec<u8>, Vec<u8>)> = bincode::deserialize(&body)
        .map_err(|e| IndexerError::Corrupt(format!("checkpoint body: {}", e)))?;
    if entries.len() as u64 != header.entry_count {
        return Err(IndexerError::Corrupt(format!(
            "checkpoint entry count: header says {}, got {}",
            header.entry_count,
            entries.len()
        )));
    }
    Ok((entries, header.log_watermark))
}

fn spawn_background(inner: &Arc<DiskInner>) {
    let sync_interval = inner.config.sync_interval;
    let weak: Weak<DiskInner> = Arc::downgrade(inner);
    thread::spawn(move || loop {
        thread::sleep(sync_interval);
        let Some(inner) = weak.upgrade() else { break };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = inner.flush_buffered() {
            *inner.async_error.lock() = Some(e);
        }
    });

    let gc_interval = inner.config.gc_interval;
    let weak: Weak<DiskInner> = Arc::downgrade(inner);
    thread::spawn(move || loop {
        thread::sleep(gc_interval);
        let Some(inner) = weak.upgrade() else { break };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = inner.maybe_compact() {
            *inner.async_error.lock() = Some(e);
        }
    });
}
