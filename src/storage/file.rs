//! Append-only event log on disk.

use super::EventStore;
use crate::error::{Result, SyncError};
use crate::types::{Event, EventInput, Sequence, Timestamp};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for each event record.
const EVENT_MAGIC: &[u8; 4] = b"EVT\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Fixed-size record prefix, including its checksum.
const HEADER_LEN: usize = 32;

const LOG_FILE: &str = "events.log";
const LOCK_FILE: &str = "LOCK";

/// File store configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// Directory holding the log and lock file.
    pub path: PathBuf,

    /// Sync every N appends (0 and 1 both mean every append).
    pub sync_interval: u64,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./history"),
            sync_interval: 1,
            create_if_missing: true,
        }
    }
}

struct Writer {
    file: File,
    /// Current file size (end of the last complete record).
    size: u64,
    writes_since_sync: u64,
}

/// Durable, single-process event store backed by one append-only file.
///
/// Record layout (little endian):
/// `magic(4) version(1) flags(1) sequence(8) timestamp(8) kind_len(2)
/// payload_len(4) header_crc32(4) kind payload body_crc32(4)`.
///
/// The header checksum covers the 28 bytes before it, so both lengths are
/// verified before the body is read. The body checksum covers kind and
/// payload.
pub struct FileStore {
    path: PathBuf,

    /// Held for the lifetime of the store for exclusive access.
    _lock_file: File,

    writer: Mutex<Writer>,

    /// Separate handle so catch-up reads don't contend with the writer.
    reader: Mutex<File>,

    /// `offsets[i]` is the file offset of the event with sequence `i + 1`.
    offsets: RwLock<Vec<u64>>,

    sync_interval: u64,
}

impl FileStore {
    /// Open an existing store or create a new one.
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(SyncError::Storage(format!(
                    "store directory {} does not exist",
                    config.path.display()
                )));
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        let log_path = config.path.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        let (offsets, size) = Self::rebuild_index(&mut file)?;
        let reader = File::open(&log_path)?;

        tracing::debug!(
            path = %config.path.display(),
            head = offsets.len(),
            "opened file store"
        );

        Ok(Self {
            path: config.path,
            _lock_file: lock_file,
            writer: Mutex::new(Writer {
                file,
                size,
                writes_since_sync: 0,
            }),
            reader: Mutex::new(reader),
            offsets: RwLock::new(offsets),
            sync_interval: config.sync_interval.max(1),
        })
    }

    /// Directory this store lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log file in bytes.
    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.join(LOCK_FILE))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;

        Ok(lock_file)
    }

    /// Scan the log, verifying every record, and build the offset index.
    ///
    /// Only a final record that runs past the end of the file is a torn
    /// write, and is cut off. Any damage to a record that fits in the file
    /// is reported.
    fn rebuild_index(file: &mut File) -> Result<(Vec<u64>, u64)> {
        let file_size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;

        let mut offsets = Vec::new();
        let mut offset = 0u64;
        let mut reader = BufReader::new(&mut *file);

        while offset < file_size {
            let remaining = file_size - offset;
            if remaining < HEADER_LEN as u64 {
                tracing::warn!(offset, discarded = remaining, "truncating torn header at end of log");
                break;
            }

            let header = decode_header(&mut reader)?;
            let len = header.record_len();
            if len > remaining {
                tracing::warn!(offset, discarded = remaining, "truncating torn record at end of log");
                break;
            }

            let expected = Sequence(offsets.len() as u64 + 1);
            if header.sequence != expected {
                return Err(SyncError::Corruption(format!(
                    "expected {:?} at offset {}, found {:?}",
                    expected, offset, header.sequence
                )));
            }
            decode_body(&mut reader, &header)?;

            offsets.push(offset);
            offset += len;
        }

        drop(reader);
        if offset < file_size {
            file.set_len(offset)?;
            file.sync_all()?;
        }

        Ok((offsets, offset))
    }

    fn read_at(&self, offset: u64, count: usize) -> Result<Vec<Event>> {
        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut *file);

        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            events.push(decode_record(&mut reader)?);
        }
        Ok(events)
    }
}

impl EventStore for FileStore {
    fn append(&self, input: &EventInput, timestamp: Timestamp) -> Result<Sequence> {
        let mut writer = self.writer.lock();
        let sequence = Sequence(self.offsets.read().len() as u64 + 1);

        let bytes = encode_record(sequence, timestamp, input)?;
        let offset = writer.size;

        let file = &mut writer.file;
        let written = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(&bytes));

        if let Err(e) = written {
            // Roll back any partial write so the failed event leaves no trace.
            let _ = writer.file.set_len(offset);
            return Err(SyncError::Io(e));
        }

        writer.writes_since_sync += 1;
        if writer.writes_since_sync >= self.sync_interval {
            if let Err(e) = writer.file.sync_all() {
                let _ = writer.file.set_len(offset);
                return Err(SyncError::Io(e));
            }
            writer.writes_since_sync = 0;
        }

        writer.size = offset + bytes.len() as u64;
        self.offsets.write().push(offset);

        Ok(sequence)
    }

    fn read_range(&self, from_exclusive: Sequence, to_inclusive: Sequence) -> Result<Vec<Event>> {
        let (start_offset, count) = {
            let offsets = self.offsets.read();
            let end = (to_inclusive.0 as usize).min(offsets.len());
            let start = (from_exclusive.0 as usize).min(end);
            if start == end {
                return Ok(Vec::new());
            }
            (offsets[start], end - start)
        };

        self.read_at(start_offset, count)
    }

    fn head(&self) -> Result<Sequence> {
        Ok(Sequence(self.offsets.read().len() as u64))
    }

    fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.sync_all()?;
        writer.writes_since_sync = 0;
        Ok(())
    }
}

fn encode_record(sequence: Sequence, timestamp: Timestamp, input: &EventInput) -> Result<Vec<u8>> {
    let kind = input.kind.as_bytes();
    let kind_len = u16::try_from(kind.len())
        .map_err(|_| SyncError::Storage(format!("kind too long: {} bytes", kind.len())))?;
    let payload_len = u32::try_from(input.payload.len()).map_err(|_| {
        SyncError::Storage(format!("payload too large: {} bytes", input.payload.len()))
    })?;

    let mut buf = Vec::with_capacity(HEADER_LEN + kind.len() + input.payload.len() + 4);
    buf.extend_from_slice(EVENT_MAGIC);
    buf.push(LOG_VERSION);
    buf.push(0u8); // flags (reserved)
    buf.extend_from_slice(&sequence.0.to_le_bytes());
    buf.extend_from_slice(&timestamp.0.to_le_bytes());
    buf.extend_from_slice(&kind_len.to_le_bytes());
    buf.extend_from_slice(&payload_len.to_le_bytes());
    let header_checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&header_checksum.to_le_bytes());

    let body_start = buf.len();
    buf.extend_from_slice(kind);
    buf.extend_from_slice(&input.payload);
    let body_checksum = crc32fast::hash(&buf[body_start..]);
    buf.extend_from_slice(&body_checksum.to_le_bytes());

    Ok(buf)
}

struct RecordHeader {
    sequence: Sequence,
    timestamp: Timestamp,
    kind_len: usize,
    payload_len: usize,
}

impl RecordHeader {
    fn record_len(&self) -> u64 {
        (HEADER_LEN + self.kind_len + self.payload_len + 4) as u64
    }
}

fn decode_header(reader: &mut impl Read) -> Result<RecordHeader> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    if &header[0..4] != EVENT_MAGIC {
        return Err(SyncError::Corruption("invalid event magic".into()));
    }
    if header[4] != LOG_VERSION {
        return Err(SyncError::Corruption(format!(
            "unsupported log version: {}",
            header[4]
        )));
    }

    let stored = u32::from_le_bytes(read_array(&header[28..32]));
    let computed = crc32fast::hash(&header[..28]);
    if stored != computed {
        return Err(SyncError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(RecordHeader {
        sequence: Sequence(u64::from_le_bytes(read_array(&header[6..14]))),
        timestamp: Timestamp(i64::from_le_bytes(read_array(&header[14..22]))),
        kind_len: u16::from_le_bytes(read_array(&header[22..24])) as usize,
        payload_len: u32::from_le_bytes(read_array(&header[24..28])) as usize,
    })
}

fn decode_body(reader: &mut impl Read, header: &RecordHeader) -> Result<Event> {
    let mut hasher = crc32fast::Hasher::new();

    let mut kind = vec![0u8; header.kind_len];
    reader.read_exact(&mut kind)?;
    hasher.update(&kind);

    let mut payload = vec![0u8; header.payload_len];
    reader.read_exact(&mut payload)?;
    hasher.update(&payload);

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(SyncError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let kind = String::from_utf8(kind).map_err(|_| {
        SyncError::Corruption(format!("kind of {:?} is not UTF-8", header.sequence))
    })?;

    Ok(Event {
        sequence: header.sequence,
        timestamp: header.timestamp,
        kind,
        payload,
    })
}

/// Decode one record.
fn decode_record(reader: &mut impl Read) -> Result<Event> {
    let header = decode_header(reader)?;
    decode_body(reader, &header)
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
