#![forbid(unsafe_code)]
//! Log facility consumed by the page contexts plus two reference logs.

mod record;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::primitives::bytes::fixed::{read_u32, read_u64};
use crate::types::checksum::crc32_of;
use crate::types::{ArborError, Lsn, Result};

pub use record::{LogRecord, PageOperation};

/// Bytes in front of every [`FileLog`] payload.
pub const FRAME_HEADER_LEN: usize = 25;

/// Kind of a logged record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogKind {
    /// Forward change.
    Update,
    /// Compensation written while undoing a change.
    Compensation,
}

impl LogKind {
    fn as_u8(self) -> u8 {
        match self {
            LogKind::Update => 1,
            LogKind::Compensation => 2,
        }
    }

    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(LogKind::Update),
            2 => Ok(LogKind::Compensation),
            _ => Err(ArborError::Corruption("unknown log frame kind")),
        }
    }
}

/// Record together with the position the log assigned to it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoggedRecord {
    /// Assigned LSN.
    pub lsn: Lsn,
    /// Update or compensation.
    pub kind: LogKind,
    /// For compensations, the next LSN to undo.
    pub undo_next: Option<Lsn>,
    /// The record.
    pub record: LogRecord,
}

/// Append-only log the page contexts write their changes to.
pub trait LogFacility: Send + Sync {
    /// Appends a forward record.
    fn log_update(&self, record: &LogRecord) -> Result<Lsn>;
    /// Appends a compensation record chained to `undo_next`.
    fn log_clr(&self, record: &LogRecord, undo_next: Lsn) -> Result<Lsn>;
}

/// In-memory log keeping every record.
#[derive(Debug)]
pub struct MemoryLog {
    next_lsn: AtomicU64,
    records: Mutex<Vec<LoggedRecord>>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self {
            next_lsn: AtomicU64::new(1),
            records: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryLog {
    /// Creates an empty log whose first LSN is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything logged so far.
    pub fn records(&self) -> Vec<LoggedRecord> {
        self.records.lock().clone()
    }

    /// Number of logged records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, record: &LogRecord, kind: LogKind, undo_next: Option<Lsn>) -> Lsn {
        let mut records = self.records.lock();
        let lsn = Lsn(self.next_lsn.fetch_add(1, Ordering::Relaxed));
        records.push(LoggedRecord {
            lsn,
            kind,
            undo_next,
            record: record.clone(),
        });
        trace!(lsn = lsn.0, kind = ?kind, page = record.page.0, "log.append");
        lsn
    }
}

impl LogFacility for MemoryLog {
    fn log_update(&self, record: &LogRecord) -> Result<Lsn> {
        Ok(self.append(record, LogKind::Update, None))
    }

    fn log_clr(&self, record: &LogRecord, undo_next: Lsn) -> Result<Lsn> {
        Ok(self.append(record, LogKind::Compensation, Some(undo_next)))
    }
}

fn frame_crc(header: &[u8], payload: &[u8]) -> u32 {
    crc32_of(&[&header[4..21], payload])
}

fn encode_frame(lsn: Lsn, kind: LogKind, undo_next: Option<Lsn>, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| ArborError::Invalid("log record too large"))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&lsn.0.to_be_bytes());
    frame.push(kind.as_u8());
    frame.extend_from_slice(&undo_next.map_or(0, |lsn| lsn.0).to_be_bytes());
    let crc = frame_crc(&frame, payload);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Iterates the frames of a log image. A torn final frame ends iteration;
/// a checksum mismatch on a complete frame is corruption.
pub struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    /// Reader over a complete log image.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Offset just past the last complete frame returned.
    pub fn valid_up_to(&self) -> usize {
        self.offset
    }

    /// Next frame, `None` at the end or at a torn tail.
    pub fn next_frame(&mut self) -> Result<Option<LoggedRecord>> {
        let rest = &self.data[self.offset..];
        if rest.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = read_u32(rest, 0) as usize;
        if rest.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let header = &rest[..FRAME_HEADER_LEN];
        let payload = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        if frame_crc(header, payload) != read_u32(header, 21) {
            return Err(ArborError::Corruption("log frame checksum mismatch"));
        }
        let lsn = Lsn(read_u64(header, 4));
        let kind = LogKind::from_u8(header[12])?;
        let undo_next = match read_u64(header, 13) {
            0 => None,
            raw => Some(Lsn(raw)),
        };
        let record = LogRecord::decode(payload)?;
        self.offset += FRAME_HEADER_LEN + len;
        Ok(Some(LoggedRecord {
            lsn,
            kind,
            undo_next,
            record,
        }))
    }
}

struct FileLogState {
    file: File,
    next_lsn: u64,
    bytes: u64,
}

/// Append-only log file of checksummed frames.
pub struct FileLog {
    path: PathBuf,
    state: Mutex<FileLogState>,
}

impl FileLog {
    /// Opens or creates the log at `path`. A torn tail left by a crash is
    /// truncated and LSNs continue after the last complete frame.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        let mut reader = FrameReader::new(&image);
        let mut last = 0;
        while let Some(frame) = reader.next_frame()? {
            last = frame.lsn.0;
        }
        let valid = reader.valid_up_to() as u64;
        if valid != image.len() as u64 {
            debug!(path = %path.display(), valid, len = image.len(), "log.truncate_tail");
            file.set_len(valid)?;
        }
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(FileLogState {
                file,
                next_lsn: last + 1,
                bytes: valid,
            }),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of complete frames in the file.
    pub fn len_bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    /// Flushes appended frames to stable storage.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        state.file.sync_data()?;
        Ok(())
    }

    /// Reads every complete frame of the log at `path`.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LoggedRecord>> {
        let image = match std::fs::read(path.as_ref()) {
            Ok(image) => image,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut reader = FrameReader::new(&image);
        let mut out = Vec::new();
        while let Some(frame) = reader.next_frame()? {
            out.push(frame);
        }
        Ok(out)
    }

    fn append(&self, record: &LogRecord, kind: LogKind, undo_next: Option<Lsn>) -> Result<Lsn> {
        let payload = record.to_bytes()?;
        let mut state = self.state.lock();
        let lsn = Lsn(state.next_lsn);
        let frame = encode_frame(lsn, kind, undo_next, &payload)?;
        state.file.write_all(&frame)?;
        state.next_lsn += 1;
        state.bytes += frame.len() as u64;
        trace!(lsn = lsn.0, kind = ?kind, len = frame.len(), "log.append");
        Ok(lsn)
    }
}

impl LogFacility for FileLog {
    fn log_update(&self, record: &LogRecord) -> Result<Lsn> {
        self.append(record, LogKind::Update, None)
    }

    fn log_clr(&self, record: &LogRecord, undo_next: Lsn) -> Result<Lsn> {
        self.append(record, LogKind::Compensation, Some(undo_next))
    }
}

impl std::fmt::Debug for FileLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLog").field("path", &self.path).finish()
    }
}
