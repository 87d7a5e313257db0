//! Line-oriented recovery log.
//!
//! Every committed root and lifecycle transition is appended as a line
//! `CODE|timestampMicros|payload\n` to the active `log.*` file in the
//! database directory. Startup replays nothing; it projects the latest
//! event per code across all log files and refuses to open a database
//! whose newest log does not terminate with `CLOSED`.
//!
//! Timestamps are unique and strictly increasing within a process, so
//! log files can be ordered by their last event.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use sealkv_storage::BlockRef;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Event codes carried in the first field of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventCode {
    /// A committed root ref (payload: hex of the binary ref encoding).
    Head,
    /// Clean shutdown marker (empty payload).
    Closed,
    /// Store state snapshot (payload: live segment count).
    State,
    /// Rotation: the next log file's name, appended to the old file.
    SwitchTo,
    /// Rotation: the previous log file's name, opening the new file.
    SwitchedFrom,
}

impl EventCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Head => "HEAD",
            Self::Closed => "CLOSED",
            Self::State => "STATE",
            Self::SwitchTo => "SWITCH_TO",
            Self::SwitchedFrom => "SWITCHED_FROM",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "HEAD" => Some(Self::Head),
            "CLOSED" => Some(Self::Closed),
            "STATE" => Some(Self::State),
            "SWITCH_TO" => Some(Self::SwitchTo),
            "SWITCHED_FROM" => Some(Self::SwitchedFrom),
            _ => None,
        }
    }
}

/// A parsed log line.
#[derive(Debug, Clone)]
struct LogEvent {
    code: EventCode,
    timestamp_micros: u64,
    payload: String,
}

impl LogEvent {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.splitn(3, '|');
        let code = EventCode::parse(fields.next()?)?;
        let timestamp_micros = fields.next()?.parse().ok()?;
        let payload = fields.next()?.to_owned();
        Some(Self {
            code,
            timestamp_micros,
            payload,
        })
    }
}

/// Issues unique, strictly increasing microsecond timestamps.
#[derive(Debug, Default)]
pub(crate) struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Current wall-clock micros, bumped past any previously issued value.
    pub(crate) fn now_micros(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }

    fn advance_to(&self, micros: u64) {
        self.last.fetch_max(micros, Ordering::AcqRel);
    }
}

/// State recovered from the log files at open.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    /// Root ref from the latest `HEAD` event, if any commit happened.
    pub(crate) root: Option<BlockRef>,
    /// Segment count from the latest `STATE` event.
    pub(crate) segment_count: Option<u64>,
}

#[derive(Debug)]
struct ActiveLog {
    file: File,
    name: String,
    len: u64,
    last_head: Option<String>,
}

/// Append-only log over `log.*` files in the database directory.
#[derive(Debug)]
pub(crate) struct RecoveryLog {
    dir: PathBuf,
    rotate_size: u64,
    clock: MonotonicClock,
    active: Mutex<ActiveLog>,
}

impl RecoveryLog {
    /// Starts a fresh log in an empty database directory.
    pub(crate) fn create(dir: &Path, rotate_size: u64) -> CoreResult<Self> {
        let name = fresh_log_name();
        let file = create_log_file(dir, &name)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            rotate_size,
            clock: MonotonicClock::default(),
            active: Mutex::new(ActiveLog {
                file,
                name,
                len: 0,
                last_head: None,
            }),
        })
    }

    /// Opens the log of an existing database.
    ///
    /// Projects the latest event per code across all `log.*` files,
    /// requires the newest file to terminate with `CLOSED`, then starts
    /// a new active file chained to it.
    pub(crate) fn open(dir: &Path, rotate_size: u64) -> CoreResult<(Self, Recovered)> {
        let mut files = scan_log_files(dir)?;
        if files.is_empty() {
            return Err(CoreError::MissingLogFile(dir.join("log.*")));
        }

        // Newest file = the one holding the most recent event.
        files.sort_by_key(|f| f.last_timestamp);
        let newest = files.last().expect("at least one log file");
        if newest.last_code != Some(EventCode::Closed) {
            return Err(CoreError::RecoveryRequired);
        }

        let mut latest_head: Option<LogEvent> = None;
        let mut latest_state: Option<LogEvent> = None;
        let mut max_timestamp = 0u64;
        for file in &files {
            max_timestamp = max_timestamp.max(file.last_timestamp);
            for event in [&file.last_head, &file.last_state] {
                let Some(event) = event else { continue };
                let slot = match event.code {
                    EventCode::Head => &mut latest_head,
                    _ => &mut latest_state,
                };
                if slot
                    .as_ref()
                    .is_none_or(|held| held.timestamp_micros < event.timestamp_micros)
                {
                    *slot = Some(event.clone());
                }
            }
        }

        let root = latest_head
            .as_ref()
            .map(|e| decode_head_payload(&e.payload))
            .transpose()?;
        let segment_count = latest_state.and_then(|e| e.payload.parse().ok());

        let clock = MonotonicClock::default();
        clock.advance_to(max_timestamp);

        let name = fresh_log_name();
        let file = create_log_file(dir, &name)?;
        let log = Self {
            dir: dir.to_path_buf(),
            rotate_size,
            clock,
            active: Mutex::new(ActiveLog {
                file,
                name,
                len: 0,
                last_head: latest_head.map(|e| e.payload),
            }),
        };
        {
            let chained_from = newest.name.clone();
            let mut active = log.active.lock();
            log.write_line(&mut active, EventCode::SwitchedFrom, &chained_from)?;
            if let Some(head) = active.last_head.clone() {
                log.write_line(&mut active, EventCode::Head, &head)?;
            }
        }
        Ok((log, Recovered { root, segment_count }))
    }

    /// Records a newly committed root.
    pub(crate) fn append_head(&self, root: &BlockRef) -> CoreResult<()> {
        self.append(EventCode::Head, &hex_encode(&root.to_bytes()))
    }

    /// Records the live segment count.
    pub(crate) fn append_state(&self, segment_count: u64) -> CoreResult<()> {
        self.append(EventCode::State, &segment_count.to_string())
    }

    /// Marks a clean shutdown. Must be the final event of the file.
    pub(crate) fn append_closed(&self) -> CoreResult<()> {
        self.append(EventCode::Closed, "")
    }

    /// Flushes the active file to disk.
    pub(crate) fn sync(&self) -> CoreResult<()> {
        self.active.lock().file.sync_all()?;
        Ok(())
    }

    fn append(&self, code: EventCode, payload: &str) -> CoreResult<()> {
        let mut active = self.active.lock();
        if active.len > self.rotate_size {
            self.rotate(&mut active)?;
        }
        self.write_line(&mut active, code, payload)?;
        if code == EventCode::Head {
            active.last_head = Some(payload.to_owned());
        }
        Ok(())
    }

    fn write_line(&self, active: &mut ActiveLog, code: EventCode, payload: &str) -> CoreResult<()> {
        let line = format!("{}|{}|{}\n", code.as_str(), self.clock.now_micros(), payload);
        active.file.write_all(line.as_bytes())?;
        active.len += line.len() as u64;
        Ok(())
    }

    /// Chains a fresh file onto the active one, restating the latest
    /// head so recovery never has to look past the newest file for the
    /// current root.
    fn rotate(&self, active: &mut ActiveLog) -> CoreResult<()> {
        let new_name = fresh_log_name();
        self.write_line(active, EventCode::SwitchTo, &new_name)?;
        active.file.sync_all()?;

        let file = create_log_file(&self.dir, &new_name)?;
        let old_name = std::mem::replace(&mut active.name, new_name);
        active.file = file;
        active.len = 0;
        tracing::debug!(from = %old_name, to = %active.name, "rotated recovery log");

        self.write_line(active, EventCode::SwitchedFrom, &old_name)?;
        if let Some(head) = active.last_head.clone() {
            self.write_line(active, EventCode::Head, &head)?;
        }
        Ok(())
    }
}

struct ScannedFile {
    name: String,
    last_timestamp: u64,
    last_code: Option<EventCode>,
    last_head: Option<LogEvent>,
    last_state: Option<LogEvent>,
}

fn scan_log_files(dir: &Path) -> CoreResult<Vec<ScannedFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("log.") || !entry.file_type()?.is_file() {
            continue;
        }
        files.push(scan_log_file(&entry.path(), name)?);
    }
    Ok(files)
}

fn scan_log_file(path: &Path, name: String) -> CoreResult<ScannedFile> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CoreError::corrupt_log(format!("{}: {e}", path.display())))?;

    let mut scanned = ScannedFile {
        name,
        last_timestamp: 0,
        last_code: None,
        last_head: None,
        last_state: None,
    };
    let lines: Vec<&str> = contents.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let Some(event) = LogEvent::parse(line) else {
            // A torn final line is an unclean shutdown, reported as
            // RecoveryRequired by the caller. Anything else is damage.
            if i + 1 == lines.len() && !contents.ends_with('\n') {
                scanned.last_code = None;
                break;
            }
            return Err(CoreError::corrupt_log(format!(
                "{}: malformed line {}",
                path.display(),
                i + 1
            )));
        };
        scanned.last_timestamp = scanned.last_timestamp.max(event.timestamp_micros);
        scanned.last_code = Some(event.code);
        match event.code {
            EventCode::Head => scanned.last_head = Some(event),
            EventCode::State => scanned.last_state = Some(event),
            _ => {}
        }
    }
    Ok(scanned)
}

fn fresh_log_name() -> String {
    format!("log.{}", Uuid::new_v4().simple())
}

fn create_log_file(dir: &Path, name: &str) -> CoreResult<File> {
    let file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(dir.join(name))?;
    Ok(file)
}

fn decode_head_payload(payload: &str) -> CoreResult<BlockRef> {
    let bytes = hex_decode(payload)
        .ok_or_else(|| CoreError::corrupt_log("head payload is not valid hex"))?;
    BlockRef::from_bytes(&bytes).map_err(|e| CoreError::corrupt_log(e.to_string()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
