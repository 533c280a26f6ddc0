//! Loading of recorded send schedules.
//!
//! A trace file holds one `<time_seconds> <size_bytes>` pair per line. Lines that
//! cannot be used are skipped with a warning; a trace never fails to load because
//! of its content, only because it cannot be read.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Cannot read trace file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
}

/// Why a trace line was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("expected `<time> <size>`, found {0} field(s)")]
    MissingField(usize),
    #[error("invalid time `{0}`")]
    InvalidTime(String),
    #[error("negative time `{0}`")]
    NegativeTime(String),
    #[error("invalid size `{0}`")]
    InvalidSize(String),
    #[error("zero size")]
    ZeroSize,
}

/// A single scheduled transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    /// Send time, relative to the start of the replay.
    pub offset: Duration,
    /// Payload size in bytes.
    pub size: u32,
}

impl TraceEntry {
    pub const fn new(offset: Duration, size: u32) -> Self {
        Self { offset, size }
    }

    /// Parses a `<time_seconds> <size_bytes>` line. Fields past the second are ignored.
    pub fn parse_line(line: &str) -> Result<Self, LineError> {
        let mut fields = line.split_whitespace();
        let (time, size) = match (fields.next(), fields.next()) {
            (Some(time), Some(size)) => (time, size),
            (Some(_), None) => return Err(LineError::MissingField(1)),
            _ => return Err(LineError::MissingField(0)),
        };

        let seconds: f64 = time.parse().map_err(|_| LineError::InvalidTime(time.to_string()))?;
        if !seconds.is_finite() {
            return Err(LineError::InvalidTime(time.to_string()));
        }
        if seconds < 0.0 {
            return Err(LineError::NegativeTime(time.to_string()));
        }

        let size: u32 = size.parse().map_err(|_| LineError::InvalidSize(size.to_string()))?;
        if size == 0 {
            return Err(LineError::ZeroSize);
        }

        let offset = Duration::try_from_secs_f64(seconds)
            .map_err(|_| LineError::InvalidTime(time.to_string()))?;

        Ok(Self { offset, size })
    }
}

/// An immutable send schedule, kept in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    entries: Vec<TraceEntry>,
    skipped: usize,
}

impl Trace {
    /// Builds a trace from entries that are already known to be valid.
    pub fn from_entries(entries: Vec<TraceEntry>) -> Self {
        Self { entries, skipped: 0 }
    }

    /// Loads a trace file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let unreadable = |source| TraceError::Unreadable { path: path.to_path_buf(), source };

        let file = File::open(path).map_err(unreadable)?;
        let trace = Self::from_reader(BufReader::new(file)).map_err(|e| match e {
            TraceError::Io(source) => unreadable(source),
            other => other,
        })?;

        debug!(path = %path.display(), entries = trace.len(), skipped = trace.skipped, "Loaded trace");
        Ok(trace)
    }

    /// Reads a trace line by line. Fails only if the reader does.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, TraceError> {
        let mut trace = Self::default();
        for (idx, line) in reader.lines().enumerate() {
            trace.push_line(idx + 1, &line?);
        }
        trace.check_order();

        Ok(trace)
    }

    /// Parses a trace held in memory.
    pub fn parse(text: &str) -> Self {
        let mut trace = Self::default();
        for (idx, line) in text.lines().enumerate() {
            trace.push_line(idx + 1, line);
        }
        trace.check_order();

        trace
    }

    fn push_line(&mut self, number: usize, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        match TraceEntry::parse_line(line) {
            Ok(entry) => self.entries.push(entry),
            Err(e) => {
                warn!(line = number, reason = %e, "Skipping malformed trace line");
                self.skipped += 1;
            }
        }
    }

    /// Replay follows file order regardless; this only reports it.
    fn check_order(&self) {
        if let Some(idx) = self.entries.windows(2).position(|w| w[1].offset < w[0].offset) {
            debug!(entry = idx + 1, "Trace timestamps are not monotonic, replaying in file order");
        }
    }

    #[inline]
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&TraceEntry> {
        self.entries.get(idx)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of non-blank lines that were skipped as malformed.
    #[inline]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.size)).sum()
    }

    /// The largest offset in the trace.
    pub fn duration(&self) -> Duration {
        self.entries.iter().map(|e| e.offset).max().unwrap_or_default()
    }
}
