//! Append-only freeze-event log.
//!
//! Every watchdog escalation appends one [`FreezeEvent`] as a single JSON
//! line.  Lines are only ever appended, never rewritten, so a crash in the
//! middle of an escalation can at worst truncate the final line.
//!
//! # File format
//!
//! ```text
//! {"timestamp":"2026-10-15T08:00:00Z","event":"watchdog_escalation","consecutive_misses":6,"last_heartbeat_time":null,"safety_mode_entered":"safe"}
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use vigil_types::SafetyLevel;

/// One durable escalation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeEvent {
    pub timestamp: DateTime<Utc>,
    /// e.g. `"watchdog_escalation"`.
    pub event: String,
    pub consecutive_misses: u32,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// `None` when the safety-mode step failed.
    pub safety_mode_entered: Option<SafetyLevel>,
}

/// Handle to a JSON-Lines freeze-event file.
#[derive(Debug, Clone)]
pub struct FreezeLog {
    path: PathBuf,
}

impl FreezeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `event` and flush it to disk.
    pub fn append(&self, event: &FreezeEvent) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.sync_data()
    }

    /// Read every well-formed entry, oldest first.  Malformed lines are
    /// skipped with a warning.  A missing file reads as empty.
    pub fn read_all(&self) -> io::Result<Vec<FreezeEvent>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FreezeEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping malformed freeze-log line"
                ),
            }
        }
        Ok(events)
    }
}
