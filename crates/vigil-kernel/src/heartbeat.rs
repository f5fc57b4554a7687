//! [`HeartbeatMonitor`] – checksummed liveness record.
//!
//! The supervised process periodically calls [`HeartbeatMonitor::write`];
//! the watchdog calls [`HeartbeatMonitor::check`].  The record is a small
//! JSON document whose `checksum` field is the sha256 of the canonical form
//! of every other field:
//!
//! ```text
//! {"pid":4242,"status":"alive","timestamp":"2026-10-15T08:00:00.123456Z","trust_score":50.0}
//! ```
//!
//! Keys are sorted and the timestamp is rendered with microsecond precision,
//! so the checksum is stable across a write/read cycle.  A record whose
//! checksum does not match, or whose pid cannot name a single process, is
//! treated as corrupt.
//!
//! With [`HeartbeatMonitor::with_stats_file`] the monitor also keeps beat
//! timing statistics on disk so they survive a restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use vigil_memory::atomic::{read_json, write_json_atomic};
use vigil_types::{LivenessError, VigilError};

use crate::process::is_signalable_pid;

// ────────────────────────────────────────────────────────────────────────────
// LivenessRecord
// ────────────────────────────────────────────────────────────────────────────

/// The on-disk proof-of-life written by the supervised process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub trust_score: f64,
    pub checksum: String,
}

impl LivenessRecord {
    /// Build a record stamped with the current time and a valid checksum.
    pub fn new(pid: u32, status: impl Into<String>, trust_score: f64) -> Self {
        let mut record = Self {
            pid,
            timestamp: Utc::now().trunc_subsecs(6),
            status: status.into(),
            trust_score,
            checksum: String::new(),
        };
        record.checksum = record.compute_checksum();
        record
    }

    /// sha256 hex over the canonical JSON of every field except `checksum`.
    pub fn compute_checksum(&self) -> String {
        // serde_json's default map is ordered, which gives sorted keys.
        let canonical = serde_json::json!({
            "pid": self.pid,
            "status": self.status,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            "trust_score": self.trust_score,
        });
        hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
    }

    pub fn is_intact(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Check results
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of a single [`HeartbeatMonitor::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatStatus {
    pub ok: bool,
    pub error: Option<LivenessError>,
    /// Seconds since the record was written; `None` when there is no
    /// trustworthy record.
    pub age_secs: Option<f64>,
    /// Present whenever the checksum verified, including stale records.
    pub record: Option<LivenessRecord>,
}

impl HeartbeatStatus {
    fn failed(error: LivenessError) -> Self {
        Self {
            ok: false,
            error: Some(error),
            age_secs: None,
            record: None,
        }
    }
}

/// Counters and beat timing.
///
/// Loaded from the stats file when one is configured; saved back on every
/// successful write and on [`HeartbeatMonitor::reset_stats`].  Checks only
/// update the in-memory copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatStats {
    pub total_writes: u64,
    pub total_checks: u64,
    /// Failed checks plus failed writes.
    pub total_failures: u64,
    /// Gaps measured between consecutive writes of one monitor instance.
    /// The gap across a restart is never counted.
    pub intervals: u64,
    pub min_interval_secs: Option<f64>,
    pub max_interval_secs: Option<f64>,
    pub avg_interval_secs: Option<f64>,
    pub last_beat_time: Option<DateTime<Utc>>,
}

impl HeartbeatStats {
    fn record_interval(&mut self, secs: f64) {
        self.intervals += 1;
        self.min_interval_secs = Some(self.min_interval_secs.map_or(secs, |m| m.min(secs)));
        self.max_interval_secs = Some(self.max_interval_secs.map_or(secs, |m| m.max(secs)));
        let avg = self.avg_interval_secs.unwrap_or(0.0);
        self.avg_interval_secs = Some(avg + (secs - avg) / self.intervals as f64);
    }
}

#[derive(Debug, Default)]
struct StatsState {
    stats: HeartbeatStats,
    /// Timestamp of this instance's previous successful write.
    previous_write: Option<DateTime<Utc>>,
}

// ────────────────────────────────────────────────────────────────────────────
// HeartbeatMonitor
// ────────────────────────────────────────────────────────────────────────────

/// Writes and validates the liveness record at a fixed path.
///
/// All methods take `&self`; share the monitor between the writer and the
/// watchdog with an `Arc`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use vigil_kernel::heartbeat::HeartbeatMonitor;
///
/// let dir = tempfile::tempdir().unwrap();
/// let monitor = HeartbeatMonitor::new(dir.path().join("last_beat.json"), Duration::from_secs(10));
///
/// assert!(!monitor.check().ok);
/// monitor.write(std::process::id(), "alive", 50.0).unwrap();
/// assert!(monitor.check().ok);
/// ```
#[derive(Debug)]
pub struct HeartbeatMonitor {
    path: PathBuf,
    max_age: Duration,
    stats_path: Option<PathBuf>,
    stats: Mutex<StatsState>,
}

impl HeartbeatMonitor {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
            stats_path: None,
            stats: Mutex::new(StatsState::default()),
        }
    }

    /// Persist statistics at `path`, resuming from whatever is already there.
    /// An unreadable stats file is logged and replaced on the next write.
    pub fn with_stats_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match read_json::<HeartbeatStats>(&path) {
            Ok(Some(stats)) => {
                debug!(path = %path.display(), writes = stats.total_writes, "heartbeat stats loaded");
                self.stats.get_mut().stats = stats;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "heartbeat stats unreadable; starting fresh");
            }
        }
        self.stats_path = Some(path);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Atomically replace the liveness record.
    pub fn write(
        &self,
        pid: u32,
        status: &str,
        trust_score: f64,
    ) -> Result<LivenessRecord, VigilError> {
        let record = LivenessRecord::new(pid, status, trust_score);
        match write_json_atomic(&self.path, &record) {
            Ok(()) => {
                let mut state = self.stats.lock();
                if let Some(previous) = state.previous_write {
                    let gap = (record.timestamp - previous).to_std().unwrap_or(Duration::ZERO);
                    state.stats.record_interval(gap.as_secs_f64());
                }
                state.previous_write = Some(record.timestamp);
                state.stats.total_writes += 1;
                state.stats.last_beat_time = Some(record.timestamp);
                self.save_stats(&state.stats);
                debug!(pid, status, trust_score, "heartbeat written");
                Ok(record)
            }
            Err(e) => {
                self.stats.lock().stats.total_failures += 1;
                warn!(path = %self.path.display(), error = %e, "heartbeat write failed");
                Err(VigilError::Persistence(format!(
                    "writing {}: {e}",
                    self.path.display()
                )))
            }
        }
    }

    /// Validate the current record: present, intact, and no older than
    /// `max_age`.
    pub fn check(&self) -> HeartbeatStatus {
        let status = self.evaluate();
        let mut state = self.stats.lock();
        state.stats.total_checks += 1;
        if !status.ok {
            state.stats.total_failures += 1;
        }
        status
    }

    fn evaluate(&self) -> HeartbeatStatus {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return HeartbeatStatus::failed(LivenessError::MissingRecord);
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "liveness record unreadable");
                return HeartbeatStatus::failed(LivenessError::CorruptRecord);
            }
        };

        let record: LivenessRecord = match serde_json::from_slice(&raw) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "liveness record malformed");
                return HeartbeatStatus::failed(LivenessError::CorruptRecord);
            }
        };
        if !record.is_intact() {
            warn!(path = %self.path.display(), pid = record.pid, "liveness checksum mismatch");
            return HeartbeatStatus::failed(LivenessError::CorruptRecord);
        }
        if !is_signalable_pid(record.pid) {
            warn!(path = %self.path.display(), pid = record.pid, "liveness record names no single process");
            return HeartbeatStatus::failed(LivenessError::CorruptRecord);
        }

        // A record from the future counts as fresh.
        let age = (Utc::now() - record.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let stale = age > self.max_age;
        HeartbeatStatus {
            ok: !stale,
            error: stale.then_some(LivenessError::StaleRecord),
            age_secs: Some(age.as_secs_f64()),
            record: Some(record),
        }
    }

    pub fn stats(&self) -> HeartbeatStats {
        self.stats.lock().stats.clone()
    }

    /// Zero every counter and interval, and save the empty stats.
    ///
    /// # Errors
    ///
    /// [`VigilError::Persistence`] when the stats file cannot be written; the
    /// in-memory stats are reset regardless.
    pub fn reset_stats(&self) -> Result<(), VigilError> {
        let mut state = self.stats.lock();
        *state = StatsState::default();
        info!("heartbeat stats reset");
        match &self.stats_path {
            Some(path) => write_json_atomic(path, &state.stats).map_err(|e| {
                VigilError::Persistence(format!("writing {}: {e}", path.display()))
            }),
            None => Ok(()),
        }
    }

    fn save_stats(&self, stats: &HeartbeatStats) {
        if let Some(path) = &self.stats_path
            && let Err(e) = write_json_atomic(path, stats)
        {
            warn!(path = %path.display(), error = %e, "heartbeat stats not saved");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    fn monitor(dir: &tempfile::TempDir, max_age: Duration) -> HeartbeatMonitor {
        HeartbeatMonitor::new(dir.path().join("heartbeat").join("last_beat.json"), max_age)
    }

    #[test]
    fn missing_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        let status = m.check();
        assert!(!status.ok);
        assert_eq!(status.error, Some(LivenessError::MissingRecord));
        assert!(status.record.is_none());
    }

    #[test]
    fn fresh_record_passes() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        let written = m.write(1234, "alive", 55.5).unwrap();
        let status = m.check();
        assert!(status.ok);
        assert_eq!(status.error, None);
        assert_eq!(status.record, Some(written));
        assert!(status.age_secs.unwrap() < 10.0);
    }

    #[test]
    fn tampered_field_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        let mut record = m.write(1234, "alive", 50.0).unwrap();
        record.trust_score = 99.0;
        fs::write(m.path(), serde_json::to_vec(&record).unwrap()).unwrap();

        let status = m.check();
        assert_eq!(status.error, Some(LivenessError::CorruptRecord));
        assert!(status.record.is_none());
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        fs::create_dir_all(m.path().parent().unwrap()).unwrap();
        fs::write(m.path(), b"{\"pid\": 1, \"timest").unwrap();
        assert_eq!(m.check().error, Some(LivenessError::CorruptRecord));
    }

    fn write_raw(m: &HeartbeatMonitor, bytes: &[u8]) {
        fs::create_dir_all(m.path().parent().unwrap()).unwrap();
        fs::write(m.path(), bytes).unwrap();
    }

    #[test]
    fn altered_checksum_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        let mut record = m.write(1234, "alive", 50.0).unwrap();
        record.checksum = "0".repeat(64);
        write_raw(&m, &serde_json::to_vec(&record).unwrap());

        let status = m.check();
        assert!(!status.ok);
        assert_eq!(status.error, Some(LivenessError::CorruptRecord));
        assert!(status.record.is_none());
    }

    #[test]
    fn record_without_checksum_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        let record = m.write(1234, "alive", 50.0).unwrap();
        let mut value = serde_json::to_value(&record).unwrap();
        value.as_object_mut().unwrap().remove("checksum");
        write_raw(&m, &serde_json::to_vec(&value).unwrap());

        assert_eq!(m.check().error, Some(LivenessError::CorruptRecord));
    }

    #[test]
    fn non_json_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        write_raw(&m, b"hello");
        let status = m.check();
        assert_eq!(status.error, Some(LivenessError::CorruptRecord));
        assert!(status.age_secs.is_none());
    }

    #[test]
    fn intact_record_for_pid_zero_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        let record = LivenessRecord::new(0, "alive", 50.0);
        assert!(record.is_intact());
        write_json_atomic(m.path(), &record).unwrap();

        let status = m.check();
        assert_eq!(status.error, Some(LivenessError::CorruptRecord));
        assert!(status.record.is_none());
    }

    #[test]
    fn old_record_is_stale_but_still_returned() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(5));
        let mut record = LivenessRecord::new(77, "alive", 50.0);
        record.timestamp = (Utc::now() - chrono::Duration::seconds(60)).trunc_subsecs(6);
        record.checksum = record.compute_checksum();
        write_json_atomic(m.path(), &record).unwrap();

        let status = m.check();
        assert!(!status.ok);
        assert_eq!(status.error, Some(LivenessError::StaleRecord));
        assert_eq!(status.record.map(|r| r.pid), Some(77));
        assert!(status.age_secs.unwrap() >= 59.0);
    }

    #[test]
    fn checksum_is_stable_across_disk_roundtrip() {
        let record = LivenessRecord::new(1, "alive", 12.25);
        let json = serde_json::to_string(&record).unwrap();
        let back: LivenessRecord = serde_json::from_str(&json).unwrap();
        assert!(back.is_intact());
        assert_eq!(back.checksum.len(), 64);
    }

    #[test]
    fn stats_count_writes_checks_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        m.check();
        m.write(1, "alive", 50.0).unwrap();
        m.check();
        let stats = m.stats();
        assert_eq!(stats.total_writes, 1);
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.intervals, 0);
        assert!(stats.avg_interval_secs.is_none());
        assert!(stats.last_beat_time.is_some());
    }

    #[test]
    fn intervals_track_min_max_and_average() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(&dir, Duration::from_secs(10));
        m.write(1, "alive", 50.0).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        m.write(1, "alive", 50.0).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let last = m.write(1, "alive", 50.0).unwrap();

        let stats = m.stats();
        assert_eq!(stats.total_writes, 3);
        assert_eq!(stats.intervals, 2);
        let min = stats.min_interval_secs.unwrap();
        let max = stats.max_interval_secs.unwrap();
        let avg = stats.avg_interval_secs.unwrap();
        assert!(min >= 0.019, "min {min}");
        assert!(max >= 0.059, "max {max}");
        assert!(min <= avg && avg <= max);
        assert!((avg - (min + max) / 2.0).abs() < 1e-9);
        assert_eq!(stats.last_beat_time, Some(last.timestamp));
    }

    #[test]
    fn stats_survive_restart_without_counting_the_gap() {
        let dir = tempfile::tempdir().unwrap();
        let stats_path = dir.path().join("heartbeat").join("stats.json");
        {
            let m = monitor(&dir, Duration::from_secs(10)).with_stats_file(&stats_path);
            m.write(1, "alive", 50.0).unwrap();
            std::thread::sleep(Duration::from_millis(10));
            m.write(1, "alive", 50.0).unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));

        let m = monitor(&dir, Duration::from_secs(10)).with_stats_file(&stats_path);
        let before = m.stats();
        assert_eq!(before.total_writes, 2);
        assert_eq!(before.intervals, 1);

        m.write(1, "alive", 50.0).unwrap();
        let after = m.stats();
        assert_eq!(after.total_writes, 3);
        assert_eq!(after.intervals, 1);
        assert_eq!(after.max_interval_secs, before.max_interval_secs);

        let on_disk: HeartbeatStats = read_json(&stats_path).unwrap().unwrap();
        assert_eq!(on_disk, after);
    }

    #[test]
    fn reset_stats_clears_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let stats_path = dir.path().join("stats.json");
        let m = monitor(&dir, Duration::from_secs(10)).with_stats_file(&stats_path);
        m.write(1, "alive", 50.0).unwrap();
        m.write(1, "alive", 50.0).unwrap();
        m.check();

        m.reset_stats().unwrap();
        assert_eq!(m.stats(), HeartbeatStats::default());
        let on_disk: HeartbeatStats = read_json(&stats_path).unwrap().unwrap();
        assert_eq!(on_disk, HeartbeatStats::default());

        // The gap before the reset is not measured either.
        m.write(1, "alive", 50.0).unwrap();
        assert_eq!(m.stats().intervals, 0);
    }

    #[test]
    fn unreadable_stats_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let stats_path = dir.path().join("stats.json");
        fs::write(&stats_path, "not json").unwrap();
        let m = monitor(&dir, Duration::from_secs(10)).with_stats_file(&stats_path);
        assert_eq!(m.stats(), HeartbeatStats::default());
        m.write(1, "alive", 50.0).unwrap();
        let on_disk: HeartbeatStats = read_json(&stats_path).unwrap().unwrap();
        assert_eq!(on_disk.total_writes, 1);
    }

    #[test]
    fn concurrent_writer_and_reader_never_see_partial_record() {
        let dir = tempfile::tempdir().unwrap();
        let m = Arc::new(monitor(&dir, Duration::from_secs(10)));
        m.write(1, "alive", 50.0).unwrap();

        let writer = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                for i in 0..200 {
                    m.write(1, "alive", f64::from(i % 100)).unwrap();
                }
            })
        };
        for _ in 0..200 {
            let status = m.check();
            assert_ne!(status.error, Some(LivenessError::CorruptRecord));
            assert_ne!(status.error, Some(LivenessError::MissingRecord));
        }
        writer.join().unwrap();
    }
}
