//! [`Pulse`] – the supervised side of the heartbeat.
//!
//! A background thread that writes the liveness record every `interval`,
//! stamping it with the current trust score.  [`Pulse::pause`] stops the
//! writes without stopping the thread, which is how an operator simulates a
//! hung process and watches the watchdog react.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vigil_kernel::{HeartbeatMonitor, LivenessRecord, TrustScorer};
use vigil_types::VigilError;

struct PulseThread {
    stop_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    heartbeat: Arc<HeartbeatMonitor>,
    trust: Arc<Mutex<TrustScorer>>,
    pid: u32,
    paused: AtomicBool,
    beats: AtomicU64,
}

impl Shared {
    fn beat(&self) -> Result<LivenessRecord, VigilError> {
        let score = self.trust.lock().score();
        let record = self.heartbeat.write(self.pid, "alive", score)?;
        self.beats.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }
}

/// Periodic heartbeat writer for process `pid`.
pub struct Pulse {
    shared: Arc<Shared>,
    interval: Duration,
    join_timeout: Duration,
    thread: Mutex<Option<PulseThread>>,
}

impl Pulse {
    pub fn new(
        heartbeat: Arc<HeartbeatMonitor>,
        trust: Arc<Mutex<TrustScorer>>,
        pid: u32,
        interval: Duration,
        join_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                heartbeat,
                trust,
                pid,
                paused: AtomicBool::new(false),
                beats: AtomicU64::new(0),
            }),
            interval,
            join_timeout,
            thread: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Write one record immediately, regardless of the paused flag.
    pub fn beat_now(&self) -> Result<LivenessRecord, VigilError> {
        self.shared.beat()
    }

    /// Beats written since construction.
    pub fn beats(&self) -> u64 {
        self.shared.beats.load(Ordering::Relaxed)
    }

    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            warn!(pid = self.shared.pid, "heartbeat paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!(pid = self.shared.pid, "heartbeat resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Start the writer thread.  The first beat is written immediately.
    pub fn start(&self) -> Result<(), VigilError> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Err(VigilError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("vigil-pulse".into())
            .spawn(move || {
                loop {
                    if !shared.paused.load(Ordering::SeqCst) {
                        if let Err(e) = shared.beat() {
                            warn!(error = %e, "heartbeat write failed");
                        } else {
                            debug!(pid = shared.pid, "pulse");
                        }
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| VigilError::ProcessControl(format!("spawning pulse thread: {e}")))?;

        info!(pid = self.shared.pid, interval_ms = interval.as_millis() as u64, "heartbeat started");
        *slot = Some(PulseThread {
            stop_tx,
            done_rx,
            handle,
        });
        Ok(())
    }

    /// Stop the writer, waiting at most `join_timeout`.  Returns `false` if
    /// the thread had to be detached.
    pub fn stop(&self) -> bool {
        let Some(running) = self.thread.lock().take() else {
            return true;
        };
        let _ = running.stop_tx.send(());
        match running.done_rx.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = running.handle.join();
                info!(pid = self.shared.pid, "heartbeat stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("pulse thread did not stop in time; detaching");
                false
            }
        }
    }
}

impl Drop for Pulse {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use vigil_kernel::TrustConfig;

    fn pulse(dir: &tempfile::TempDir) -> Pulse {
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            dir.path().join("last_beat.json"),
            Duration::from_secs(5),
        ));
        let trust = Arc::new(Mutex::new(
            TrustScorer::load(dir.path().join("trust.json"), TrustConfig::default()).unwrap(),
        ));
        Pulse::new(
            heartbeat,
            trust,
            std::process::id(),
            Duration::from_millis(20),
            Duration::from_secs(2),
        )
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn beat_now_writes_a_valid_record() {
        let dir = tempfile::tempdir().unwrap();
        let p = pulse(&dir);
        let record = p.beat_now().unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.trust_score, 50.0);
        assert!(p.shared.heartbeat.check().ok);
    }

    #[test]
    fn thread_beats_until_paused() {
        let dir = tempfile::tempdir().unwrap();
        let p = pulse(&dir);
        p.start().unwrap();
        assert_eq!(p.start(), Err(VigilError::AlreadyRunning));
        assert!(wait_for(|| p.beats() >= 2));

        p.pause();
        thread::sleep(Duration::from_millis(60));
        let frozen = p.beats();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(p.beats(), frozen);

        p.resume();
        assert!(wait_for(|| p.beats() > frozen));
        assert!(p.stop());
        assert!(!p.is_running());
    }
}
