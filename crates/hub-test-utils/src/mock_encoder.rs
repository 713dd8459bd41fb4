//! Scripted encoder launcher.
//!
//! Stands in for ffmpeg: no child process is spawned, progress is emitted on
//! a timer and exits are driven by the script. All timing uses tokio timers,
//! so tests can run it under a paused clock.
//!
//! # Example
//!
//! ```rust,ignore
//! use hub_test_utils::MockEncoderLauncher;
//!
//! let encoder = MockEncoderLauncher::builder()
//!     .ignore_stop()
//!     .build();
//! // The supervisor will have to kill this encoder after the kill timeout.
//! ```

use hub_service::recording::{
    EncoderExit, EncoderHandle, EncoderJob, EncoderLauncher, EncoderProcess, EncoderProgress,
    RecordingError,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
const FRAMES_PER_TICK: u64 = 15;
const FIRST_PID: u32 = 40_000;

#[derive(Debug, Default)]
struct Counters {
    launches: AtomicUsize,
    stop_signals: AtomicUsize,
    kills: AtomicUsize,
    exits: AtomicUsize,
    next_pid: AtomicU32,
}

#[derive(Debug, Clone, Copy)]
struct Script {
    available: bool,
    fail_launch: bool,
    crash_after: Option<Duration>,
    ignore_stop: bool,
    silent: bool,
    progress_interval: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            available: true,
            fail_launch: false,
            crash_after: None,
            ignore_stop: false,
            silent: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Encoder launcher whose processes follow a script.
///
/// Clones share counters, so a test can keep one clone and hand another to
/// the recording controller.
#[derive(Debug, Clone)]
pub struct MockEncoderLauncher {
    script: Script,
    counters: Arc<Counters>,
    jobs: Arc<Mutex<Vec<EncoderJob>>>,
}

impl Default for MockEncoderLauncher {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MockEncoderLauncher {
    #[must_use]
    pub fn builder() -> MockEncoderLauncherBuilder {
        MockEncoderLauncherBuilder::default()
    }

    /// Encoders launched so far.
    #[must_use]
    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    /// Graceful stop signals delivered.
    #[must_use]
    pub fn stop_signals(&self) -> usize {
        self.counters.stop_signals.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn kills(&self) -> usize {
        self.counters.kills.load(Ordering::SeqCst)
    }

    /// Encoders that have not exited yet.
    #[must_use]
    pub fn running(&self) -> usize {
        self.launches()
            .saturating_sub(self.counters.exits.load(Ordering::SeqCst))
    }

    /// Every job handed to `launch`, in order.
    #[must_use]
    pub fn jobs(&self) -> Vec<EncoderJob> {
        self.jobs.lock().unwrap().clone()
    }
}

/// Builder for [`MockEncoderLauncher`].
#[derive(Debug, Default)]
pub struct MockEncoderLauncherBuilder {
    script: Script,
}

impl MockEncoderLauncherBuilder {
    /// The probe fails, so recording is disabled.
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.script.available = false;
        self
    }

    /// Every launch fails.
    #[must_use]
    pub fn fail_launch(mut self) -> Self {
        self.script.fail_launch = true;
        self
    }

    /// The encoder exits with an error on its own after `after`.
    #[must_use]
    pub fn crash_after(mut self, after: Duration) -> Self {
        self.script.crash_after = Some(after);
        self
    }

    /// The encoder ignores the graceful stop signal.
    #[must_use]
    pub fn ignore_stop(mut self) -> Self {
        self.script.ignore_stop = true;
        self
    }

    /// The encoder never reports progress.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.script.silent = true;
        self
    }

    #[must_use]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.script.progress_interval = interval;
        self
    }

    #[must_use]
    pub fn build(self) -> MockEncoderLauncher {
        let counters = Counters {
            next_pid: AtomicU32::new(FIRST_PID),
            ..Counters::default()
        };
        MockEncoderLauncher {
            script: self.script,
            counters: Arc::new(counters),
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait::async_trait]
impl EncoderLauncher for MockEncoderLauncher {
    async fn probe(&self) -> Result<String, RecordingError> {
        if self.script.available {
            Ok("mock-encoder version 1.0".to_string())
        } else {
            Err(RecordingError::EncoderUnavailable(
                "mock-encoder: not installed".to_string(),
            ))
        }
    }

    async fn launch(&self, job: &EncoderJob) -> Result<EncoderHandle, RecordingError> {
        self.jobs.lock().unwrap().push(job.clone());
        if self.script.fail_launch {
            return Err(RecordingError::Spawn("mock-encoder: launch refused".to_string()));
        }

        // Leave an output file behind like a real encoder would.
        let _ = tokio::fs::write(&job.output_path, b"").await;

        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        let pid = self.counters.next_pid.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit = Arc::new(ExitCell {
            tx: exit_tx,
            counters: Arc::clone(&self.counters),
        });
        let (progress_tx, diagnostics) = mpsc::channel(64);

        tokio::spawn(drive(self.script, Arc::clone(&exit), progress_tx));

        Ok(EncoderHandle {
            process: Box::new(MockProcess {
                pid,
                ignore_stop: self.script.ignore_stop,
                exit,
                exit_rx,
                counters: Arc::clone(&self.counters),
            }),
            diagnostics,
        })
    }
}

/// Exit status shared by a process and its driver task. First write wins.
#[derive(Debug)]
struct ExitCell {
    tx: watch::Sender<Option<EncoderExit>>,
    counters: Arc<Counters>,
}

impl ExitCell {
    fn finish(&self, exit: EncoderExit) -> bool {
        let first = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
        if first {
            self.counters.exits.fetch_add(1, Ordering::SeqCst);
        }
        first
    }
}

/// Emits progress and scripted crashes until the process exits.
async fn drive(script: Script, exit: Arc<ExitCell>, progress: mpsc::Sender<EncoderProgress>) {
    let mut exited = exit.tx.subscribe();
    let mut ticker = tokio::time::interval(script.progress_interval);
    let crash = async {
        match script.crash_after {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(crash);
    let mut frames = 0u64;

    loop {
        tokio::select! {
            changed = exited.changed() => {
                if changed.is_err() || exited.borrow().is_some() {
                    break;
                }
            }
            () = &mut crash => {
                exit.finish(EncoderExit { code: Some(1), success: false });
                break;
            }
            _ = ticker.tick(), if !script.silent => {
                frames += FRAMES_PER_TICK;
                if progress.send(EncoderProgress { frames }).await.is_err() {
                    break;
                }
            }
        }
    }
}

struct MockProcess {
    pid: u32,
    ignore_stop: bool,
    exit: Arc<ExitCell>,
    exit_rx: watch::Receiver<Option<EncoderExit>>,
    counters: Arc<Counters>,
}

#[async_trait::async_trait]
impl EncoderProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal_stop(&mut self) -> Result<(), RecordingError> {
        self.counters.stop_signals.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_stop {
            self.exit.finish(EncoderExit {
                code: Some(0),
                success: true,
            });
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), RecordingError> {
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
        self.exit.finish(EncoderExit {
            code: None,
            success: false,
        });
        Ok(())
    }

    async fn wait(&mut self) -> Result<EncoderExit, RecordingError> {
        let exit = self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| RecordingError::Process(e.to_string()))?;
        (*exit).ok_or_else(|| RecordingError::Process("exit status missing".to_string()))
    }
}

impl Drop for MockProcess {
    fn drop(&mut self) {
        // Dropping a real child handle kills it.
        self.exit.finish(EncoderExit {
            code: None,
            success: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(dir: &tempfile::TempDir) -> EncoderJob {
        EncoderJob {
            sdp_path: dir.path().join("cam.sdp"),
            output_path: dir.path().join("cam.webm"),
        }
    }

    #[tokio::test]
    async fn test_probe_reflects_availability() {
        assert!(MockEncoderLauncher::default().probe().await.is_ok());
        let err = MockEncoderLauncher::builder()
            .unavailable()
            .build()
            .probe()
            .await
            .unwrap_err();
        assert!(matches!(err, RecordingError::EncoderUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockEncoderLauncher::default();
        let mut handle = launcher.launch(&job(&dir)).await.unwrap();

        let progress = handle.diagnostics.recv().await.unwrap();
        assert_eq!(progress.frames, FRAMES_PER_TICK);

        handle.process.signal_stop().unwrap();
        let exit = handle.process.wait().await.unwrap();
        assert!(exit.success);
        assert_eq!(launcher.stop_signals(), 1);
        assert_eq!(launcher.running(), 0);
        assert!(launcher.jobs().first().unwrap().output_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_stop_requires_kill() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockEncoderLauncher::builder().ignore_stop().build();
        let mut handle = launcher.launch(&job(&dir)).await.unwrap();

        handle.process.signal_stop().unwrap();
        let waited =
            tokio::time::timeout(Duration::from_secs(5), handle.process.wait()).await;
        assert!(waited.is_err());

        handle.process.kill().await.unwrap();
        let exit = handle.process.wait().await.unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(launcher.kills(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_after() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockEncoderLauncher::builder()
            .crash_after(Duration::from_secs(3))
            .build();
        let mut handle = launcher.launch(&job(&dir)).await.unwrap();

        let exit = handle.process.wait().await.unwrap();
        assert_eq!(exit.code, Some(1));
        assert_eq!(launcher.running(), 0);
    }

    #[tokio::test]
    async fn test_fail_launch_records_job() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockEncoderLauncher::builder().fail_launch().build();
        let err = launcher.launch(&job(&dir)).await.unwrap_err();
        assert!(matches!(err, RecordingError::Spawn(_)));
        assert_eq!(launcher.jobs().len(), 1);
        assert_eq!(launcher.launches(), 0);
    }
}
