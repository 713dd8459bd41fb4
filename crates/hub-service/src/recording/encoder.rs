//! Encoder process seam.
//!
//! The recording supervisor never touches `tokio::process` directly: it asks
//! an [`EncoderLauncher`] for an [`EncoderHandle`], so tests can script the
//! encoder's behaviour. [`FfmpegLauncher`] is the production launcher.

use super::RecordingError;

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Diagnostic channel capacity. Progress lines beyond this are skipped.
const DIAGNOSTIC_BUFFER: usize = 64;

/// What one encoder run reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderJob {
    /// Capture description the encoder reads RTP parameters from.
    pub sdp_path: PathBuf,
    pub output_path: PathBuf,
}

impl EncoderJob {
    /// Command-line arguments: copy the first video stream into the output
    /// container without transcoding.
    #[must_use]
    pub fn arguments(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-nostdin",
            "-loglevel",
            "info",
            "-protocol_whitelist",
            "file,rtp,udp",
            "-fflags",
            "+genpts",
            "-i",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(self.sdp_path.clone().into_os_string());
        args.extend(["-map", "0:v:0", "-c:v", "copy", "-y"].iter().map(OsString::from));
        args.push(self.output_path.clone().into_os_string());
        args
    }
}

/// Frame progress reported on the encoder's diagnostic stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderProgress {
    /// Total frames written so far.
    pub frames: u64,
}

/// How an encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderExit {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub success: bool,
}

/// A running encoder.
#[async_trait]
pub trait EncoderProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Ask the encoder to finish the file and exit.
    fn signal_stop(&mut self) -> Result<(), RecordingError>;

    /// Terminate the encoder immediately.
    async fn kill(&mut self) -> Result<(), RecordingError>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> Result<EncoderExit, RecordingError>;
}

/// A launched encoder and its progress stream.
pub struct EncoderHandle {
    pub process: Box<dyn EncoderProcess>,
    pub diagnostics: mpsc::Receiver<EncoderProgress>,
}

impl std::fmt::Debug for EncoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderHandle")
            .field("pid", &self.process.pid())
            .finish_non_exhaustive()
    }
}

/// Starts encoder processes.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    /// Check the encoder can run. Returns its version line.
    async fn probe(&self) -> Result<String, RecordingError>;

    async fn launch(&self, job: &EncoderJob) -> Result<EncoderHandle, RecordingError>;
}

/// Launches an ffmpeg-compatible binary.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: String,
}

impl FfmpegLauncher {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn probe(&self) -> Result<String, RecordingError> {
        let output = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| RecordingError::EncoderUnavailable(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(RecordingError::EncoderUnavailable(format!(
                "{} -version exited with {}",
                self.program, output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    async fn launch(&self, job: &EncoderJob) -> Result<EncoderHandle, RecordingError> {
        let mut child = Command::new(&self.program)
            .args(job.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecordingError::Spawn(format!("{}: {e}", self.program)))?;

        let (tx, rx) = mpsc::channel(DIAGNOSTIC_BUFFER);
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_diagnostics(stderr, child.id(), tx));
        }

        debug!(
            target: "hub.recording.encoder",
            pid = ?child.id(),
            output = %job.output_path.display(),
            "Encoder spawned"
        );

        Ok(EncoderHandle {
            process: Box::new(FfmpegProcess { child }),
            diagnostics: rx,
        })
    }
}

struct FfmpegProcess {
    child: Child,
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn signal_stop(&mut self) -> Result<(), RecordingError> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|e| RecordingError::Process(format!("pid out of range: {e}")))?;
        // SAFETY: kill(2) takes no pointers; pid is our own unreaped child.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc == 0 {
            Ok(())
        } else {
            Err(RecordingError::Process(format!(
                "SIGINT failed: {}",
                std::io::Error::last_os_error()
            )))
        }
    }

    #[cfg(not(unix))]
    fn signal_stop(&mut self) -> Result<(), RecordingError> {
        self.child
            .start_kill()
            .map_err(|e| RecordingError::Process(format!("stop failed: {e}")))
    }

    async fn kill(&mut self) -> Result<(), RecordingError> {
        self.child
            .kill()
            .await
            .map_err(|e| RecordingError::Process(format!("kill failed: {e}")))
    }

    async fn wait(&mut self) -> Result<EncoderExit, RecordingError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RecordingError::Process(format!("wait failed: {e}")))?;
        Ok(EncoderExit {
            code: status.code(),
            success: status.success(),
        })
    }
}

/// Forward frame progress from the encoder's stderr.
///
/// Progress lines end in `\r`, log lines in `\n`. The stream is drained to
/// the end even when nobody listens so the encoder never blocks on a full
/// pipe.
async fn read_diagnostics<R>(stream: R, pid: Option<u32>, tx: mpsc::Sender<EncoderProgress>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut chunk = Vec::new();
    loop {
        chunk.clear();
        match reader.read_until(b'\r', &mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        for line in String::from_utf8_lossy(&chunk).split(['\r', '\n']) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(frames) = parse_progress(line) {
                let _ = tx.try_send(EncoderProgress { frames });
            } else {
                trace!(target: "hub.recording.encoder", pid = ?pid, line, "Encoder output");
            }
        }
    }
}

/// Extract the frame count from a progress line such as
/// `frame=  123 fps= 30 q=-1.0 size=...`.
#[must_use]
pub fn parse_progress(line: &str) -> Option<u64> {
    let (_, rest) = line.split_once("frame=")?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
