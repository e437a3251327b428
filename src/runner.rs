//! Time-bounded execution of external programs.
use crate::defaults::{CAPTURE_LIMIT, POLL_INTERVAL};
use crossbeam::channel::{self, select};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The process was terminated by a signal it did not ask for.
    Signaled,
    /// The timeout expired and the process was killed.
    TimedOut,
    /// The program does not exist.
    NotFound,
    /// The program exists but could not be started or waited on.
    SpawnFailed(String),
}

/// Everything observed about one child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// How the process ended.
    pub exit: ExitKind,
    /// Captured stdout, truncated at the capture limit.
    pub stdout: Vec<u8>,
    /// Captured stderr, truncated at the capture limit.
    pub stderr: Vec<u8>,
    /// Wall time from spawn to exit or kill.
    pub duration: Duration,
}

impl ProcessOutput {
    fn failed(exit: ExitKind, started: Instant) -> Self {
        Self {
            exit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration: started.elapsed(),
        }
    }
    /// stdout followed by stderr, lossily decoded.
    pub fn combined_output(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

/// Runs an external command to completion or until a timeout.
///
/// Implementations never return an error: every way a child can fail is
/// described by [`ExitKind`], so one misbehaving tool cannot abort its
/// neighbours.
pub trait ProcessRunner: Send + Sync {
    /// Runs `program` with `args` in `working_dir`, killing it after `timeout`.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        working_dir: &Path,
        timeout: Duration,
    ) -> ProcessOutput;
}

/// [`ProcessRunner`] backed by [`std::process::Command`].
///
/// Output streams are redirected into anonymous temporary files rather than
/// pipes, so a child that writes a lot (or a grandchild that keeps the
/// descriptors open) can never stall the wait. The files are unlinked from
/// birth and disappear with their handles on every return path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    capture_limit: Option<u64>,
}

impl SystemRunner {
    /// A runner keeping 64 KiB of each output stream.
    pub fn new() -> Self {
        Self::default()
    }
    /// Caps how many bytes of each output stream are kept.
    pub fn with_capture_limit(self, limit: u64) -> Self {
        Self {
            capture_limit: Some(limit),
        }
    }
    fn limit(&self) -> u64 {
        self.capture_limit.unwrap_or(CAPTURE_LIMIT)
    }
}

impl ProcessRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        working_dir: &Path,
        timeout: Duration,
    ) -> ProcessOutput {
        let started = Instant::now();
        let (stdout_file, stderr_file) = match (tempfile::tempfile(), tempfile::tempfile()) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                return ProcessOutput::failed(
                    ExitKind::SpawnFailed(format!("cannot capture output: {e}")),
                    started,
                )
            }
        };
        let stdio = (stdout_file.try_clone(), stderr_file.try_clone());
        let (stdout_sink, stderr_sink) = match stdio {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                return ProcessOutput::failed(
                    ExitKind::SpawnFailed(format!("cannot capture output: {e}")),
                    started,
                )
            }
        };
        debug!("running {program} {:?} in {}", args, working_dir.display());
        let spawned = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(stdout_sink)
            .stderr(stderr_sink)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return ProcessOutput::failed(ExitKind::NotFound, started)
            }
            Err(e) => return ProcessOutput::failed(ExitKind::SpawnFailed(e.to_string()), started),
        };
        let exit = match wait_with_timeout(&mut child, timeout) {
            Ok(Some(status)) => exit_kind(status),
            Ok(None) => {
                warn!("{program} exceeded {:.1}s, killing it", timeout.as_secs_f64());
                ExitKind::TimedOut
            }
            Err(e) => {
                // The child may still be alive; make sure it does not outlive us.
                let _ = child.kill();
                let _ = child.wait();
                ExitKind::SpawnFailed(e.to_string())
            }
        };
        let limit = self.limit();
        ProcessOutput {
            exit,
            stdout: read_captured(stdout_file, limit),
            stderr: read_captured(stderr_file, limit),
            duration: started.elapsed(),
        }
    }
}

/// Waits for `child`, killing and reaping it once `timeout` has passed.
///
/// Returns `Ok(None)` when the timeout fired.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let ticker = channel::tick(POLL_INTERVAL);
    let deadline = channel::after(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        select! {
            recv(ticker) -> _ => {}
            recv(deadline) -> _ => {
                // It may have exited between the poll and the deadline.
                if let Some(status) = child.try_wait()? {
                    return Ok(Some(status));
                }
                child.kill()?;
                child.wait()?;
                return Ok(None);
            }
        }
    }
}

fn exit_kind(status: ExitStatus) -> ExitKind {
    match status.code() {
        Some(code) => ExitKind::Exited(code),
        None => ExitKind::Signaled,
    }
}

fn read_captured(mut file: File, limit: u64) -> Vec<u8> {
    let mut captured = Vec::new();
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.take(limit).read_to_end(&mut captured);
    }
    captured
}
