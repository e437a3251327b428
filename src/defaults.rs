use std::time::Duration;

/// Default wall-clock budget for a single optimizer run.
pub const TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of files optimized at the same time.
pub const DEVICE: u8 = 4;
/// Bytes kept from each of stdout and stderr of a child process.
pub const CAPTURE_LIMIT: u64 = 64 * 1024;
/// How often a running child is polled for exit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Prefix of every scratch directory.
pub const SCRATCH_PREFIX: &str = "optimage-";
