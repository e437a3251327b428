use crate::format::Format;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced to the caller for one input file.
#[derive(Error, Debug)]
pub enum Error {
    /// The content is neither JPEG nor PNG.
    #[error("{} is not a JPEG or PNG file", .path.display())]
    UnsupportedFormat {
        /// The input path.
        path: PathBuf,
    },
    /// The input is missing, a directory or unreadable.
    #[error("{} is not an image file: {source}", .path.display())]
    InputRead {
        /// The input path.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// The magic number matched but the image itself is broken.
    #[error("{} looks like a {format} file but could not be decoded: {reason}", .path.display())]
    UndecodableInput {
        /// The input path.
        path: PathBuf,
        /// The detected format.
        format: Format,
        /// Decoder message.
        reason: String,
    },
    /// A [`Registry`](crate::Registry) was rejected at construction.
    #[error("invalid optimizer registry: {0}")]
    Registry(String),
    /// Writing to a path that exists without permission to overwrite.
    #[error("refusing to overwrite existing file {}", .0.display())]
    DestinationExists(PathBuf),
    /// Writing or replacing a result failed.
    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        /// The path being written.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Why a single adapter did not produce a candidate.
///
/// These never abort an optimization run; the engine records them as
/// diagnostics next to the adapters that did succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AdapterFailure {
    /// The program is not installed.
    #[error("the executable \"{program}\" was not found")]
    ToolMissing {
        /// The program that was looked up.
        program: String,
    },
    /// The program exited with a code outside its success codes.
    #[error("exited with status {code}\n{output}")]
    NonZeroExit {
        /// The exit code.
        code: i32,
        /// Captured stdout followed by stderr.
        output: String,
    },
    /// The program was killed by a signal.
    #[error("terminated by a signal")]
    Terminated,
    /// The program ran past its timeout and was killed.
    #[error("timed out after {:.1}s", .after.as_secs_f64())]
    Timeout {
        /// The timeout that applied.
        #[serde(rename = "after_ms", serialize_with = "as_millis")]
        after: Duration,
    },
    /// The program exists but could not be started.
    #[error("could not be started: {0}")]
    Spawn(String),
    /// The program reported success but left no output.
    #[error("produced no output")]
    EmptyOutput,
    /// The output shows a different image, or could not be decoded.
    #[error("generated an invalid image: {0}")]
    EquivalenceCheckFailed(String),
    /// The output is bigger than the input.
    #[error("output of {size} bytes is larger than the original")]
    OutputLargerThanOriginal {
        /// Output size in bytes.
        size: u64,
    },
    /// The scratch directory or its files could not be used.
    #[error("could not prepare a scratch copy: {0}")]
    Scratch(String),
    /// The evaluation itself broke, e.g. a panicking thread.
    #[error("internal error: {0}")]
    Internal(String),
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
