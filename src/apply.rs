//! Applying a winning candidate to the filesystem.
//!
//! Every write goes to a temporary file next to the destination, is flushed
//! to disk and only then renamed over the destination, so a failure at any
//! point leaves the destination exactly as it was.
use crate::optimizer::OptimizationOutcome;
use crate::Error;
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What to do with a winning candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Leave every file untouched.
    Report,
    /// Swap the input for the candidate.
    Replace,
    /// Write the candidate to `destination`. An existing file there is only
    /// replaced when `overwrite` is set.
    WriteTo {
        /// Where the candidate goes.
        destination: PathBuf,
        /// Whether an existing file may be replaced.
        overwrite: bool,
    },
}

/// What [`apply`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// There was no winning candidate; nothing was written.
    Unchanged,
    /// Report mode; nothing was written.
    Reported,
    /// The input at this path was replaced.
    Replaced(PathBuf),
    /// The candidate was written to this path.
    Written(PathBuf),
}

/// Applies `outcome` according to `mode`.
pub fn apply(outcome: &OptimizationOutcome, mode: &Mode) -> Result<Applied, Error> {
    let Some(best) = outcome.best() else {
        return Ok(Applied::Unchanged);
    };
    match mode {
        Mode::Report => Ok(Applied::Reported),
        Mode::Replace => {
            let target = outcome.path();
            let metadata = fs::metadata(target).map_err(|e| Error::filesystem(target, e))?;
            if metadata.len() != outcome.original_size() {
                return Err(Error::filesystem(
                    target,
                    io::Error::new(io::ErrorKind::Other, "file changed since it was optimized"),
                ));
            }
            let bytes = fs::read(best.path()).map_err(|e| Error::filesystem(best.path(), e))?;
            write_atomically(target, true, Some(metadata.permissions()), |file| {
                file.write_all(&bytes)
            })?;
            debug!("replaced {} with output of {}", target.display(), best.adapter());
            Ok(Applied::Replaced(target.to_path_buf()))
        }
        Mode::WriteTo {
            destination,
            overwrite,
        } => {
            let bytes = fs::read(best.path()).map_err(|e| Error::filesystem(best.path(), e))?;
            write_atomically(destination, *overwrite, None, |file| file.write_all(&bytes))?;
            debug!("wrote output of {} to {}", best.adapter(), destination.display());
            Ok(Applied::Written(destination.clone()))
        }
    }
}

/// Writes `destination` through a sibling temporary file and a rename.
pub(crate) fn write_atomically(
    destination: &Path,
    overwrite: bool,
    permissions: Option<Permissions>,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> Result<(), Error> {
    if !overwrite && destination.exists() {
        return Err(Error::DestinationExists(destination.to_path_buf()));
    }
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let fs_error = |e| Error::filesystem(destination, e);
    let mut temp = tempfile::Builder::new()
        .prefix(".optimage-")
        .tempfile_in(dir)
        .map_err(fs_error)?;
    write(temp.as_file_mut()).map_err(fs_error)?;
    temp.as_file().sync_all().map_err(fs_error)?;
    if let Some(permissions) = permissions {
        fs::set_permissions(temp.path(), permissions).map_err(fs_error)?;
    }
    let persisted = if overwrite {
        temp.persist(destination)
    } else {
        temp.persist_noclobber(destination)
    };
    persisted.map_err(|e| match e.error.kind() {
        io::ErrorKind::AlreadyExists => Error::DestinationExists(destination.to_path_buf()),
        _ => fs_error(e.error),
    })?;
    Ok(())
}
