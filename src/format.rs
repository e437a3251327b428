use crate::Error;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

// Signatures from https://en.wikipedia.org/wiki/List_of_file_signatures
const JPEG_MAGIC: &[u8] = b"\xFF\xD8\xFF";
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1A\n";

/// Image container recognized by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Starts with `FF D8 FF`.
    Jpeg,
    /// Starts with the 8-byte PNG signature.
    Png,
    /// Anything else.
    Unknown,
}

impl Format {
    /// Classifies `bytes` by magic number only.
    pub fn detect(bytes: &[u8]) -> Format {
        if bytes.starts_with(PNG_MAGIC) {
            Format::Png
        } else if bytes.starts_with(JPEG_MAGIC) {
            Format::Jpeg
        } else {
            Format::Unknown
        }
    }
    /// Extension used for scratch copies handed to external tools.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Jpeg => "jpg",
            Format::Png => "png",
            Format::Unknown => "bin",
        }
    }
    /// Whether a file extension conventionally names this format.
    pub fn matches_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        match self {
            Format::Jpeg => ext == "jpg" || ext == "jpeg",
            Format::Png => ext == "png",
            Format::Unknown => false,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Jpeg => "JPEG",
            Format::Png => "PNG",
            Format::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// An input image read fully into memory.
#[derive(Debug, Clone)]
pub struct ImageFile {
    path: PathBuf,
    bytes: Vec<u8>,
    format: Format,
}

impl ImageFile {
    /// Reads `path` and detects its format from the content.
    ///
    /// Directories and unreadable paths are reported as [`Error::InputRead`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let read_error = |source| Error::InputRead {
            path: path.to_path_buf(),
            source,
        };
        let metadata = fs::metadata(path).map_err(read_error)?;
        if !metadata.is_file() {
            return Err(read_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let bytes = fs::read(path).map_err(read_error)?;
        Ok(Self::from_bytes(path, bytes))
    }
    /// Wraps bytes that are already in memory.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        let format = Format::detect(&bytes);
        Self {
            path: path.into(),
            bytes,
            format,
        }
    }
    /// Where the bytes came from.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The whole file.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
    /// Format detected from the content.
    pub fn format(&self) -> Format {
        self.format
    }
    /// `false` when the path carries an extension that names another format.
    pub fn extension_agrees(&self) -> bool {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.format.matches_extension(ext),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_magic_number() {
        assert_eq!(Format::detect(b"\x89PNG\r\n\x1A\n\0\0\0\rIHDR"), Format::Png);
        assert_eq!(Format::detect(b"\xFF\xD8\xFF\xE0\0\x10JFIF"), Format::Jpeg);
        assert_eq!(Format::detect(b"GIF89a"), Format::Unknown);
        assert_eq!(Format::detect(b""), Format::Unknown);
    }

    #[test]
    fn truncated_signatures_are_unknown() {
        assert_eq!(Format::detect(b"\x89PNG"), Format::Unknown);
        assert_eq!(Format::detect(b"\xFF\xD8"), Format::Unknown);
    }

    #[test]
    fn ignores_the_extension() {
        let file = ImageFile::from_bytes("photo.jpg", b"\x89PNG\r\n\x1A\nrest".to_vec());
        assert_eq!(file.format(), Format::Png);
        assert!(!file.extension_agrees());
        let file = ImageFile::from_bytes("photo.JPEG", b"\xFF\xD8\xFFrest".to_vec());
        assert!(file.extension_agrees());
    }

    #[test]
    fn directories_are_read_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageFile::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::InputRead { .. }));
        let err = ImageFile::open(dir.path().join("missing.png")).unwrap_err();
        assert!(matches!(err, Error::InputRead { .. }));
    }
}
