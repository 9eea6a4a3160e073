//! Error types for image mounting and sector access

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for image operations
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors surfaced by `mount()` are the same taxonomy as read-path errors
pub type MountError = ImageError;

/// Errors that can occur while mounting or reading an image
///
/// Mount failures carry the specific variant so a front end can tell a
/// missing file from an unparsable geometry from an unreadable CHD hunk.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("CUE sheet syntax error on line {line}: {message}")]
    BadCueSyntax { line: usize, message: String },

    #[error("track file not found: {}", .0.display())]
    TrackFileNotFound(PathBuf),

    #[error("unsupported sector size: {0}")]
    UnsupportedSectorSize(String),

    #[error("could not extract drive geometry from image; specify sector size, sectors per track, heads and cylinders")]
    GeometryUndetectable,

    #[error("no bootable El Torito floppy image found")]
    ElToritoNotFound,

    #[error("CHD hunk {hunk} read failed: {message}")]
    ChdHunkReadFailed { hunk: u32, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// CHD container could not be opened or its metadata is unusable
    #[error("CHD error: {0}")]
    Chd(String),

    /// Compressed audio track could not be probed or decoded
    #[error("audio decode error: {0}")]
    Audio(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("sector {sector} is out of range")]
    SectorOutOfRange { sector: u64 },

    #[error("image is mounted read-only")]
    ReadOnly,

    #[error("audio is already playing a different range; stop it first")]
    PlayerBusy,

    #[error("drive index {0} is out of range (0-25)")]
    InvalidDrive(u8),

    #[error("drive index {0} has no image mounted")]
    DriveEmpty(u8),

    #[error("operation requires a CD-ROM image")]
    NotACdrom,
}

impl ImageError {
    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ImageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn cue(line: usize, message: impl Into<String>) -> Self {
        ImageError::BadCueSyntax {
            line,
            message: message.into(),
        }
    }
}

impl From<chd::Error> for ImageError {
    fn from(err: chd::Error) -> Self {
        ImageError::Chd(err.to_string())
    }
}

impl From<symphonia::core::errors::Error> for ImageError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        ImageError::Audio(err.to_string())
    }
}
