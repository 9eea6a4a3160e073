//! Track files: the byte sources behind CD-ROM tracks
//!
//! A `TrackFile` is shared by every track that points into it (a multi-track
//! CUE over one BIN), so tracks hold it as `Arc<TrackFile>`.
//!
//! Sector data comes out through `read`. Audio comes out through
//! `read_audio`, which is `read` plus byte-order fixup for binary sources and
//! `seek` + `decode` for decoded sources.

pub mod audio;
pub mod binary;
pub mod chd;
pub mod hunk_cache;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::trace;

pub use self::audio::{AudioFile, CD_AUDIO_RATE};
pub use self::binary::BinaryFile;
pub use self::chd::{ChdFile, CHD_FRAME_SIZE, CHD_MAGIC};
pub use self::hunk_cache::{HunkCache, HunkCacheStats, HunkSource};

use crate::common::binary::swap_u16_pairs;
use crate::error::{ImageError, Result};

/// How a FILE line says its contents should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Raw sectors (BINARY, MOTOROLA); CHD is detected by extension or magic
    Binary,
    /// Decoded audio (WAVE, MP3, FLAC, OGG, AIFF)
    Audio,
}

pub enum TrackFile {
    PlainBinary(BinaryFile),
    CompressedAudio(AudioFile),
    ChdHunked(ChdFile),
}

/// Whether `path` looks like a CHD container
pub fn is_chd(path: &Path) -> bool {
    let by_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("chd"));
    if by_ext {
        return true;
    }
    let mut magic = [0u8; 8];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == CHD_MAGIC)
        .unwrap_or(false)
}

impl TrackFile {
    pub fn open(path: &Path, kind: FileKind) -> Result<Self> {
        if !path.exists() {
            return Err(ImageError::TrackFileNotFound(path.to_path_buf()));
        }
        match kind {
            FileKind::Audio => Ok(TrackFile::CompressedAudio(AudioFile::open(path)?)),
            FileKind::Binary if is_chd(path) => Ok(TrackFile::ChdHunked(ChdFile::open(path)?)),
            FileKind::Binary => Ok(TrackFile::PlainBinary(BinaryFile::open(path)?)),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            TrackFile::PlainBinary(f) => f.path(),
            TrackFile::CompressedAudio(f) => f.path(),
            TrackFile::ChdHunked(f) => f.path(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            TrackFile::PlainBinary(_) => "binary",
            TrackFile::CompressedAudio(_) => "audio",
            TrackFile::ChdHunked(_) => "chd",
        }
    }

    /// Read `buf.len()` bytes at `offset`; decoded audio cannot be read this way
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        match self {
            TrackFile::PlainBinary(f) => f.read(buf, offset),
            TrackFile::ChdHunked(f) => f.read(buf, offset),
            TrackFile::CompressedAudio(f) => Err(ImageError::Audio(format!(
                "{} is a decoded audio stream and has no raw sectors",
                f.path().display()
            ))),
        }
    }

    /// Position the decoder; other variants only check the offset
    pub fn seek(&self, offset: u64) -> Result<()> {
        match self {
            TrackFile::CompressedAudio(f) => f.seek(offset),
            _ if offset <= self.length() => Ok(()),
            _ => Err(ImageError::SectorOutOfRange {
                sector: offset / crate::common::RAW_SECTOR_SIZE as u64,
            }),
        }
    }

    /// Decode PCM at the current position; returns bytes written
    pub fn decode(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            TrackFile::CompressedAudio(f) => f.decode(buf),
            other => Err(ImageError::Audio(format!(
                "{} track file has no decoder",
                other.kind_name()
            ))),
        }
    }

    /// Read little-endian stereo PCM at `offset`; returns bytes written
    ///
    /// Decoded streams that end early leave the tail of `buf` zeroed.
    pub fn read_audio(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            TrackFile::CompressedAudio(f) => {
                f.seek(offset)?;
                let n = f.decode(buf)?;
                buf[n..].fill(0);
                trace!(offset, n, "Decoded audio sector");
                Ok(n)
            }
            _ => {
                self.read(buf, offset)?;
                if self.is_big_endian() {
                    swap_u16_pairs(buf);
                }
                Ok(buf.len())
            }
        }
    }

    /// Sample rate of `read_audio`/`decode` output
    pub fn rate(&self) -> u32 {
        CD_AUDIO_RATE
    }

    pub fn channels(&self) -> u16 {
        2
    }

    /// Total length in bytes (normalized PCM bytes for decoded audio)
    pub fn length(&self) -> u64 {
        match self {
            TrackFile::PlainBinary(f) => f.len(),
            TrackFile::CompressedAudio(f) => f.len(),
            TrackFile::ChdHunked(f) => f.len(),
        }
    }

    /// Physical stride of one sector when it differs from the track's sector size
    pub fn chunk_size(&self) -> Option<u32> {
        match self {
            TrackFile::ChdHunked(_) => Some(CHD_FRAME_SIZE),
            _ => None,
        }
    }

    /// Whether audio samples are stored big-endian
    pub fn is_big_endian(&self) -> bool {
        matches!(self, TrackFile::ChdHunked(_))
    }

    /// Stop background work; the file stays valid but CHD reads fail afterwards
    pub fn shutdown(&self) {
        if let TrackFile::ChdHunked(f) = self {
            f.shutdown();
        }
    }
}
