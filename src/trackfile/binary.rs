//! Plain binary track files (BIN, IMG, ISO) served from a memory map

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::error::{ImageError, Result};

/// A raw sector dump read straight out of a read-only memory map
///
/// Sector reads from several emulated devices can share one mapping without
/// locking; nothing is ever written through it.
pub struct BinaryFile {
    path: PathBuf,
    /// None for zero-length files, which cannot be mapped
    map: Option<Mmap>,
}

impl BinaryFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ImageError::TrackFileNotFound(path.to_path_buf())
            } else {
                ImageError::io(path, e)
            }
        })?;
        let len = crate::common::binary::file_len(&file, path)?;

        let map = if len == 0 {
            None
        } else {
            // SAFETY: mapped read-only; the image is not modified while mounted
            Some(unsafe { Mmap::map(&file) }.map_err(|e| ImageError::io(path, e))?)
        };

        debug!(path = %path.display(), len, "Opened binary track file");
        Ok(Self {
            path: path.to_path_buf(),
            map,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.map.as_ref().map_or(0, |m| m.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `buf.len()` bytes starting at `offset`; short reads are errors
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.map.as_deref().unwrap_or(&[]);
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.checked_add(buf.len());
        match end {
            Some(end) if end <= data.len() => {
                buf.copy_from_slice(&data[start..end]);
                Ok(())
            }
            _ => Err(ImageError::io(
                &self.path,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at offset {} past end of file", buf.len(), offset),
                ),
            )),
        }
    }
}
