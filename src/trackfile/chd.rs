//! CHD (MAME compressed hunks of data) track files
//!
//! The CHD stream of a CD image is a sequence of 2448-byte frames (2352 bytes
//! of sector data followed by 96 bytes of subcode). Byte offsets handed to
//! `read` are positions in that decompressed stream.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chd::Chd;
use tracing::debug;

use super::hunk_cache::{HunkCache, HunkCacheStats, HunkSource};
use crate::common::binary::bytes_to_string;
use crate::error::{ImageError, Result};

/// CHD file magic
pub const CHD_MAGIC: &[u8; 8] = b"MComprHD";

/// Raw sector plus subcode, the frame stride inside a CD CHD
pub const CHD_FRAME_SIZE: u32 = 2448;

// =============================================================================
// CHD Hunk Source
// =============================================================================

struct ChdSource {
    chd: Chd<BufReader<File>>,
    cmp_buf: Vec<u8>,
}

fn open_chd(path: &Path) -> Result<Chd<BufReader<File>>> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ImageError::TrackFileNotFound(path.to_path_buf())
        } else {
            ImageError::io(path, e)
        }
    })?;
    Ok(Chd::open(BufReader::new(file), None)?)
}

impl ChdSource {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            chd: open_chd(path)?,
            cmp_buf: Vec::new(),
        })
    }
}

impl HunkSource for ChdSource {
    fn hunk_count(&self) -> u32 {
        self.chd.header().hunk_count()
    }

    fn hunk_bytes(&self) -> u32 {
        self.chd.header().hunk_size()
    }

    fn read_hunk(&mut self, index: u32, buf: &mut [u8]) -> Result<()> {
        let mut hunk = self.chd.hunk(index)?;
        hunk.read_hunk_in(&mut self.cmp_buf, buf)?;
        Ok(())
    }
}

/// Metadata entries of a CHD as (tag, text) pairs
pub fn read_metadata(path: &Path) -> Result<Vec<(u32, String)>> {
    let mut chd = open_chd(path)?;
    let metas: Vec<chd::metadata::Metadata> = chd.metadata_refs().try_into()?;
    Ok(metas
        .into_iter()
        .map(|m| (m.metatag, bytes_to_string(&m.value)))
        .collect())
}

// =============================================================================
// CHD Track File
// =============================================================================

/// A CHD container read through the one-slot hunk cache
pub struct ChdFile {
    path: PathBuf,
    cache: HunkCache,
}

impl ChdFile {
    pub fn open(path: &Path) -> Result<Self> {
        let owned = path.to_path_buf();
        let cache = HunkCache::spawn(move || ChdSource::open(&owned))?;
        debug!(
            path = %path.display(),
            hunks = cache.hunk_count(),
            hunk_bytes = cache.hunk_bytes(),
            "Opened CHD track file"
        );
        Ok(Self {
            path: path.to_path_buf(),
            cache,
        })
    }

    /// Wrap an arbitrary hunk source (used by tests)
    pub fn from_source<S, F>(path: &Path, open: F) -> Result<Self>
    where
        S: HunkSource + 'static,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        Ok(Self {
            path: path.to_path_buf(),
            cache: HunkCache::spawn(open)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the decompressed stream in bytes
    pub fn len(&self) -> u64 {
        self.cache.hunk_count() as u64 * self.cache.hunk_bytes() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HunkCacheStats {
        self.cache.stats()
    }

    /// Copy `buf.len()` bytes from the decompressed stream at `offset`
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let hunk_bytes = self.cache.hunk_bytes() as u64;
        if hunk_bytes == 0 {
            return Err(ImageError::Chd("CHD reports zero hunk size".into()));
        }

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let hunk = u32::try_from(pos / hunk_bytes).map_err(|_| ImageError::ChdHunkReadFailed {
                hunk: u32::MAX,
                message: format!("offset {} beyond CHD", pos),
            })?;
            let within = (pos % hunk_bytes) as usize;
            let take = (buf.len() - done).min(hunk_bytes as usize - within);
            let dst = &mut buf[done..done + take];
            self.cache
                .with_hunk(hunk, |data| dst.copy_from_slice(&data[within..within + take]))?;
            done += take;
        }
        Ok(())
    }

    /// Stop the prefetch worker; called before the file is released on unmount
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackfile::hunk_cache::tests::MemorySource;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn memory_chd(hunks: u32, bytes: u32) -> ChdFile {
        ChdFile::from_source(Path::new("memory.chd"), move || {
            Ok(MemorySource {
                hunks,
                bytes,
                reads: Arc::new(AtomicU64::new(0)),
                fail_hunk: None,
            })
        })
        .unwrap()
    }

    #[test]
    fn test_read_spans_hunks() {
        let chd = memory_chd(4, 16);
        assert_eq!(chd.len(), 64);

        let mut buf = [0u8; 8];
        chd.read(&mut buf, 12).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 1, 1, 1, 1]);

        let stats = chd.stats();
        assert_eq!(stats.sync_fetches, 1);
        assert_eq!(stats.discarded_prefetches, 0);
    }

    #[test]
    fn test_read_past_end_fails() {
        let chd = memory_chd(2, 16);
        let mut buf = [0u8; 4];
        assert!(matches!(
            chd.read(&mut buf, 30),
            Err(ImageError::ChdHunkReadFailed { hunk: 2, .. })
        ));
    }

    #[test]
    fn test_missing_chd() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(ChdFile::open(&dir.path().join("none.chd")).is_err());
    }
}
