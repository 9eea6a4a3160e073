// Shared binary reading utilities for image container parsers
//
// Slice decoders for the fixed-layout records (MBR, VHD footer, El Torito
// descriptors) plus seek+read helpers that attach the path to I/O errors.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{ImageError, Result};

// =============================================================================
// Slice Decoders
// =============================================================================

/// Read u16 little-endian at `offset` in `buf`
#[inline]
pub fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Read u32 little-endian at `offset` in `buf`
#[inline]
pub fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Read u16 big-endian at `offset` in `buf`
#[inline]
pub fn be_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Read u32 big-endian at `offset` in `buf`
#[inline]
pub fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Read u64 big-endian at `offset` in `buf`
#[inline]
pub fn be_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

/// Swap every pair of bytes in place (16-bit endian flip for PCM samples)
pub fn swap_u16_pairs(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

// =============================================================================
// File Reads
// =============================================================================

/// Read exactly `buf.len()` bytes at `offset`
pub fn read_exact_at(file: &mut File, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| ImageError::io(path, e))?;
    file.read_exact(buf).map_err(|e| ImageError::io(path, e))
}

/// Length of an open file in bytes
pub fn file_len(file: &File, path: &Path) -> Result<u64> {
    file.metadata()
        .map(|m| m.len())
        .map_err(|e| ImageError::io(path, e))
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Convert bytes to null-terminated string
pub fn bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_slice_integers() {
        let buf = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(le_u16(&buf, 0), 0x1234);
        assert_eq!(le_u32(&buf, 2), 0x12345678);
        assert_eq!(be_u16(&buf, 0), 0x3412);
        assert_eq!(be_u32(&buf, 2), 0x78563412);
        assert_eq!(be_u64(&buf, 6), 1);
    }

    #[test]
    fn test_swap_pairs() {
        let mut buf = [1u8, 2, 3, 4];
        swap_u16_pairs(&mut buf);
        assert_eq!(buf, [2, 1, 4, 3]);
    }

    #[test]
    fn test_read_exact_at() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[0x00, 0x00, 0x00, 0x00, 0x42, 0x43]).unwrap();
        temp.flush().unwrap();

        let mut file = File::open(temp.path()).unwrap();
        let mut buf = [0u8; 2];
        read_exact_at(&mut file, temp.path(), 4, &mut buf).unwrap();
        assert_eq!(buf, [0x42, 0x43]);
        assert_eq!(file_len(&file, temp.path()).unwrap(), 6);

        let err = read_exact_at(&mut file, temp.path(), 5, &mut buf).unwrap_err();
        assert!(matches!(err, ImageError::Io { .. }));
    }

    #[test]
    fn test_bytes_to_string() {
        assert_eq!(bytes_to_string(b"hello\x00world"), "hello");
        assert_eq!(bytes_to_string(b"no null"), "no null");
    }
}
