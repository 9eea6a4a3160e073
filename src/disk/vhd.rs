//! Virtual PC / Hyper-V VHD images (fixed and dynamic)
//!
//! A VHD ends in a 512-byte big-endian footer. Fixed disks are the raw
//! sectors followed by that footer. Dynamic disks keep a copy of the footer
//! at offset 0, then a sparse header pointing at the block allocation table;
//! every allocated block starts with a sector bitmap.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, trace, warn};

use crate::common::binary::{file_len, read_exact_at};
use crate::common::{be_u16, be_u32, be_u64, DISK_SECTOR_SIZE};
use crate::error::{ImageError, Result};

use super::geometry::{geometry_from_vhd_footer, Geometry};

pub const VHD_FOOTER_COOKIE: &[u8; 8] = b"conectix";
const VHD_SPARSE_COOKIE: &[u8; 8] = b"cxsparse";
const FOOTER_SIZE: u64 = 512;
const SPARSE_HEADER_SIZE: usize = 1024;
const UNALLOCATED: u32 = 0xFFFF_FFFF;

const CHECKSUM_OFFSET: usize = 0x40;

// Upper bound for the BAT of a well-formed image (2 TiB / 512 KiB blocks)
const MAX_BAT_ENTRIES: u32 = 4 * 1024 * 1024;

/// Disk type field of the footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VhdType {
    Fixed,
    Dynamic,
    Differencing,
    Other(u32),
}

impl From<u32> for VhdType {
    fn from(value: u32) -> Self {
        match value {
            2 => VhdType::Fixed,
            3 => VhdType::Dynamic,
            4 => VhdType::Differencing,
            other => VhdType::Other(other),
        }
    }
}

/// Parsed VHD footer
#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub data_offset: u64,
    pub current_size: u64,
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
    pub disk_type: VhdType,
    raw: Vec<u8>,
}

/// One's complement of the byte sum, skipping the checksum field itself
pub fn footer_checksum(raw: &[u8]) -> u32 {
    let sum = raw
        .iter()
        .take(FOOTER_SIZE as usize)
        .enumerate()
        .filter(|(i, _)| !(CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4).contains(i))
        .fold(0u32, |acc, (_, &b)| acc.wrapping_add(b as u32));
    !sum
}

impl VhdFooter {
    /// Parse a footer; `None` when the cookie or checksum does not match
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < FOOTER_SIZE as usize || &raw[..8] != VHD_FOOTER_COOKIE {
            return None;
        }
        let stored = be_u32(raw, CHECKSUM_OFFSET);
        let computed = footer_checksum(raw);
        if stored != computed {
            debug!(stored, computed, "VHD footer checksum mismatch");
            return None;
        }
        Some(Self {
            data_offset: be_u64(raw, 0x10),
            current_size: be_u64(raw, 0x30),
            cylinders: be_u16(raw, 0x38),
            heads: raw[0x3A],
            sectors_per_track: raw[0x3B],
            disk_type: VhdType::from(be_u32(raw, 0x3C)),
            raw: raw[..FOOTER_SIZE as usize].to_vec(),
        })
    }

    pub fn total_sectors(&self) -> u64 {
        self.current_size / DISK_SECTOR_SIZE as u64
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Footer geometry after BIOS folding
    pub fn geometry(&self) -> Option<Geometry> {
        geometry_from_vhd_footer(&self.raw, self.total_sectors())
    }
}

/// Block allocation state of a dynamic VHD
#[derive(Debug)]
struct SparseLayout {
    bat: Vec<u32>,
    sectors_per_block: u32,
    /// Sector bitmap size, padded to whole sectors
    bitmap_bytes: u64,
}

impl SparseLayout {
    fn read(file: &mut File, path: &Path, footer: &VhdFooter) -> Result<Self> {
        let mut header = [0u8; SPARSE_HEADER_SIZE];
        read_exact_at(file, path, footer.data_offset, &mut header)?;
        if &header[..8] != VHD_SPARSE_COOKIE {
            return Err(ImageError::InvalidImage(
                "VHD dynamic header cookie mismatch".to_string(),
            ));
        }

        let table_offset = be_u64(&header, 0x10);
        let max_entries = be_u32(&header, 0x1C);
        let block_size = be_u32(&header, 0x20);
        if block_size == 0 || block_size % DISK_SECTOR_SIZE != 0 {
            return Err(ImageError::InvalidImage(format!(
                "VHD block size {} is not a whole number of sectors",
                block_size
            )));
        }
        if max_entries > MAX_BAT_ENTRIES {
            return Err(ImageError::InvalidImage(format!(
                "VHD block table has {} entries",
                max_entries
            )));
        }

        let mut table = vec![0u8; max_entries as usize * 4];
        read_exact_at(file, path, table_offset, &mut table)?;
        let bat = table.chunks_exact(4).map(|c| be_u32(c, 0)).collect();

        let sectors_per_block = block_size / DISK_SECTOR_SIZE;
        let bitmap_sectors = (sectors_per_block as u64).div_ceil(8).div_ceil(DISK_SECTOR_SIZE as u64);

        debug!(
            table_offset,
            max_entries, block_size, bitmap_sectors, "Read VHD block allocation table"
        );
        Ok(Self {
            bat,
            sectors_per_block,
            bitmap_bytes: bitmap_sectors * DISK_SECTOR_SIZE as u64,
        })
    }
}

/// An opened fixed or dynamic VHD
pub struct VhdImage {
    path: PathBuf,
    file: Mutex<File>,
    footer: VhdFooter,
    sparse: Option<SparseLayout>,
    total_sectors: u64,
}

impl std::fmt::Debug for VhdImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhdImage")
            .field("path", &self.path)
            .field("disk_type", &self.footer.disk_type)
            .field("total_sectors", &self.total_sectors)
            .finish()
    }
}

/// True when the last 512 bytes of `path` carry the VHD cookie
pub fn has_vhd_footer(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let Ok(len) = file_len(&file, path) else {
        return false;
    };
    if len < FOOTER_SIZE {
        return false;
    }
    let mut cookie = [0u8; 8];
    read_exact_at(&mut file, path, len - FOOTER_SIZE, &mut cookie).is_ok() && &cookie == VHD_FOOTER_COOKIE
}

impl VhdImage {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ImageError::TrackFileNotFound(path.to_path_buf()),
            _ => ImageError::io(path, e),
        })?;
        let len = file_len(&file, path)?;
        if len < FOOTER_SIZE {
            return Err(ImageError::InvalidImage("file too small for a VHD footer".to_string()));
        }

        let mut raw = [0u8; FOOTER_SIZE as usize];
        read_exact_at(&mut file, path, len - FOOTER_SIZE, &mut raw)?;
        let footer = match VhdFooter::parse(&raw) {
            Some(footer) => footer,
            None => {
                read_exact_at(&mut file, path, 0, &mut raw)?;
                let copy = VhdFooter::parse(&raw).ok_or_else(|| {
                    ImageError::InvalidImage("VHD footer is damaged and has no valid copy".to_string())
                })?;
                warn!(path = %path.display(), "VHD footer damaged, using header copy");
                copy
            }
        };

        let (sparse, total_sectors) = match footer.disk_type {
            VhdType::Fixed => {
                let data_sectors = (len - FOOTER_SIZE) / DISK_SECTOR_SIZE as u64;
                (None, footer.total_sectors().min(data_sectors))
            }
            VhdType::Dynamic => {
                let layout = SparseLayout::read(&mut file, path, &footer)?;
                (Some(layout), footer.total_sectors())
            }
            VhdType::Differencing => {
                return Err(ImageError::InvalidImage(
                    "differencing VHD images are not supported".to_string(),
                ))
            }
            VhdType::Other(t) => {
                return Err(ImageError::InvalidImage(format!("unknown VHD disk type {}", t)))
            }
        };

        debug!(
            path = %path.display(),
            disk_type = ?footer.disk_type,
            total_sectors,
            "Opened VHD image"
        );
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            footer,
            sparse,
            total_sectors,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn footer(&self) -> &VhdFooter {
        &self.footer
    }

    pub fn is_dynamic(&self) -> bool {
        self.sparse.is_some()
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Read one 512-byte sector
    pub fn read_sector(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        if lba >= self.total_sectors {
            return Err(ImageError::SectorOutOfRange { sector: lba });
        }
        let buf = &mut buf[..DISK_SECTOR_SIZE as usize];
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());

        let Some(sparse) = &self.sparse else {
            return read_exact_at(&mut file, &self.path, lba * DISK_SECTOR_SIZE as u64, buf);
        };

        let block = (lba / sparse.sectors_per_block as u64) as usize;
        let in_block = lba % sparse.sectors_per_block as u64;
        let entry = sparse.bat.get(block).copied().unwrap_or(UNALLOCATED);
        if entry == UNALLOCATED {
            buf.fill(0);
            return Ok(());
        }

        let block_start = entry as u64 * DISK_SECTOR_SIZE as u64;
        let mut bitmap = [0u8; 1];
        read_exact_at(&mut file, &self.path, block_start + in_block / 8, &mut bitmap)?;
        if bitmap[0] & (0x80 >> (in_block % 8)) == 0 {
            trace!(lba, block, "VHD sector not present in bitmap");
            buf.fill(0);
            return Ok(());
        }

        let offset = block_start + sparse.bitmap_bytes + in_block * DISK_SECTOR_SIZE as u64;
        read_exact_at(&mut file, &self.path, offset, buf)
    }
}
