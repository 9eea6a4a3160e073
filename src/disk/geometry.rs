//! Drive geometry detection for hard disk and floppy images
//!
//! Hard disk images carry no reliable geometry of their own, so detection
//! walks a fixed chain of heuristics and takes the first that fits:
//!
//! 1. VHD footer geometry (folded to at most 1023 cylinders)
//! 2. CHS reconstructed from the first MBR partition entry, then from the
//!    entry at the old DOS 2.0-3.21 position
//! 3. bximage layout: 16 heads, 63 sectors per track
//! 4. Flat LBA layout (255 heads, 63 sectors) for FAT-LBA partitions,
//!    images of 4 GiB and more, or zeroed boot code over a FAT partition

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::{be_u16, be_u64, le_u32, DISK_SECTOR_SIZE};
use crate::error::{ImageError, Result};

/// Cylinder limit of INT 13h CHS addressing
pub const MAX_BIOS_CYLINDERS: u32 = 1023;

/// Disk geometry as reported to the BIOS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub sector_size: u32,
    pub sectors_per_track: u32,
    pub heads: u32,
    pub cylinders: u32,
}

impl Geometry {
    pub fn new(sector_size: u32, sectors_per_track: u32, heads: u32, cylinders: u32) -> Self {
        Self {
            sector_size,
            sectors_per_track,
            heads,
            cylinders,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        self.sectors_per_track as u64 * self.heads as u64 * self.cylinders as u64
    }

    /// LBA of a CHS address (sectors count from 1)
    pub fn chs_to_lba(&self, head: u32, cylinder: u32, sector: u32) -> Option<u64> {
        if sector == 0 || sector > self.sectors_per_track || head >= self.heads {
            return None;
        }
        Some(
            (cylinder as u64 * self.heads as u64 + head as u64) * self.sectors_per_track as u64
                + sector as u64
                - 1,
        )
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.sector_size, self.sectors_per_track, self.heads, self.cylinders
        )
    }
}

/// Which heuristic produced a geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    User,
    Floppy,
    Vhd,
    Mbr,
    OldDosMbr,
    Bximage,
    Lba,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetectedGeometry {
    pub geometry: Geometry,
    pub method: DetectionMethod,
}

// =============================================================================
// Floppy Table
// =============================================================================

/// A standard PC floppy format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloppyType {
    pub kib: u32,
    pub sectors_per_track: u32,
    pub heads: u32,
    pub cylinders: u32,
    /// CMOS / INT 13h drive type
    pub bios_type: u8,
}

impl FloppyType {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(DISK_SECTOR_SIZE, self.sectors_per_track, self.heads, self.cylinders)
    }
}

const fn floppy(kib: u32, sectors_per_track: u32, heads: u32, cylinders: u32, bios_type: u8) -> FloppyType {
    FloppyType {
        kib,
        sectors_per_track,
        heads,
        cylinders,
        bios_type,
    }
}

pub const FLOPPY_TYPES: [FloppyType; 10] = [
    floppy(160, 8, 1, 40, 0),
    floppy(180, 9, 1, 40, 0),
    floppy(200, 10, 1, 40, 0),
    floppy(320, 8, 2, 40, 1),
    floppy(360, 9, 2, 40, 1),
    floppy(400, 10, 2, 40, 1),
    floppy(720, 9, 2, 80, 3),
    floppy(1200, 15, 2, 80, 2),
    floppy(1440, 18, 2, 80, 4),
    floppy(2880, 36, 2, 80, 6),
];

/// Floppy format of an image of `size` bytes (exact, or one KiB over)
pub fn floppy_for_size(size: u64) -> Option<FloppyType> {
    let kib = size / 1024;
    FLOPPY_TYPES
        .iter()
        .copied()
        .find(|t| t.kib as u64 == kib || t.kib as u64 + 1 == kib)
}

/// Floppy format emulated by an El Torito media type (1, 2 or 3)
pub fn floppy_for_media(media_type: u8) -> Option<FloppyType> {
    let kib = match media_type {
        1 => 1200,
        2 => 1440,
        3 => 2880,
        _ => return None,
    };
    FLOPPY_TYPES.iter().copied().find(|t| t.kib == kib)
}

// =============================================================================
// Hard Disk Detection
// =============================================================================

const MBR_SIGNATURE_OFFSET: usize = 510;
const PARTITION_ENTRY_1: usize = 0x1BE;
/// Partition entry read by DOS 2.0 - 3.21 partitioning tools
const PARTITION_ENTRY_OLD_DOS: usize = 0x1EE;
const PARTITION_TYPE_1: usize = 0x1C2;

/// Partition types that imply LBA addressing
const LBA_PARTITION_TYPES: [u8; 3] = [0x0C, 0x0E, 0x0F];
/// FAT partition types
const FAT_PARTITION_TYPES: [u8; 6] = [0x01, 0x04, 0x06, 0x0B, 0x0C, 0x0E];

const LBA_HEADS: u32 = 255;
const LBA_SECTORS: u32 = 63;
const FOUR_GIB_SECTORS: u64 = (4u64 << 30) / DISK_SECTOR_SIZE as u64;

fn has_mbr_signature(mbr: &[u8]) -> bool {
    mbr.len() >= 512 && mbr[MBR_SIGNATURE_OFFSET] == 0x55 && mbr[MBR_SIGNATURE_OFFSET + 1] == 0xAA
}

/// Geometry recorded in a VHD footer, folded to fit BIOS limits
pub fn geometry_from_vhd_footer(footer: &[u8], total_sectors: u64) -> Option<Geometry> {
    if footer.len() < 512 || &footer[..8] != b"conectix" {
        return None;
    }
    let mut cylinders = be_u16(footer, 0x38) as u64;
    let mut heads = footer[0x3A] as u64;
    let sectors = footer[0x3B] as u64;
    if heads == 0 || sectors == 0 || cylinders == 0 {
        warn!(cylinders, heads, sectors, "VHD footer has an empty geometry");
        return None;
    }

    let current_size = be_u64(footer, 0x30);
    let total = if current_size > 0 {
        current_size / DISK_SECTOR_SIZE as u64
    } else {
        total_sectors
    };

    while heads < 128 && cylinders > MAX_BIOS_CYLINDERS as u64 {
        heads *= 2;
        cylinders /= 2;
    }
    if cylinders > MAX_BIOS_CYLINDERS as u64 {
        heads = LBA_HEADS as u64;
        cylinders = total / (LBA_HEADS as u64 * sectors);
    }

    Some(Geometry::new(
        DISK_SECTOR_SIZE,
        sectors as u32,
        heads as u32,
        u32::try_from(cylinders).ok()?,
    ))
}

/// CHS geometry implied by the partition entry at `offset`
///
/// Rejected when the entry's CHS range disagrees with its sector count by
/// more than two cylinders or the disk would need more than 1023 cylinders.
pub fn geometry_from_partition(mbr: &[u8], offset: usize, total_sectors: u64) -> Option<Geometry> {
    let entry = mbr.get(offset..offset + 16)?;
    let start_head = entry[1] as i64;
    let start_sector = (entry[2] & 0x3F) as i64 - 1;
    let start_cyl = (entry[3] as i64) | (((entry[2] & 0xC0) as i64) << 2);
    let heads = entry[5] as i64 + 1;
    let sectors = (entry[6] & 0x3F) as i64;
    let end_cyl = (entry[7] as i64) | (((entry[6] & 0xC0) as i64) << 2);
    let size = le_u32(entry, 12) as i64;

    if size == 0 || sectors == 0 || start_sector < 0 {
        return None;
    }

    let per_cyl = sectors * heads;
    let part_start = start_sector + sectors * start_head + start_cyl * per_cyl;
    let part_end = per_cyl * end_cyl;
    let part_len = part_end - part_start;

    let consistent = part_len >= 0
        && part_len <= size
        && size as u64 <= total_sectors
        && (size - part_len) / per_cyl <= 2
        && size / per_cyl <= MAX_BIOS_CYLINDERS as i64;
    if !consistent {
        debug!(offset, start_cyl, start_head, end_cyl, size, part_len, "Partition CHS rejected");
        return None;
    }

    let cylinders = (total_sectors / per_cyl as u64).min(MAX_BIOS_CYLINDERS as u64);
    Some(Geometry::new(
        DISK_SECTOR_SIZE,
        sectors as u32,
        heads as u32,
        cylinders as u32,
    ))
}

fn bximage_geometry(total_sectors: u64) -> Option<Geometry> {
    let per_cyl = 16 * 63;
    let cylinders = total_sectors / per_cyl;
    (cylinders * per_cyl == total_sectors && cylinders > 0 && cylinders < 1024)
        .then(|| Geometry::new(DISK_SECTOR_SIZE, 63, 16, cylinders as u32))
}

fn wants_lba(mbr: &[u8], total_sectors: u64) -> bool {
    if total_sectors >= FOUR_GIB_SECTORS {
        return true;
    }
    if !has_mbr_signature(mbr) {
        return false;
    }
    let part_type = mbr[PARTITION_TYPE_1];
    let zero_boot_code = mbr[..32].iter().all(|&b| b == 0);
    LBA_PARTITION_TYPES.contains(&part_type)
        || (zero_boot_code && FAT_PARTITION_TYPES.contains(&part_type))
}

/// Run the detection chain over the first sector, the optional trailing
/// 512 bytes, and the image size in sectors
pub fn detect_geometry(mbr: &[u8], footer: Option<&[u8]>, total_sectors: u64) -> Result<DetectedGeometry> {
    let found = |geometry: Geometry, method: DetectionMethod| -> Result<DetectedGeometry> {
        debug!(%geometry, ?method, "Detected disk geometry");
        Ok(DetectedGeometry { geometry, method })
    };

    if let Some(g) = footer.and_then(|f| geometry_from_vhd_footer(f, total_sectors)) {
        return found(g, DetectionMethod::Vhd);
    }

    if has_mbr_signature(mbr) {
        if let Some(g) = geometry_from_partition(mbr, PARTITION_ENTRY_1, total_sectors) {
            return found(g, DetectionMethod::Mbr);
        }
        if let Some(g) = geometry_from_partition(mbr, PARTITION_ENTRY_OLD_DOS, total_sectors) {
            return found(g, DetectionMethod::OldDosMbr);
        }
        if let Some(g) = bximage_geometry(total_sectors) {
            return found(g, DetectionMethod::Bximage);
        }
    }

    if wants_lba(mbr, total_sectors) {
        let per_cyl = (LBA_HEADS * LBA_SECTORS) as u64;
        let cylinders = u32::try_from(total_sectors.div_ceil(per_cyl))
            .map_err(|_| ImageError::GeometryUndetectable)?;
        return found(
            Geometry::new(DISK_SECTOR_SIZE, LBA_SECTORS, LBA_HEADS, cylinders),
            DetectionMethod::Lba,
        );
    }

    Err(ImageError::GeometryUndetectable)
}

/// BIOS large-disk translation of a user geometry past 1024 cylinders
pub fn translate_large_disk(geometry: Geometry) -> Geometry {
    let shift = match geometry.cylinders {
        c if c > 16384 => {
            warn!(cylinders = c, "Disk geometry too big to translate");
            0
        }
        c if c > 8192 => 4,
        c if c > 4096 => 3,
        c if c > 2048 => 2,
        c if c > 1024 => 1,
        _ => 0,
    };
    Geometry {
        heads: geometry.heads << shift,
        cylinders: geometry.cylinders >> shift,
        ..geometry
    }
}
