//! El Torito boot record scanner
//!
//! Finds the emulated boot floppy inside an ISO9660 image: the Boot Record
//! Volume Descriptor in the volume descriptor set points at a boot catalog,
//! whose bootable x86 entries carry the floppy's start sector and media type.

use serde::Serialize;
use tracing::{debug, warn};

use crate::cdrom::CueSheet;
use crate::common::{le_u16, le_u32, COOKED_SECTOR_SIZE};
use crate::error::{ImageError, Result};

const ISO_SECTOR: usize = COOKED_SECTOR_SIZE as usize;
const FIRST_DESCRIPTOR: u32 = 16;
const LAST_DESCRIPTOR: u32 = 31;
const BOOT_SYSTEM_ID: &[u8] = b"EL TORITO SPECIFICATION";
const CATALOG_POINTER: usize = 71;
const ENTRY_SIZE: usize = 32;

const ENTRY_VALIDATION: u8 = 0x01;
const ENTRY_BOOTABLE: u8 = 0x88;
const ENTRY_SECTION_HEADER: u8 = 0x90;
const ENTRY_FINAL_HEADER: u8 = 0x91;
const PLATFORM_X86: u8 = 0;

/// Read-only 2048-byte sector access
pub trait SectorSource {
    fn read_cooked(&self, lba: u32, buf: &mut [u8]) -> Result<()>;
}

impl SectorSource for CueSheet {
    fn read_cooked(&self, lba: u32, buf: &mut [u8]) -> Result<()> {
        self.read_sector(buf, false, lba)
    }
}

/// Location of a bootable emulated floppy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ElToritoBoot {
    /// First 2048-byte sector of the floppy image
    pub floppy_base_sector: u32,
    /// 1 = 1.2M, 2 = 1.44M, 3 = 2.88M
    pub media_type: u8,
    pub load_segment: u16,
    pub system_type: u8,
    pub sector_count: u16,
}

/// True when the sixteen little-endian words of a record sum to zero
pub fn checksum_record(record: &[u8]) -> bool {
    record
        .chunks_exact(2)
        .take(ENTRY_SIZE / 2)
        .fold(0u16, |acc, w| acc.wrapping_add(u16::from_le_bytes([w[0], w[1]])))
        == 0
}

fn is_terminator(sector: &[u8]) -> bool {
    sector[0] == 0xFF && &sector[1..6] == b"CD001"
}

fn is_boot_record(sector: &[u8]) -> bool {
    if sector[0] != 0 || &sector[1..6] != b"CD001" || sector[6] != 1 {
        return false;
    }
    let id = &sector[7..39];
    id.starts_with(BOOT_SYSTEM_ID) && id[BOOT_SYSTEM_ID.len()..].iter().all(|&b| b == 0)
}

fn find_catalog<S: SectorSource + ?Sized>(source: &S, buf: &mut [u8]) -> Option<u32> {
    for lba in FIRST_DESCRIPTOR..=LAST_DESCRIPTOR {
        if let Err(e) = source.read_cooked(lba, buf) {
            debug!(lba, error = %e, "Volume descriptor unreadable");
            return None;
        }
        if is_terminator(buf) {
            debug!(lba, "Volume descriptor set terminator before boot record");
            return None;
        }
        if is_boot_record(buf) {
            let catalog = le_u32(buf, CATALOG_POINTER);
            debug!(lba, catalog, "Found El Torito boot record");
            return Some(catalog);
        }
    }
    debug!("No volume descriptor set terminator within sectors 16-31");
    None
}

/// Locate the first bootable x86 floppy emulation entry
pub fn scan<S: SectorSource + ?Sized>(source: &S) -> Result<ElToritoBoot> {
    let mut buf = vec![0u8; ISO_SECTOR];
    let catalog = find_catalog(source, &mut buf).ok_or(ImageError::ElToritoNotFound)?;

    source.read_cooked(catalog, &mut buf).map_err(|e| {
        debug!(catalog, error = %e, "Boot catalog unreadable");
        ImageError::ElToritoNotFound
    })?;

    let mut entries = buf.chunks_exact(ENTRY_SIZE);
    let validation = entries.next().ok_or(ImageError::ElToritoNotFound)?;
    if validation[0] != ENTRY_VALIDATION || !checksum_record(validation) {
        debug!(catalog, "Boot catalog validation entry invalid");
        return Err(ImageError::ElToritoNotFound);
    }

    let mut platform = Some(validation[1]);
    let mut found: Option<ElToritoBoot> = None;

    for (index, entry) in entries.enumerate() {
        match entry[0] {
            ENTRY_SECTION_HEADER | ENTRY_FINAL_HEADER => {
                platform = checksum_record(entry).then_some(entry[1]);
                if platform.is_none() {
                    warn!(index, "El Torito section header checksum mismatch, platform unknown");
                }
            }
            ENTRY_BOOTABLE if platform == Some(PLATFORM_X86) => {
                let boot = ElToritoBoot {
                    floppy_base_sector: le_u32(entry, 8),
                    media_type: entry[1] & 0x0F,
                    load_segment: le_u16(entry, 2),
                    system_type: entry[4],
                    sector_count: le_u16(entry, 6),
                };
                if !(1..=3).contains(&boot.media_type) {
                    debug!(index, media_type = boot.media_type, "Skipping non-floppy boot entry");
                } else if let Some(first) = found {
                    warn!(
                        index,
                        ignored = boot.floppy_base_sector,
                        using = first.floppy_base_sector,
                        "Ignoring additional bootable floppy entry"
                    );
                } else {
                    found = Some(boot);
                }
            }
            _ => {}
        }
    }

    let boot = found.ok_or(ImageError::ElToritoNotFound)?;
    debug!(
        base = boot.floppy_base_sector,
        media = boot.media_type,
        "El Torito floppy emulation entry"
    );
    Ok(boot)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory 2048-byte sector image
    pub(crate) struct MemoryIso(pub Vec<u8>);

    impl SectorSource for MemoryIso {
        fn read_cooked(&self, lba: u32, buf: &mut [u8]) -> Result<()> {
            let start = lba as usize * ISO_SECTOR;
            let sector = self
                .0
                .get(start..start + ISO_SECTOR)
                .ok_or(ImageError::SectorOutOfRange { sector: lba as u64 })?;
            buf[..ISO_SECTOR].copy_from_slice(sector);
            Ok(())
        }
    }

    fn fix_checksum(record: &mut [u8]) {
        record[28] = 0;
        record[29] = 0;
        let sum = record
            .chunks_exact(2)
            .fold(0u16, |acc, w| acc.wrapping_add(u16::from_le_bytes([w[0], w[1]])));
        record[28..30].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());
    }

    pub(crate) fn validation_entry() -> [u8; 32] {
        let mut e = [0u8; 32];
        e[0] = ENTRY_VALIDATION;
        e[4..10].copy_from_slice(b"TESTER");
        e[30] = 0x55;
        e[31] = 0xAA;
        fix_checksum(&mut e);
        e
    }

    fn bootable_entry(media: u8, rba: u32) -> [u8; 32] {
        let mut e = [0u8; 32];
        e[0] = ENTRY_BOOTABLE;
        e[1] = media;
        e[6..8].copy_from_slice(&1u16.to_le_bytes());
        e[8..12].copy_from_slice(&rba.to_le_bytes());
        e
    }

    /// ISO with a boot record at 17, terminator at 18, catalog at 20 and a
    /// floppy of `media` starting at sector 21 (floppy byte i = i / 512)
    pub(crate) fn build_boot_iso(media: u8) -> Vec<u8> {
        let floppy_bytes = match media {
            1 => 1200 * 1024,
            2 => 1440 * 1024,
            _ => 2880 * 1024,
        };
        let mut image = vec![0u8; 21 * ISO_SECTOR + floppy_bytes];
        let pvd = 16 * ISO_SECTOR;
        image[pvd] = 1;
        image[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        image[pvd + 6] = 1;

        let brvd = 17 * ISO_SECTOR;
        image[brvd + 1..brvd + 6].copy_from_slice(b"CD001");
        image[brvd + 6] = 1;
        image[brvd + 7..brvd + 7 + BOOT_SYSTEM_ID.len()].copy_from_slice(BOOT_SYSTEM_ID);
        image[brvd + CATALOG_POINTER..brvd + CATALOG_POINTER + 4].copy_from_slice(&20u32.to_le_bytes());

        let term = 18 * ISO_SECTOR;
        image[term] = 0xFF;
        image[term + 1..term + 6].copy_from_slice(b"CD001");
        image[term + 6] = 1;

        let cat = 20 * ISO_SECTOR;
        image[cat..cat + 32].copy_from_slice(&validation_entry());
        image[cat + 32..cat + 64].copy_from_slice(&bootable_entry(media, 21));

        let floppy = 21 * ISO_SECTOR;
        for (i, b) in image[floppy..].iter_mut().enumerate() {
            *b = (i / 512) as u8;
        }
        image
    }

    #[test]
    fn test_checksum_positive_and_negative() {
        let good = validation_entry();
        assert!(checksum_record(&good));

        let mut bad = good;
        bad[5] ^= 0x01;
        assert!(!checksum_record(&bad));
    }

    #[test]
    fn test_checksum_any_single_byte_mutation_fails() {
        let good = validation_entry();
        for i in 0..32 {
            for delta in [1u8, 0x80, 0xFF] {
                let mut mutated = good;
                mutated[i] = mutated[i].wrapping_add(delta);
                assert!(!checksum_record(&mutated), "byte {} + {:#x}", i, delta);
            }
        }
    }

    #[test]
    fn test_scan_finds_floppy() {
        let iso = MemoryIso(build_boot_iso(2));
        let boot = scan(&iso).unwrap();
        assert_eq!(boot.floppy_base_sector, 21);
        assert_eq!(boot.media_type, 2);
        assert_eq!(boot.sector_count, 1);
    }

    #[test]
    fn test_later_bootable_entries_ignored() {
        let mut image = build_boot_iso(1);
        let cat = 20 * ISO_SECTOR;
        let mut header = [0u8; 32];
        header[0] = ENTRY_FINAL_HEADER;
        header[1] = PLATFORM_X86;
        header[2] = 1;
        fix_checksum(&mut header);
        image[cat + 64..cat + 96].copy_from_slice(&header);
        image[cat + 96..cat + 128].copy_from_slice(&bootable_entry(3, 500));

        let boot = scan(&MemoryIso(image)).unwrap();
        assert_eq!((boot.floppy_base_sector, boot.media_type), (21, 1));
    }

    #[test]
    fn test_section_header_bad_checksum_hides_entries() {
        let mut image = build_boot_iso(2);
        let cat = 20 * ISO_SECTOR;
        // Turn the default entry into a no-emulation entry
        image[cat + 33] = 0;
        let mut header = [0u8; 32];
        header[0] = ENTRY_FINAL_HEADER;
        header[2] = 1;
        header[28] = 0x12;
        image[cat + 64..cat + 96].copy_from_slice(&header);
        image[cat + 96..cat + 128].copy_from_slice(&bootable_entry(2, 21));

        assert!(matches!(scan(&MemoryIso(image)), Err(ImageError::ElToritoNotFound)));
    }

    #[test]
    fn test_truncated_descriptor_set_not_found() {
        // Boot record and terminator missing, image ends at sector 24
        let mut image = build_boot_iso(2);
        image.truncate(24 * ISO_SECTOR);
        image[17 * ISO_SECTOR..19 * ISO_SECTOR].fill(0);
        assert!(matches!(scan(&MemoryIso(image)), Err(ImageError::ElToritoNotFound)));

        // Sixteen plain descriptors and no terminator
        let mut image = vec![0u8; 40 * ISO_SECTOR];
        for lba in 16..32 {
            let at = lba * ISO_SECTOR;
            image[at] = 2;
            image[at + 1..at + 6].copy_from_slice(b"CD001");
        }
        assert!(matches!(scan(&MemoryIso(image)), Err(ImageError::ElToritoNotFound)));
    }

    #[test]
    fn test_bad_validation_entry_not_found() {
        let mut image = build_boot_iso(2);
        image[20 * ISO_SECTOR + 4] ^= 0x20;
        assert!(matches!(scan(&MemoryIso(image)), Err(ImageError::ElToritoNotFound)));
    }

    #[test]
    fn test_terminator_before_boot_record() {
        let mut image = build_boot_iso(2);
        let brvd = 17 * ISO_SECTOR;
        let term = 18 * ISO_SECTOR;
        let (a, b) = image.split_at_mut(term);
        a[brvd..].swap_with_slice(&mut b[..ISO_SECTOR]);
        assert!(matches!(scan(&MemoryIso(image)), Err(ImageError::ElToritoNotFound)));
    }
}
