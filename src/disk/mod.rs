//! Hard disk and floppy images
//!
//! A `DiskImage` is a flat array of 512-byte sectors plus the geometry the
//! BIOS reports for it. Backends:
//! - raw image files (and fixed VHDs, which are raw data plus a footer)
//! - dynamic VHDs (read-only)
//! - the emulated boot floppy of an El Torito CD-ROM

pub mod geometry;
pub mod vhd;

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cdrom::CueSheet;
use crate::common::binary::{file_len, read_exact_at};
use crate::common::{COOKED_SECTOR_SIZE, DISK_SECTOR_SIZE};
use crate::eltorito::ElToritoBoot;
use crate::error::{ImageError, Result};

pub use geometry::{
    detect_geometry, floppy_for_media, floppy_for_size, translate_large_disk, DetectedGeometry,
    DetectionMethod, FloppyType, Geometry, FLOPPY_TYPES,
};
pub use vhd::{has_vhd_footer, VhdImage, VhdType};

const SECTOR: u64 = DISK_SECTOR_SIZE as u64;
const FLOPPY_SECTORS_PER_CD_SECTOR: u32 = COOKED_SECTOR_SIZE / DISK_SECTOR_SIZE;

// =============================================================================
// Backends
// =============================================================================

enum Backend {
    /// Raw sectors at the start of a file
    Raw { file: Mutex<File>, writable: bool },
    /// Dynamic VHD
    Vhd(VhdImage),
    /// Emulated floppy inside a CD-ROM image
    ElTorito { disc: Arc<CueSheet>, base_sector: u32 },
}

impl Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Raw { .. } => "raw",
            Backend::Vhd(_) => "vhd",
            Backend::ElTorito { .. } => "el_torito",
        }
    }
}

/// Summary of a mounted disk for front ends
#[derive(Debug, Clone, Serialize)]
pub struct DiskSummary {
    pub backend: &'static str,
    pub geometry: Geometry,
    pub detected_by: DetectionMethod,
    pub total_sectors: u64,
    pub read_only: bool,
    pub floppy: bool,
    pub bios_type: Option<u8>,
}

/// An opened hard disk or floppy image
pub struct DiskImage {
    path: PathBuf,
    backend: Backend,
    geometry: Geometry,
    method: DetectionMethod,
    total_sectors: u64,
    floppy: Option<FloppyType>,
}

impl std::fmt::Debug for DiskImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImage")
            .field("path", &self.path)
            .field("backend", &self.backend.name())
            .field("geometry", &self.geometry)
            .field("total_sectors", &self.total_sectors)
            .finish()
    }
}

fn open_file(path: &Path, read_only: bool) -> Result<(File, bool)> {
    let opened = OpenOptions::new().read(true).write(!read_only).open(path);
    match opened {
        Ok(file) => Ok((file, !read_only)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ImageError::TrackFileNotFound(path.to_path_buf()))
        }
        Err(e) if !read_only && e.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!(path = %path.display(), "Image is not writable, mounting read-only");
            let file = File::open(path).map_err(|e| ImageError::io(path, e))?;
            Ok((file, false))
        }
        Err(e) => Err(ImageError::io(path, e)),
    }
}

impl DiskImage {
    /// Open a hard disk image, detecting geometry unless `user` is given
    pub fn open_hard_disk(path: &Path, user: Option<Geometry>, read_only: bool) -> Result<Self> {
        let (mut file, writable) = open_file(path, read_only)?;
        let len = file_len(&file, path)?;

        let vhd = if has_vhd_footer(path) {
            Some(VhdImage::open(path)?)
        } else {
            None
        };
        let footer = vhd.as_ref().map(|v| v.footer().raw().to_vec());

        let mut mbr = vec![0u8; DISK_SECTOR_SIZE as usize];
        let (backend, total_sectors) = match vhd {
            Some(vhd) if vhd.is_dynamic() => {
                if vhd.total_sectors() > 0 {
                    vhd.read_sector(0, &mut mbr)?;
                }
                if writable {
                    info!(path = %path.display(), "Dynamic VHD mounted read-only");
                }
                let total = vhd.total_sectors();
                (Backend::Vhd(vhd), total)
            }
            fixed => {
                let total = fixed.map_or(len / SECTOR, |v| v.total_sectors());
                if total > 0 {
                    read_exact_at(&mut file, path, 0, &mut mbr)?;
                }
                (Backend::Raw { file: Mutex::new(file), writable }, total)
            }
        };

        let detected = match user {
            Some(g) => DetectedGeometry {
                geometry: translate_large_disk(g),
                method: DetectionMethod::User,
            },
            None => detect_geometry(&mbr, footer.as_deref(), total_sectors)?,
        };

        info!(
            path = %path.display(),
            backend = backend.name(),
            geometry = %detected.geometry,
            method = ?detected.method,
            total_sectors,
            "Mounted hard disk image"
        );
        Ok(Self {
            path: path.to_path_buf(),
            backend,
            geometry: detected.geometry,
            method: detected.method,
            total_sectors,
            floppy: None,
        })
    }

    /// Open a floppy image; the size must match a standard format unless a
    /// geometry is given
    pub fn open_floppy(path: &Path, user: Option<Geometry>, read_only: bool) -> Result<Self> {
        let (file, writable) = open_file(path, read_only)?;
        let len = file_len(&file, path)?;

        let floppy = floppy_for_size(len);
        let (geometry, method) = match (user, floppy) {
            (Some(g), _) => (g, DetectionMethod::User),
            (None, Some(f)) => (f.geometry(), DetectionMethod::Floppy),
            (None, None) => {
                debug!(path = %path.display(), len, "Size matches no floppy format");
                return Err(ImageError::GeometryUndetectable);
            }
        };

        info!(path = %path.display(), %geometry, "Mounted floppy image");
        Ok(Self {
            path: path.to_path_buf(),
            backend: Backend::Raw { file: Mutex::new(file), writable },
            geometry,
            method,
            total_sectors: len / SECTOR,
            floppy: floppy.or(Some(FloppyType {
                kib: (len / 1024) as u32,
                sectors_per_track: geometry.sectors_per_track,
                heads: geometry.heads,
                cylinders: geometry.cylinders,
                bios_type: 0,
            })),
        })
    }

    /// Floppy view of an El Torito boot image
    pub fn from_el_torito(disc: Arc<CueSheet>, boot: ElToritoBoot) -> Result<Self> {
        let floppy = floppy_for_media(boot.media_type).ok_or(ImageError::ElToritoNotFound)?;
        let geometry = floppy.geometry();
        let path = disc.path().to_path_buf();
        info!(
            path = %path.display(),
            base = boot.floppy_base_sector,
            kib = floppy.kib,
            "Mounted El Torito boot floppy"
        );
        Ok(Self {
            path,
            backend: Backend::ElTorito {
                disc,
                base_sector: boot.floppy_base_sector,
            },
            geometry,
            method: DetectionMethod::Floppy,
            total_sectors: geometry.total_sectors(),
            floppy: Some(floppy),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn detection_method(&self) -> DetectionMethod {
        self.method
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn is_floppy(&self) -> bool {
        self.floppy.is_some()
    }

    /// CMOS drive type for floppies
    pub fn bios_type(&self) -> Option<u8> {
        self.floppy.map(|f| f.bios_type)
    }

    pub fn is_read_only(&self) -> bool {
        !matches!(self.backend, Backend::Raw { writable: true, .. })
    }

    pub fn summary(&self) -> DiskSummary {
        DiskSummary {
            backend: self.backend.name(),
            geometry: self.geometry,
            detected_by: self.method,
            total_sectors: self.total_sectors,
            read_only: self.is_read_only(),
            floppy: self.is_floppy(),
            bios_type: self.bios_type(),
        }
    }

    /// Read one 512-byte sector by LBA
    pub fn read_sector(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        if lba >= self.total_sectors {
            return Err(ImageError::SectorOutOfRange { sector: lba });
        }
        let buf = &mut buf[..DISK_SECTOR_SIZE as usize];
        match &self.backend {
            Backend::Raw { file, .. } => {
                let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
                read_exact_at(&mut file, &self.path, lba * SECTOR, buf)
            }
            Backend::Vhd(vhd) => vhd.read_sector(lba, buf),
            Backend::ElTorito { disc, base_sector } => {
                let cd_sector = u32::try_from(lba / FLOPPY_SECTORS_PER_CD_SECTOR as u64)
                    .ok()
                    .and_then(|s| base_sector.checked_add(s))
                    .ok_or(ImageError::SectorOutOfRange { sector: lba })?;
                let mut cooked = [0u8; COOKED_SECTOR_SIZE as usize];
                disc.read_sector(&mut cooked, false, cd_sector)?;
                let at = (lba % FLOPPY_SECTORS_PER_CD_SECTOR as u64) as usize * DISK_SECTOR_SIZE as usize;
                buf.copy_from_slice(&cooked[at..at + DISK_SECTOR_SIZE as usize]);
                Ok(())
            }
        }
    }

    /// Read `count` consecutive sectors
    pub fn read_sectors(&self, lba: u64, count: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count as usize * DISK_SECTOR_SIZE as usize];
        for (i, chunk) in out.chunks_exact_mut(DISK_SECTOR_SIZE as usize).enumerate() {
            self.read_sector(lba + i as u64, chunk)?;
        }
        Ok(out)
    }

    /// Write one 512-byte sector by LBA
    pub fn write_sector(&self, lba: u64, data: &[u8]) -> Result<()> {
        let Backend::Raw { file, writable: true } = &self.backend else {
            return Err(ImageError::ReadOnly);
        };
        if lba >= self.total_sectors {
            return Err(ImageError::SectorOutOfRange { sector: lba });
        }
        if data.len() < DISK_SECTOR_SIZE as usize {
            return Err(ImageError::InvalidImage(format!(
                "sector write of {} bytes",
                data.len()
            )));
        }
        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(lba * SECTOR))
            .and_then(|_| file.write_all(&data[..DISK_SECTOR_SIZE as usize]))
            .map_err(|e| ImageError::io(&self.path, e))
    }

    /// Read by cylinder/head/sector (sectors count from 1)
    pub fn read_chs(&self, head: u32, cylinder: u32, sector: u32, buf: &mut [u8]) -> Result<()> {
        let lba = self
            .geometry
            .chs_to_lba(head, cylinder, sector)
            .ok_or(ImageError::SectorOutOfRange {
                sector: sector as u64,
            })?;
        self.read_sector(lba, buf)
    }

    /// Write by cylinder/head/sector (sectors count from 1)
    pub fn write_chs(&self, head: u32, cylinder: u32, sector: u32, data: &[u8]) -> Result<()> {
        let lba = self
            .geometry
            .chs_to_lba(head, cylinder, sector)
            .ok_or(ImageError::SectorOutOfRange {
                sector: sector as u64,
            })?;
        self.write_sector(lba, data)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        if let Backend::Raw { file, writable: true } = &self.backend {
            let file = file.lock().unwrap_or_else(|e| e.into_inner());
            file.sync_data().map_err(|e| ImageError::io(&self.path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdrom::LoadOptions;
    use crate::eltorito::{self, tests::build_boot_iso};
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn raw_disk(sectors: u64, mbr: Option<&[u8]>) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        let mut data = vec![0u8; (sectors * SECTOR) as usize];
        for (i, chunk) in data.chunks_exact_mut(512).enumerate() {
            chunk.fill(i as u8);
        }
        if let Some(mbr) = mbr {
            data[..512].copy_from_slice(mbr);
        }
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    fn blank_mbr() -> Vec<u8> {
        let mut mbr = vec![0u8; 512];
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        mbr
    }

    #[test]
    fn test_raw_disk_bximage_read_write() {
        let tmp = raw_disk(2 * 16 * 63, Some(&blank_mbr()));
        let disk = DiskImage::open_hard_disk(tmp.path(), None, false).unwrap();
        assert_eq!(disk.detection_method(), DetectionMethod::Bximage);
        assert_eq!(disk.geometry(), Geometry::new(512, 63, 16, 2));
        assert!(!disk.is_read_only());

        let mut buf = [0u8; 512];
        disk.read_chs(1, 0, 1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 63));

        disk.write_sector(70, &[0xEE; 512]).unwrap();
        disk.flush().unwrap();
        let back = disk.read_sectors(69, 2).unwrap();
        assert!(back[..512].iter().all(|&b| b == 69));
        assert!(back[512..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let tmp = raw_disk(16 * 63, Some(&blank_mbr()));
        let disk = DiskImage::open_hard_disk(tmp.path(), None, true).unwrap();
        assert!(matches!(disk.write_sector(1, &[0; 512]), Err(ImageError::ReadOnly)));
    }

    #[test]
    fn test_user_geometry_is_translated() {
        let tmp = raw_disk(8, None);
        let user = Geometry::new(512, 63, 16, 3000);
        let disk = DiskImage::open_hard_disk(tmp.path(), Some(user), true).unwrap();
        assert_eq!(disk.detection_method(), DetectionMethod::User);
        assert_eq!((disk.geometry().heads, disk.geometry().cylinders), (64, 750));
    }

    #[test]
    fn test_undetectable_geometry() {
        let tmp = raw_disk(1000, Some(&vec![0u8; 512]));
        assert!(matches!(
            DiskImage::open_hard_disk(tmp.path(), None, true),
            Err(ImageError::GeometryUndetectable)
        ));
    }

    #[test]
    fn test_fixed_vhd_uses_footer_geometry() {
        let tmp = vhd::tests::fixed_vhd(40, (10, 2, 2));
        let disk = DiskImage::open_hard_disk(tmp.path(), None, false).unwrap();
        assert_eq!(disk.detection_method(), DetectionMethod::Vhd);
        assert_eq!(disk.total_sectors(), 40);
        assert_eq!(disk.geometry(), Geometry::new(512, 2, 2, 10));
        assert!(matches!(
            disk.read_sectors(40, 1),
            Err(ImageError::SectorOutOfRange { sector: 40 })
        ));
    }

    #[test]
    fn test_floppy_by_size() {
        let tmp = raw_disk(1440 * 2, None);
        let disk = DiskImage::open_floppy(tmp.path(), None, false).unwrap();
        assert!(disk.is_floppy());
        assert_eq!(disk.bios_type(), Some(4));
        assert_eq!(disk.geometry(), Geometry::new(512, 18, 2, 80));

        let odd = raw_disk(1000, None);
        assert!(DiskImage::open_floppy(odd.path(), None, false).is_err());
    }

    #[test]
    fn test_el_torito_floppy_view() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("boot.iso");
        std::fs::write(&path, build_boot_iso(2)).unwrap();

        let disc = Arc::new(CueSheet::open(&path, LoadOptions::default()).unwrap());
        let boot = eltorito::scan(disc.as_ref()).unwrap();
        let floppy = DiskImage::from_el_torito(disc, boot).unwrap();
        assert_eq!(floppy.total_sectors(), 2880);
        assert!(floppy.is_read_only());

        let mut buf = [0u8; 512];
        floppy.read_sector(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 5));
        floppy.read_chs(1, 0, 1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 18));
        assert!(matches!(floppy.write_sector(0, &buf), Err(ImageError::ReadOnly)));
    }
}
