//! Single-file ISO loader
//!
//! The sector layout is found by probing for a Primary Volume Descriptor at
//! sector 16 under each supported layout in turn.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{CueSheet, NewTrack, TrackListBuilder, TrackMode};
use crate::common::{COOKED_SECTOR_SIZE, RAW_SECTOR_SIZE};
use crate::error::{ImageError, Result};
use crate::trackfile::{FileKind, TrackFile};

/// Sector holding the first volume descriptor
const PVD_SECTOR: u64 = 16;

/// Layouts in probe order
const PROBES: [TrackMode; 4] = [
    TrackMode::Mode1Cooked,
    TrackMode::Mode1Raw,
    TrackMode::Mode2,
    TrackMode::Mode2Raw,
];

/// Whether a 2048-byte descriptor is an ISO 9660 or High Sierra volume descriptor
pub fn is_volume_descriptor(pvd: &[u8]) -> bool {
    let iso = pvd[0] == 1 && &pvd[1..6] == b"CD001" && pvd[6] == 1;
    let high_sierra = pvd[8] == 1 && &pvd[9..14] == b"CDROM" && pvd[14] == 1;
    iso || high_sierra
}

fn can_read_pvd(file: &TrackFile, mode: TrackMode) -> bool {
    let seek = PVD_SECTOR * mode.sector_size() as u64 + mode.cooked_offset() as u64;
    let mut pvd = [0u8; COOKED_SECTOR_SIZE as usize];
    file.read(&mut pvd, seek).is_ok() && is_volume_descriptor(&pvd)
}

/// Pick the sector layout of a bare image file
pub fn detect_mode(file: &TrackFile) -> Result<TrackMode> {
    if let Some(mode) = PROBES.into_iter().find(|&m| can_read_pvd(file, m)) {
        debug!(?mode, "Found primary volume descriptor");
        return Ok(mode);
    }
    if file.length() > 0 && file.length() % RAW_SECTOR_SIZE as u64 == 0 {
        warn!(
            path = %file.path().display(),
            "No volume descriptor found; treating image as raw 2352-byte sectors"
        );
        return Ok(TrackMode::Mode1Raw);
    }
    Err(ImageError::UnsupportedSectorSize(format!(
        "{} has no volume descriptor and is not a whole number of 2352-byte sectors",
        file.path().display()
    )))
}

pub fn load(path: &Path) -> Result<CueSheet> {
    let file = Arc::new(TrackFile::open(path, FileKind::Binary)?);
    let mode = detect_mode(&file)?;

    let mut builder = TrackListBuilder::default();
    builder
        .add(NewTrack {
            number: 1,
            mode,
            index1: 0,
            index0: None,
            pregap: 0,
            postgap: 0,
            file,
        })
        .map_err(ImageError::InvalidImage)?;
    let (tracks, leadout) = builder.finish().map_err(ImageError::InvalidImage)?;
    Ok(CueSheet::new(path, tracks, leadout, String::new()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    /// Build an image of `sectors` sectors in `mode` with a PVD at sector 16
    pub(crate) fn build_iso(mode: TrackMode, sectors: usize) -> Vec<u8> {
        let size = mode.sector_size() as usize;
        let mut image = vec![0u8; size * sectors];
        let at = 16 * size + mode.cooked_offset() as usize;
        image[at] = 1;
        image[at + 1..at + 6].copy_from_slice(b"CD001");
        image[at + 6] = 1;
        image
    }

    fn load_bytes(dir: &TempDir, name: &str, bytes: &[u8]) -> Result<CueSheet> {
        let path = dir.path().join(name);
        File::create(&path).unwrap().write_all(bytes).unwrap();
        load(&path)
    }

    #[test]
    fn test_detects_each_layout() {
        let dir = TempDir::new().unwrap();
        for mode in PROBES {
            let sheet = load_bytes(&dir, "probe.iso", &build_iso(mode, 20)).unwrap();
            let track = &sheet.tracks()[0];
            assert_eq!(track.mode, mode);
            assert_eq!(track.length, 20);
            assert_eq!(sheet.leadout_sector(), 20);
        }
    }

    #[test]
    fn test_high_sierra_signature() {
        let dir = TempDir::new().unwrap();
        let mut image = vec![0u8; 2048 * 18];
        let at = 16 * 2048;
        image[at + 8] = 1;
        image[at + 9..at + 14].copy_from_slice(b"CDROM");
        image[at + 14] = 1;
        let sheet = load_bytes(&dir, "hs.iso", &image).unwrap();
        assert_eq!(sheet.tracks()[0].mode, TrackMode::Mode1Cooked);
    }

    #[test]
    fn test_fallback_to_raw_and_rejection() {
        let dir = TempDir::new().unwrap();
        let sheet = load_bytes(&dir, "raw.bin", &vec![0u8; 2352 * 3]).unwrap();
        assert_eq!(sheet.tracks()[0].mode, TrackMode::Mode1Raw);
        assert_eq!(sheet.tracks()[0].length, 3);

        assert!(matches!(
            load_bytes(&dir, "odd.iso", &vec![0u8; 5000]),
            Err(ImageError::UnsupportedSectorSize(_))
        ));
    }

    #[test]
    fn test_cooked_read_through_pvd() {
        let dir = TempDir::new().unwrap();
        let sheet = load_bytes(&dir, "pvd.iso", &build_iso(TrackMode::Mode2Raw, 20)).unwrap();
        let mut buf = vec![0u8; 2048];
        sheet.read_sector(&mut buf, false, 16).unwrap();
        assert!(is_volume_descriptor(&buf));
    }
}
