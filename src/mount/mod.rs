//! Mounting images onto emulated drives
//!
//! `mount` turns a path plus options into a `MountedImage`; a `Registry`
//! keeps the images of the 26 drive letters, each with its own swap list,
//! and owns the CD audio player shared by every CD-ROM drive.

pub mod types;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cdrom::{
    AudioPlayer, AudioStatus, ChannelControl, CueSheet, LoadOptions, SubchannelInfo,
};
use crate::disk::{floppy_for_size, has_vhd_footer, DiskImage, Geometry};
use crate::eltorito;
use crate::error::{ImageError, Result};
use crate::trackfile::is_chd;

pub use types::{MediaKind, MountInfo, MountOptions};

/// Number of drive letters, A: to Z:
pub const DRIVE_COUNT: usize = 26;

const CDROM_EXTENSIONS: [&str; 5] = ["cue", "ccd", "chd", "iso", "cdr"];

// =============================================================================
// Mounted Images
// =============================================================================

/// A mounted CD-ROM or disk image
#[derive(Debug)]
pub enum MountedImage {
    Cdrom(Arc<CueSheet>),
    Disk(DiskImage),
}

impl MountedImage {
    pub fn path(&self) -> &Path {
        match self {
            MountedImage::Cdrom(disc) => disc.path(),
            MountedImage::Disk(disk) => disk.path(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MountedImage::Cdrom(_) => MediaKind::Cdrom,
            MountedImage::Disk(disk) if disk.is_floppy() => MediaKind::Floppy,
            MountedImage::Disk(_) => MediaKind::HardDisk,
        }
    }

    pub fn as_cdrom(&self) -> Option<&Arc<CueSheet>> {
        match self {
            MountedImage::Cdrom(disc) => Some(disc),
            MountedImage::Disk(_) => None,
        }
    }

    pub fn as_disk(&self) -> Option<&DiskImage> {
        match self {
            MountedImage::Disk(disk) => Some(disk),
            MountedImage::Cdrom(_) => None,
        }
    }

    /// Read `count` sectors: CD sectors (raw or cooked) or 512-byte disk sectors
    pub fn read_sectors(&self, start: u32, count: u32, raw: bool) -> Result<Vec<u8>> {
        match self {
            MountedImage::Cdrom(disc) => disc.read_sectors(start, count, raw),
            MountedImage::Disk(disk) => disk.read_sectors(start as u64, count),
        }
    }

    /// Number of tracks on a CD; `None` for disks
    pub fn track_count(&self) -> Option<u8> {
        self.as_cdrom().map(|disc| disc.track_count())
    }

    /// BIOS geometry of a disk; `None` for CDs
    pub fn geometry(&self) -> Option<Geometry> {
        self.as_disk().map(|disk| disk.geometry())
    }

    pub fn info(&self) -> MountInfo {
        let path = self.path().display().to_string();
        match self {
            MountedImage::Cdrom(disc) => MountInfo {
                kind: MediaKind::Cdrom,
                path,
                tracks: Some(disc.summaries()),
                leadout: Some(disc.leadout_sector()),
                mcn: (!disc.mcn().is_empty()).then(|| disc.mcn().to_string()),
                disk: None,
            },
            MountedImage::Disk(disk) => MountInfo {
                kind: self.kind(),
                path,
                tracks: None,
                leadout: None,
                mcn: None,
                disk: Some(disk.summary()),
            },
        }
    }

    /// Stop background work (CHD prefetch) before the image is released
    fn shutdown(&self) {
        match self {
            MountedImage::Cdrom(disc) => disc.shutdown(),
            MountedImage::Disk(disk) => {
                if let Err(e) = disk.flush() {
                    warn!(path = %disk.path().display(), error = %e, "Flush on unmount failed");
                }
            }
        }
    }
}

// =============================================================================
// Mount
// =============================================================================

fn detect_media(path: &Path) -> Result<MediaKind> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if CDROM_EXTENSIONS.contains(&ext.as_str()) || is_chd(path) {
        return Ok(MediaKind::Cdrom);
    }
    if has_vhd_footer(path) {
        return Ok(MediaKind::HardDisk);
    }
    let len = std::fs::metadata(path)
        .map_err(|e| ImageError::io(path, e))?
        .len();
    if floppy_for_size(len).is_some() {
        return Ok(MediaKind::Floppy);
    }
    Ok(MediaKind::HardDisk)
}

/// Open `path` as the drive image described by `options`
pub fn mount(path: &Path, options: &MountOptions) -> Result<MountedImage> {
    if !path.exists() {
        return Err(ImageError::TrackFileNotFound(path.to_path_buf()));
    }

    let load = LoadOptions {
        skip_sync: options.skip_sync,
    };

    if options.el_torito {
        let disc = Arc::new(CueSheet::open(path, load)?);
        let boot = eltorito::scan(disc.as_ref());
        let boot = match boot {
            Ok(boot) => boot,
            Err(e) => {
                disc.shutdown();
                return Err(e);
            }
        };
        return Ok(MountedImage::Disk(DiskImage::from_el_torito(disc, boot)?));
    }

    let media = match options.media {
        MediaKind::Auto => detect_media(path)?,
        explicit => explicit,
    };
    debug!(path = %path.display(), ?media, "Mounting image");

    let image = match media {
        MediaKind::Cdrom => MountedImage::Cdrom(Arc::new(CueSheet::open(path, load)?)),
        MediaKind::Floppy => MountedImage::Disk(DiskImage::open_floppy(
            path,
            options.user_geometry(),
            options.read_only,
        )?),
        MediaKind::HardDisk | MediaKind::Auto => MountedImage::Disk(DiskImage::open_hard_disk(
            path,
            options.user_geometry(),
            options.read_only,
        )?),
    };
    Ok(image)
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct DriveSlot {
    /// Swap list; `active` indexes the inserted image
    images: Vec<MountedImage>,
    active: usize,
}

/// Images mounted on drives A: to Z:
pub struct Registry {
    slots: Vec<DriveSlot>,
    player: AudioPlayer,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_index(drive: u8) -> Result<usize> {
    let index = drive as usize;
    if index < DRIVE_COUNT {
        Ok(index)
    } else {
        Err(ImageError::InvalidDrive(drive))
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: (0..DRIVE_COUNT).map(|_| DriveSlot::default()).collect(),
            player: AudioPlayer::new(),
        }
    }

    /// Mount `path` and add it to `drive`'s swap list
    ///
    /// The first image of a drive becomes the active one.
    pub fn mount(&mut self, drive: u8, path: &Path, options: &MountOptions) -> Result<&MountedImage> {
        let index = slot_index(drive)?;
        let image = mount(path, options)?;
        info!(
            drive = %drive_letter(drive),
            path = %path.display(),
            kind = ?image.kind(),
            "Mounted image"
        );
        let slot = &mut self.slots[index];
        slot.images.push(image);
        Ok(&slot.images[slot.images.len() - 1])
    }

    /// Insert an already opened image into `drive`'s swap list
    pub fn insert(&mut self, drive: u8, image: MountedImage) -> Result<()> {
        let index = slot_index(drive)?;
        self.slots[index].images.push(image);
        Ok(())
    }

    /// Remove every image of `drive`, returning how many were mounted
    ///
    /// Playback from the drive is stopped and CHD prefetch workers are
    /// joined before the images are dropped.
    pub fn unmount(&mut self, drive: u8) -> Result<usize> {
        let index = slot_index(drive)?;
        let slot = std::mem::take(&mut self.slots[index]);
        if slot.images.is_empty() {
            return Err(ImageError::DriveEmpty(drive));
        }
        self.player.release(drive);
        for image in &slot.images {
            image.shutdown();
        }
        info!(drive = %drive_letter(drive), count = slot.images.len(), "Unmounted drive");
        Ok(slot.images.len())
    }

    /// Make the next image of the swap list active
    pub fn swap_next(&mut self, drive: u8) -> Result<&MountedImage> {
        let index = slot_index(drive)?;
        let slot = &mut self.slots[index];
        if slot.images.is_empty() {
            return Err(ImageError::DriveEmpty(drive));
        }
        if slot.images.len() > 1 {
            self.player.release(drive);
        }
        slot.active = (slot.active + 1) % slot.images.len();
        let active = &slot.images[slot.active];
        info!(
            drive = %drive_letter(drive),
            position = slot.active + 1,
            total = slot.images.len(),
            path = %active.path().display(),
            "Swapped disk"
        );
        Ok(active)
    }

    /// Active image of `drive`
    pub fn get(&self, drive: u8) -> Option<&MountedImage> {
        let slot = self.slots.get(drive as usize)?;
        slot.images.get(slot.active)
    }

    /// Active images by drive index
    pub fn drives(&self) -> impl Iterator<Item = (u8, &MountedImage)> + '_ {
        (0..DRIVE_COUNT as u8).filter_map(move |d| self.get(d).map(|image| (d, image)))
    }

    fn cdrom(&self, drive: u8) -> Result<&Arc<CueSheet>> {
        slot_index(drive)?;
        self.get(drive)
            .ok_or(ImageError::DriveEmpty(drive))?
            .as_cdrom()
            .ok_or(ImageError::NotACdrom)
    }

    pub fn read_sectors(&self, drive: u8, start: u32, count: u32, raw: bool) -> Result<Vec<u8>> {
        slot_index(drive)?;
        self.get(drive)
            .ok_or(ImageError::DriveEmpty(drive))?
            .read_sectors(start, count, raw)
    }

    pub fn track_count(&self, drive: u8) -> Result<u8> {
        Ok(self.cdrom(drive)?.track_count())
    }

    pub fn geometry(&self, drive: u8) -> Result<Geometry> {
        slot_index(drive)?;
        self.get(drive)
            .ok_or(ImageError::DriveEmpty(drive))?
            .geometry()
            .ok_or_else(|| ImageError::InvalidImage("CD-ROM images have no disk geometry".to_string()))
    }

    pub fn player(&self) -> &AudioPlayer {
        &self.player
    }

    pub fn play_audio(&self, drive: u8, start: u32, len: u32) -> Result<()> {
        let disc = self.cdrom(drive)?;
        self.player.play(drive, disc, start, len)
    }

    pub fn pause(&self, resume: bool) {
        self.player.pause(resume);
    }

    pub fn stop(&self) {
        self.player.stop();
    }

    pub fn set_channel_control(&self, ctrl: ChannelControl) {
        self.player.set_channel_control(ctrl);
    }

    pub fn channel_control(&self) -> ChannelControl {
        self.player.channel_control()
    }

    pub fn audio_status(&self) -> AudioStatus {
        self.player.status()
    }

    pub fn audio_sub(&self, drive: u8) -> Result<Option<SubchannelInfo>> {
        self.cdrom(drive)?;
        Ok(self.player.audio_sub(drive))
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.player.stop();
        for slot in &self.slots {
            for image in &slot.images {
                image.shutdown();
            }
        }
    }
}

pub fn drive_letter(drive: u8) -> char {
    (b'A' + drive.min(25)) as char
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdrom::iso::tests::build_iso;
    use crate::cdrom::tests::write_sectors;
    use crate::cdrom::TrackMode;
    use crate::eltorito::tests::build_boot_iso;
    use std::fs;
    use tempfile::TempDir;

    fn audio_cue(dir: &TempDir) -> std::path::PathBuf {
        write_sectors(&dir.path().join("disc.bin"), 2352, 20);
        let cue = dir.path().join("disc.cue");
        fs::write(
            &cue,
            "FILE \"disc.bin\" BINARY\n  TRACK 01 MODE1/2352\n    INDEX 01 00:00:00\n  TRACK 02 AUDIO\n    INDEX 01 00:00:10\n",
        )
        .unwrap();
        cue
    }

    #[test]
    fn test_auto_detects_media() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("game.iso");
        fs::write(&iso, build_iso(TrackMode::Mode1Cooked, 20)).unwrap();
        let floppy = dir.path().join("disk.img");
        fs::write(&floppy, vec![0u8; 720 * 1024]).unwrap();
        let hdd = dir.path().join("hdd.img");
        let mut mbr = vec![0u8; 16 * 63 * 512];
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        fs::write(&hdd, mbr).unwrap();

        let options = MountOptions::default();
        assert_eq!(mount(&iso, &options).unwrap().kind(), MediaKind::Cdrom);
        assert_eq!(mount(&floppy, &options).unwrap().kind(), MediaKind::Floppy);
        let disk = mount(&hdd, &options).unwrap();
        assert_eq!(disk.kind(), MediaKind::HardDisk);
        assert_eq!(disk.geometry(), Some(Geometry::new(512, 63, 16, 1)));
    }

    #[test]
    fn test_mount_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = mount(&dir.path().join("nope.cue"), &MountOptions::default()).unwrap_err();
        assert!(matches!(err, ImageError::TrackFileNotFound(_)));
    }

    #[test]
    fn test_mount_el_torito_floppy() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("boot.iso");
        fs::write(&iso, build_boot_iso(1)).unwrap();

        let options = MountOptions {
            el_torito: true,
            ..Default::default()
        };
        let image = mount(&iso, &options).unwrap();
        assert_eq!(image.kind(), MediaKind::Floppy);
        assert_eq!(image.geometry(), Some(Geometry::new(512, 15, 2, 80)));

        let plain = dir.path().join("plain.iso");
        fs::write(&plain, build_iso(TrackMode::Mode1Cooked, 40)).unwrap();
        assert!(matches!(mount(&plain, &options), Err(ImageError::ElToritoNotFound)));
    }

    #[test]
    fn test_registry_reads_and_info() {
        let dir = TempDir::new().unwrap();
        let cue = audio_cue(&dir);
        let mut registry = Registry::new();
        registry.mount(3, &cue, &MountOptions::default()).unwrap();

        assert_eq!(registry.track_count(3).unwrap(), 2);
        let raw = registry.read_sectors(3, 4, 1, true).unwrap();
        assert_eq!(raw.len(), 2352);
        assert!(raw.iter().all(|&b| b == 4));

        let info = registry.get(3).unwrap().info();
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"kind\":\"cdrom\""));
        assert_eq!(info.tracks.unwrap().len(), 2);

        assert!(matches!(registry.get(4), None));
        assert!(matches!(registry.read_sectors(4, 0, 1, false), Err(ImageError::DriveEmpty(4))));
        assert!(matches!(registry.track_count(30), Err(ImageError::InvalidDrive(30))));
        assert!(matches!(registry.geometry(3), Err(ImageError::InvalidImage(_))));
    }

    #[test]
    fn test_unmount_releases_player() {
        let dir = TempDir::new().unwrap();
        let cue = audio_cue(&dir);
        let mut registry = Registry::new();
        registry.mount(3, &cue, &MountOptions::default()).unwrap();

        registry.play_audio(3, 10, 5).unwrap();
        assert!(registry.audio_status().playing);
        assert!(registry.audio_sub(3).unwrap().is_some());

        assert_eq!(registry.unmount(3).unwrap(), 1);
        assert!(!registry.audio_status().playing);
        assert!(matches!(registry.unmount(3), Err(ImageError::DriveEmpty(3))));
        assert!(matches!(registry.play_audio(3, 10, 5), Err(ImageError::DriveEmpty(3))));
    }

    #[test]
    fn test_swap_list_rotates() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.img");
        let b = dir.path().join("b.img");
        fs::write(&a, vec![0xAAu8; 1440 * 1024]).unwrap();
        fs::write(&b, vec![0xBBu8; 1440 * 1024]).unwrap();

        let mut registry = Registry::new();
        let options = MountOptions::default();
        registry.mount(0, &a, &options).unwrap();
        registry.mount(0, &b, &options).unwrap();
        assert_eq!(registry.get(0).unwrap().path(), a.as_path());

        assert_eq!(registry.swap_next(0).unwrap().path(), b.as_path());
        assert_eq!(registry.read_sectors(0, 0, 1, false).unwrap()[0], 0xBB);
        assert_eq!(registry.swap_next(0).unwrap().path(), a.as_path());
        assert_eq!(registry.drives().count(), 1);
        assert!(matches!(registry.play_audio(0, 0, 1), Err(ImageError::NotACdrom)));
    }

    #[test]
    fn test_drive_letters() {
        assert_eq!(drive_letter(0), 'A');
        assert_eq!(drive_letter(3), 'D');
    }
}
