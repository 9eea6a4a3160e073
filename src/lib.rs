//! Disk and optical media image backends for a PC emulator
//!
//! - `cdrom`: CD-ROM images (ISO, CUE/BIN, CloneCD, CHD) as track lists
//!   with sector reads, TOC queries and CD audio playback
//! - `disk`: hard disk and floppy images (raw, VHD, El Torito boot floppy)
//!   with BIOS geometry detection
//! - `mount`: turns a path and options into a mounted image and keeps the
//!   per-drive registry

pub mod cdrom;
pub mod common;
pub mod disk;
pub mod eltorito;
pub mod error;
pub mod logging;
pub mod mount;
pub mod trackfile;

pub use cdrom::{AudioPlayer, CueSheet, LoadOptions, Track, TrackMode};
pub use disk::{DiskImage, Geometry};
pub use eltorito::ElToritoBoot;
pub use error::{ImageError, MountError, Result};
pub use mount::{mount, MediaKind, MountInfo, MountOptions, MountedImage, Registry};
pub use trackfile::TrackFile;
