// Common utilities shared across image container parsers

pub mod binary;
pub mod msf;

// Re-exports for convenience
pub use binary::{be_u16, be_u32, be_u64, le_u16, le_u32, read_exact_at};
pub use msf::{Msf, FRAMES_PER_SECOND, LEAD_IN_FRAMES};

/// Raw CD sector: sync + header + 2048 data + EDC/ECC, or 588 stereo samples
pub const RAW_SECTOR_SIZE: u32 = 2352;
/// User data portion of a MODE1 / MODE2 FORM1 sector
pub const COOKED_SECTOR_SIZE: u32 = 2048;
/// MODE2 sector without the 16-byte sync+header
pub const MODE2_SECTOR_SIZE: u32 = 2336;
/// Hard disk / floppy sector size
pub const DISK_SECTOR_SIZE: u32 = 512;
