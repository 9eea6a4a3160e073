//! Red Book minute:second:frame addressing (75 frames per second)

use serde::Serialize;

/// CD frames (sectors) per second of audio
pub const FRAMES_PER_SECOND: u32 = 75;

/// Lead-in offset between LBA 0 and MSF 00:02:00
pub const LEAD_IN_FRAMES: u32 = 150;

/// A minute:second:frame position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Msf {
    pub min: u8,
    pub sec: u8,
    pub fr: u8,
}

impl Msf {
    pub fn new(min: u8, sec: u8, fr: u8) -> Self {
        Self { min, sec, fr }
    }

    /// Convert a frame count to MSF; minutes saturate at 255
    pub fn from_frames(frames: u32) -> Self {
        let fr = (frames % FRAMES_PER_SECOND) as u8;
        let total_secs = frames / FRAMES_PER_SECOND;
        let sec = (total_secs % 60) as u8;
        let min = (total_secs / 60).min(u8::MAX as u32) as u8;
        Self { min, sec, fr }
    }

    pub fn to_frames(self) -> u32 {
        (self.min as u32 * 60 + self.sec as u32) * FRAMES_PER_SECOND + self.fr as u32
    }

    /// Parse `mm:ss:ff` as written in CUE sheets into a frame count
    pub fn parse_frames(text: &str) -> Option<u32> {
        let mut parts = text.trim().split(':');
        let min: u32 = parts.next()?.parse().ok()?;
        let sec: u32 = parts.next()?.parse().ok()?;
        let fr: u32 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || sec >= 60 || fr >= FRAMES_PER_SECOND {
            return None;
        }
        min.checked_mul(60)?
            .checked_add(sec)?
            .checked_mul(FRAMES_PER_SECOND)?
            .checked_add(fr)
    }
}

impl std::fmt::Display for Msf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.min, self.sec, self.fr)
    }
}
