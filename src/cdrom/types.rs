//! CD-ROM track and table-of-contents types

use std::sync::Arc;

use serde::Serialize;

use crate::common::{Msf, COOKED_SECTOR_SIZE, MODE2_SECTOR_SIZE, RAW_SECTOR_SIZE};
use crate::error::{ImageError, Result};
use crate::trackfile::TrackFile;

/// Q-channel control attribute of a data track
pub const ATTR_DATA: u8 = 0x40;
/// Q-channel control attribute of an audio track
pub const ATTR_AUDIO: u8 = 0x00;

// =============================================================================
// Track Mode
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackMode {
    Audio,
    #[serde(rename = "MODE1/2048")]
    Mode1Cooked,
    #[serde(rename = "MODE1/2352")]
    Mode1Raw,
    #[serde(rename = "MODE2/2336")]
    Mode2,
    #[serde(rename = "MODE2/2352")]
    Mode2Raw,
}

impl TrackMode {
    /// Parse a CUE `TRACK` mode token (already upper-cased)
    ///
    /// `line` is used for syntax errors.
    pub fn from_cue(token: &str, line: usize) -> Result<Self> {
        match token {
            "AUDIO" => Ok(TrackMode::Audio),
            "MODE1/2048" => Ok(TrackMode::Mode1Cooked),
            "MODE1/2352" => Ok(TrackMode::Mode1Raw),
            "MODE2/2336" => Ok(TrackMode::Mode2),
            "MODE2/2352" => Ok(TrackMode::Mode2Raw),
            t if t.starts_with("MODE1/") || t.starts_with("MODE2/") => {
                Err(ImageError::UnsupportedSectorSize(format!("track mode {}", t)))
            }
            t => Err(ImageError::cue(line, format!("unknown track mode {:?}", t))),
        }
    }

    pub fn sector_size(self) -> u32 {
        match self {
            TrackMode::Mode1Cooked => COOKED_SECTOR_SIZE,
            TrackMode::Mode2 => MODE2_SECTOR_SIZE,
            TrackMode::Audio | TrackMode::Mode1Raw | TrackMode::Mode2Raw => RAW_SECTOR_SIZE,
        }
    }

    pub fn is_audio(self) -> bool {
        self == TrackMode::Audio
    }

    pub fn is_mode2(self) -> bool {
        matches!(self, TrackMode::Mode2 | TrackMode::Mode2Raw)
    }

    pub fn attr(self) -> u8 {
        if self.is_audio() {
            ATTR_AUDIO
        } else {
            ATTR_DATA
        }
    }

    /// Offset of the 2048 user bytes inside one stored sector
    pub fn cooked_offset(self) -> u32 {
        match self {
            TrackMode::Mode1Raw => 16,
            TrackMode::Mode2Raw => 24,
            TrackMode::Mode2 => 8,
            TrackMode::Mode1Cooked | TrackMode::Audio => 0,
        }
    }
}

// =============================================================================
// Track
// =============================================================================

/// One track of a disc
///
/// Invariant after mount: tracks are sorted by `start`, and each track's
/// `start + length` is at or before the next track's `start`.
#[derive(Clone)]
pub struct Track {
    pub number: u8,
    pub mode: TrackMode,
    /// First sector (LBA) of INDEX 01
    pub start: u32,
    /// Sectors backed by the file; sectors between `start + length` and the
    /// next track are gap and read as zeros
    pub length: u32,
    /// Byte offset of the track's first sector in `file`
    pub skip: u64,
    /// Silent sectors inserted before this track
    pub pregap: u32,
    /// Silent sectors inserted after this track
    pub postgap: u32,
    pub file: Arc<TrackFile>,
}

impl Track {
    pub fn attr(&self) -> u8 {
        self.mode.attr()
    }

    pub fn sector_size(&self) -> u32 {
        self.mode.sector_size()
    }

    /// Bytes between consecutive sectors in the backing file
    pub fn stride(&self) -> u32 {
        self.file.chunk_size().unwrap_or_else(|| self.sector_size())
    }

    pub fn end(&self) -> u32 {
        self.start + self.length
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("number", &self.number)
            .field("mode", &self.mode)
            .field("start", &self.start)
            .field("length", &self.length)
            .field("skip", &self.skip)
            .field("file", &self.file.path())
            .finish()
    }
}

/// Serializable track summary for front ends
#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub number: u8,
    pub mode: TrackMode,
    pub start: u32,
    pub length: u32,
    pub start_msf: Msf,
    pub file: String,
}

impl From<&Track> for TrackSummary {
    fn from(track: &Track) -> Self {
        Self {
            number: track.number,
            mode: track.mode,
            start: track.start,
            length: track.length,
            start_msf: Msf::from_frames(track.start + crate::common::LEAD_IN_FRAMES),
            file: track.file.path().display().to_string(),
        }
    }
}

// =============================================================================
// TOC / Player Query Results
// =============================================================================

/// First and last audio track numbers plus the leadout position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTracks {
    pub first: u8,
    pub last: u8,
    pub leadout: Msf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackInfo {
    pub start: Msf,
    pub attr: u8,
}

/// Q-subchannel position report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubchannelInfo {
    pub attr: u8,
    pub track: u8,
    pub index: u8,
    pub relative: Msf,
    pub absolute: Msf,
}

/// Output channel routing and volume set by the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelControl {
    /// Source channel feeding each output channel
    pub out: [u8; 4],
    pub vol: [u8; 4],
}

impl Default for ChannelControl {
    fn default() -> Self {
        Self {
            out: [0, 1, 2, 3],
            vol: [0xFF; 4],
        }
    }
}

impl ChannelControl {
    /// Whether routing or volume differs from straight stereo at full level
    pub fn is_active(&self) -> bool {
        self.out[0] != 0 || self.out[1] != 1 || self.vol[0] < 0xFE || self.vol[1] < 0xFE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioStatus {
    pub playing: bool,
    pub paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_tokens() {
        assert_eq!(TrackMode::from_cue("MODE1/2352", 1).unwrap(), TrackMode::Mode1Raw);
        assert_eq!(TrackMode::Mode2.cooked_offset(), 8);
        assert_eq!(TrackMode::Mode2Raw.cooked_offset(), 24);
        assert_eq!(TrackMode::Audio.attr(), ATTR_AUDIO);
        assert!(matches!(
            TrackMode::from_cue("MODE1/2340", 3),
            Err(ImageError::UnsupportedSectorSize(_))
        ));
        assert!(matches!(
            TrackMode::from_cue("CDG", 3),
            Err(ImageError::BadCueSyntax { line: 3, .. })
        ));
    }

    #[test]
    fn test_channel_control_activation() {
        assert!(!ChannelControl::default().is_active());
        let swapped = ChannelControl {
            out: [1, 0, 2, 3],
            ..ChannelControl::default()
        };
        assert!(swapped.is_active());
        let quiet = ChannelControl {
            vol: [0x80, 0xFF, 0xFF, 0xFF],
            ..ChannelControl::default()
        };
        assert!(quiet.is_active());
        let near_full = ChannelControl {
            vol: [0xFE, 0xFE, 0, 0],
            ..ChannelControl::default()
        };
        assert!(!near_full.is_active());
    }
}
