//! CD-ROM images: the track list, sector reads and TOC queries
//!
//! Every container format (ISO, CUE/BIN, CloneCD, CHD) is loaded into the same
//! `CueSheet` shape: an ordered list of tracks plus the leadout sector. The
//! sheet is immutable after loading and can be read from any thread.

pub mod ccd;
pub mod chd;
pub mod cue;
pub mod iso;
pub mod player;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

pub use self::player::AudioPlayer;
pub use self::types::*;

use crate::common::{Msf, COOKED_SECTOR_SIZE, LEAD_IN_FRAMES, RAW_SECTOR_SIZE};
use crate::error::{ImageError, Result};
use crate::trackfile::TrackFile;

// =============================================================================
// Track List Builder
// =============================================================================

/// A track as described by a sheet, before its position on disc is known
pub(crate) struct NewTrack {
    pub number: u8,
    pub mode: TrackMode,
    /// INDEX 01, in frames from the start of the file
    pub index1: u32,
    /// INDEX 00, in frames from the start of the file
    pub index0: Option<u32>,
    pub pregap: u32,
    pub postgap: u32,
    pub file: Arc<TrackFile>,
}

/// Lays tracks out on the disc as they are read from a sheet
///
/// Tracks sharing a file are positioned relative to the previous track in
/// that file; a track that starts a new file begins after the previous
/// track's last sector (its length taken from the file size).
#[derive(Default)]
pub(crate) struct TrackListBuilder {
    tracks: Vec<Track>,
    /// Disc sector at which the current file begins
    shift: i64,
    /// Gap sectors accumulated since the current file began
    total_pregap: i64,
}

fn stride_of(mode: TrackMode, file: &TrackFile) -> i64 {
    file.chunk_size().unwrap_or_else(|| mode.sector_size()) as i64
}

/// Sectors from `skip` to the end of the file, rounding a partial sector up
fn sectors_in_file(track: &Track) -> std::result::Result<u32, String> {
    let len = track.file.length();
    if len < track.skip {
        return Err(format!(
            "track {} starts past the end of {}",
            track.number,
            track.file.path().display()
        ));
    }
    let stride = track.stride().max(1) as u64;
    u32::try_from((len - track.skip).div_ceil(stride))
        .map_err(|_| format!("track {} is too long", track.number))
}

fn to_sector(value: i64, what: &str) -> std::result::Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("{} out of range ({})", what, value))
}

impl TrackListBuilder {
    pub fn add(&mut self, new: NewTrack) -> std::result::Result<(), String> {
        let index1 = new.index1 as i64;
        let stride = stride_of(new.mode, &new.file);

        let skip = match new.index0 {
            Some(index0) if index0 > new.index1 => {
                return Err(format!("track {} has INDEX 00 after INDEX 01", new.number));
            }
            Some(index0) => index1 - index0 as i64,
            None => 0,
        };

        // INDEX 00 describes the gap as stored in the file; a PREGAP on the
        // same track would count it twice
        let mut pregap = new.pregap as i64;
        if skip > 0 && pregap > 0 {
            warn!(
                track = new.number,
                "Both INDEX 00 and PREGAP given; ignoring PREGAP"
            );
            pregap = 0;
        }
        let gap = pregap + self.tracks.last().map_or(0, |t| t.postgap as i64);

        let Some(prev) = self.tracks.last_mut() else {
            if new.number != 1 {
                return Err(format!("first track is {} instead of 1", new.number));
            }
            self.total_pregap = gap;
            self.shift = 0;
            self.tracks.push(Track {
                number: new.number,
                mode: new.mode,
                start: to_sector(index1 + gap, "track start")?,
                length: 0,
                skip: (skip * stride) as u64,
                pregap: pregap as u32,
                postgap: new.postgap,
                file: new.file,
            });
            return Ok(());
        };

        let start;
        let track_skip;
        if Arc::ptr_eq(&prev.file, &new.file) {
            let shifted = index1 + self.shift;
            let prev_length = shifted + self.total_pregap - prev.start as i64 - skip;
            if prev_length < 0 {
                return Err(format!(
                    "track {} would give track {} a negative length",
                    new.number, prev.number
                ));
            }
            prev.length = to_sector(prev_length, "track length")?;
            track_skip = prev.skip as i64 + prev_length * stride_of(prev.mode, &prev.file) + skip * stride;
            self.total_pregap += gap;
            start = shifted + self.total_pregap;
        } else {
            prev.length = sectors_in_file(prev)?;
            let prev_end = prev.start as i64 + prev.length as i64;
            start = index1 + prev_end + gap;
            track_skip = skip * stride;
            self.shift = prev_end;
            self.total_pregap = gap;
        }

        if new.number <= 1 {
            return Err(format!("track number {} after the first track", new.number));
        }
        if prev.number.checked_add(1) != Some(new.number) {
            return Err(format!(
                "track {} follows track {}; numbers must increase by one",
                new.number, prev.number
            ));
        }
        if start < prev.start as i64 + prev.length as i64 {
            return Err(format!(
                "track {} starts at sector {} inside track {}",
                new.number, start, prev.number
            ));
        }

        trace!(track = new.number, start, skip = track_skip, "Added track");
        self.tracks.push(Track {
            number: new.number,
            mode: new.mode,
            start: to_sector(start, "track start")?,
            length: 0,
            skip: track_skip as u64,
            pregap: pregap as u32,
            postgap: new.postgap,
            file: new.file,
        });
        Ok(())
    }

    /// Close the last track against its file size and compute the leadout
    pub fn finish(mut self) -> std::result::Result<(Vec<Track>, u32), String> {
        let last = self.tracks.last_mut().ok_or("sheet contains no tracks")?;
        last.length = sectors_in_file(last)?;
        let leadout = last.start as u64 + last.length as u64 + last.postgap as u64;
        let leadout = u32::try_from(leadout).map_err(|_| "disc is too long".to_string())?;
        Ok((self.tracks, leadout))
    }
}

// =============================================================================
// Cue Sheet
// =============================================================================

/// Options that change how a CD image is loaded
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Accept CHDs mixing 2048- and 2352-byte data tracks
    pub skip_sync: bool,
}

/// A loaded CD-ROM image
pub struct CueSheet {
    path: PathBuf,
    tracks: Vec<Track>,
    leadout: u32,
    mcn: String,
}

impl std::fmt::Debug for CueSheet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CueSheet")
            .field("path", &self.path)
            .field("tracks", &self.tracks)
            .field("leadout", &self.leadout)
            .finish()
    }
}

impl CueSheet {
    pub(crate) fn new(path: &Path, tracks: Vec<Track>, leadout: u32, mcn: String) -> Self {
        debug_assert!(tracks
            .windows(2)
            .all(|w| w[0].start + w[0].length <= w[1].start));
        Self {
            path: path.to_path_buf(),
            tracks,
            leadout,
            mcn,
        }
    }

    /// Load any supported CD image, picking the loader by extension and magic
    pub fn open(path: &Path, options: LoadOptions) -> Result<Self> {
        if !path.exists() {
            return Err(ImageError::TrackFileNotFound(path.to_path_buf()));
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let sheet = match ext.as_str() {
            "cue" => cue::load(path)?,
            "ccd" => ccd::load(path)?,
            _ if crate::trackfile::is_chd(path) => chd::load(path, options)?,
            _ => iso::load(path)?,
        };

        info!(
            path = %path.display(),
            tracks = sheet.track_count(),
            leadout = sheet.leadout,
            "Loaded CD-ROM image"
        );
        Ok(sheet)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track_count(&self) -> u8 {
        self.tracks.len() as u8
    }

    pub fn leadout_sector(&self) -> u32 {
        self.leadout
    }

    pub fn mcn(&self) -> &str {
        &self.mcn
    }

    /// UPC/EAN as reported to the guest: control attribute 0 plus the MCN
    pub fn upc(&self) -> (u8, &str) {
        (0, &self.mcn)
    }

    pub fn has_data_track(&self) -> bool {
        self.tracks.iter().any(|t| t.attr() == ATTR_DATA)
    }

    /// The track containing `sector`, counting trailing gap sectors
    pub fn track_at(&self, sector: u32) -> Option<&Track> {
        self.tracks.iter().enumerate().find_map(|(i, t)| {
            let end = self.tracks.get(i + 1).map_or(self.leadout, |n| n.start);
            (t.start <= sector && sector < end).then_some(t)
        })
    }

    pub fn audio_tracks(&self) -> AudioTracks {
        AudioTracks {
            first: 1,
            last: self.track_count(),
            leadout: Msf::from_frames(self.leadout + LEAD_IN_FRAMES),
        }
    }

    /// Start and attribute of track `number`; `track_count() + 1` is the leadout
    pub fn track_info(&self, number: u8) -> Option<TrackInfo> {
        let idx = (number as usize).checked_sub(1)?;
        if let Some(track) = self.tracks.get(idx) {
            return Some(TrackInfo {
                start: Msf::from_frames(track.start + LEAD_IN_FRAMES),
                attr: track.attr(),
            });
        }
        (idx == self.tracks.len()).then(|| TrackInfo {
            start: Msf::from_frames(self.leadout + LEAD_IN_FRAMES),
            attr: ATTR_AUDIO,
        })
    }

    /// Q-subchannel report for the sector the player is at
    pub fn audio_sub(&self, frame: u32) -> Option<SubchannelInfo> {
        let track = self.track_at(frame)?;
        Some(SubchannelInfo {
            attr: track.attr(),
            track: track.number,
            index: 1,
            relative: Msf::from_frames(frame - track.start),
            absolute: Msf::from_frames(frame + LEAD_IN_FRAMES),
        })
    }

    /// Read one sector into `buf` (2352 bytes raw, 2048 cooked)
    pub fn read_sector(&self, buf: &mut [u8], raw: bool, sector: u32) -> Result<()> {
        let length = if raw { RAW_SECTOR_SIZE } else { COOKED_SECTOR_SIZE } as usize;
        let buf = buf
            .get_mut(..length)
            .ok_or_else(|| ImageError::InvalidImage(format!("sector buffer shorter than {}", length)))?;

        let track = self
            .track_at(sector)
            .ok_or(ImageError::SectorOutOfRange { sector: sector as u64 })?;

        if raw && track.sector_size() != RAW_SECTOR_SIZE {
            return Err(ImageError::UnsupportedSectorSize(format!(
                "raw read from {}-byte track {}",
                track.sector_size(),
                track.number
            )));
        }
        if !raw && track.mode.is_audio() {
            warn!(sector, track = track.number, "Rejecting cooked read from audio sector");
            return Err(ImageError::InvalidImage(format!(
                "cooked read from audio track {}",
                track.number
            )));
        }

        if sector >= track.end() {
            buf.fill(0);
            return Ok(());
        }

        let mut seek = track.skip + (sector - track.start) as u64 * track.stride() as u64;
        if !raw {
            seek += track.mode.cooked_offset() as u64;
        }

        if track.mode.is_audio() {
            track.file.read_audio(buf, seek).map(|_| ())
        } else {
            track.file.read(buf, seek)
        }
    }

    /// Read `count` consecutive sectors; fails on the first unreadable one
    pub fn read_sectors(&self, start: u32, count: u32, raw: bool) -> Result<Vec<u8>> {
        let size = if raw { RAW_SECTOR_SIZE } else { COOKED_SECTOR_SIZE } as usize;
        let mut out = vec![0u8; size * count as usize];
        for (i, chunk) in out.chunks_exact_mut(size).enumerate() {
            self.read_sector(chunk, raw, start + i as u32)?;
        }
        Ok(out)
    }

    /// Stop background workers of every track file; used before unmounting
    pub fn shutdown(&self) {
        let mut seen: Vec<&Arc<TrackFile>> = Vec::new();
        for track in &self.tracks {
            if !seen.iter().any(|f| Arc::ptr_eq(f, &track.file)) {
                track.file.shutdown();
                seen.push(&track.file);
            }
        }
        debug!(path = %self.path.display(), "CD-ROM image shut down");
    }

    pub fn summaries(&self) -> Vec<TrackSummary> {
        self.tracks.iter().map(TrackSummary::from).collect()
    }
}
