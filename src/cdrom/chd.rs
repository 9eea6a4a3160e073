//! CHD CD-ROM loader
//!
//! Track layout comes from the CD track metadata (`CHT2`, or the older
//! `CHTR` without gap fields). Tracks are stored back to back as 2448-byte
//! frames, each track padded to a multiple of four frames.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, warn};

use super::{CueSheet, LoadOptions, Track, TrackMode};
use crate::common::{COOKED_SECTOR_SIZE, RAW_SECTOR_SIZE};
use crate::error::{ImageError, Result};
use crate::trackfile::chd::{read_metadata, CHD_FRAME_SIZE};
use crate::trackfile::{ChdFile, TrackFile};

/// CD track metadata with gap information
pub const CDROM_TRACK_METADATA2_TAG: u32 = u32::from_be_bytes(*b"CHT2");
/// CD track metadata without gap information
pub const CDROM_TRACK_METADATA_TAG: u32 = u32::from_be_bytes(*b"CHTR");

/// Frames per track in the hunk stream are padded to this multiple
const TRACK_PADDING: u32 = 4;

/// One track as described by CHD metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChdTrackMeta {
    pub number: u8,
    pub track_type: String,
    pub frames: u32,
    pub pregap: u32,
    /// Pregap type; a leading `V` means the pregap frames are in the stream
    pub pgtype: String,
    pub postgap: u32,
}

fn track_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"TRACK:(\d+) TYPE:(\S+) SUBTYPE:(\S+) FRAMES:(\d+)(?: PREGAP:(\d+) PGTYPE:(\S+) PGSUB:(\S+) POSTGAP:(\d+))?",
        )
        .expect("valid regex")
    })
}

/// Parse the text of a `CHT2` or `CHTR` metadata entry
pub fn parse_track_metadata(text: &str) -> Result<ChdTrackMeta> {
    let caps = track_regex()
        .captures(text)
        .ok_or_else(|| ImageError::Chd(format!("unrecognized track metadata {:?}", text)))?;
    let num = |i: usize| -> Result<u32> {
        caps.get(i)
            .map_or(Ok(0), |m| m.as_str().parse())
            .map_err(|_| ImageError::Chd(format!("bad number in track metadata {:?}", text)))
    };

    let number = u8::try_from(num(1)?)
        .map_err(|_| ImageError::Chd(format!("track number out of range in {:?}", text)))?;
    Ok(ChdTrackMeta {
        number,
        track_type: caps[2].to_string(),
        frames: num(4)?,
        pregap: num(5)?,
        pgtype: caps.get(6).map_or_else(String::new, |m| m.as_str().to_string()),
        postgap: num(8)?,
    })
}

fn mode_for(track_type: &str) -> Result<TrackMode> {
    match track_type {
        "MODE1" | "MODE2_FORM1" => Ok(TrackMode::Mode1Cooked),
        "MODE1_RAW" => Ok(TrackMode::Mode1Raw),
        "MODE2_RAW" => Ok(TrackMode::Mode2Raw),
        "MODE2" | "MODE2_FORM_MIX" => Ok(TrackMode::Mode2),
        "AUDIO" => Ok(TrackMode::Audio),
        other => Err(ImageError::UnsupportedSectorSize(format!(
            "CHD track type {}",
            other
        ))),
    }
}

/// Place CHD tracks on the disc; returns the tracks and the leadout sector
pub fn layout_tracks(
    metas: &[ChdTrackMeta],
    file: &Arc<TrackFile>,
    options: LoadOptions,
) -> Result<(Vec<Track>, u32)> {
    let mut tracks = Vec::with_capacity(metas.len());
    let mut disc_pos: u64 = 0;
    let mut file_frame: u64 = 0;
    let mut cooked_data = false;
    let mut raw_data = false;

    for (i, meta) in metas.iter().enumerate() {
        if meta.number as usize != i + 1 {
            return Err(ImageError::Chd(format!(
                "track {} found where track {} was expected",
                meta.number,
                i + 1
            )));
        }
        let mode = mode_for(&meta.track_type)?;
        if !mode.is_audio() {
            match mode.sector_size() {
                COOKED_SECTOR_SIZE => cooked_data = true,
                RAW_SECTOR_SIZE => raw_data = true,
                _ => {}
            }
        }

        let stored_pregap = meta.pgtype.starts_with('V');
        let (length, skip_frames) = if stored_pregap {
            (meta.frames.saturating_sub(meta.pregap), file_frame + meta.pregap as u64)
        } else {
            (meta.frames, file_frame)
        };
        let start = disc_pos + meta.pregap as u64;

        tracks.push(Track {
            number: meta.number,
            mode,
            start: u32::try_from(start).map_err(|_| ImageError::Chd("disc is too long".into()))?,
            length,
            skip: skip_frames * CHD_FRAME_SIZE as u64,
            pregap: meta.pregap,
            postgap: meta.postgap,
            file: Arc::clone(file),
        });

        disc_pos = start + length as u64 + meta.postgap as u64;
        file_frame += meta.frames.div_ceil(TRACK_PADDING) as u64 * TRACK_PADDING as u64;
    }

    if tracks.is_empty() {
        return Err(ImageError::Chd("no CD track metadata".into()));
    }
    if cooked_data && raw_data {
        if options.skip_sync {
            warn!("CHD mixes 2048- and 2352-byte data tracks; loading anyway (skip_sync)");
        } else {
            return Err(ImageError::UnsupportedSectorSize(
                "CHD mixes 2048- and 2352-byte data tracks".into(),
            ));
        }
    }

    let leadout = u32::try_from(disc_pos).map_err(|_| ImageError::Chd("disc is too long".into()))?;
    Ok((tracks, leadout))
}

pub fn load(path: &Path, options: LoadOptions) -> Result<CueSheet> {
    let mut metas = read_metadata(path)?
        .into_iter()
        .filter(|(tag, _)| *tag == CDROM_TRACK_METADATA2_TAG || *tag == CDROM_TRACK_METADATA_TAG)
        .map(|(_, text)| parse_track_metadata(&text))
        .collect::<Result<Vec<_>>>()?;
    metas.sort_by_key(|m| m.number);
    debug!(path = %path.display(), tracks = metas.len(), "Read CHD track metadata");

    let file = Arc::new(TrackFile::ChdHunked(ChdFile::open(path)?));
    let (tracks, leadout) = match layout_tracks(&metas, &file, options) {
        Ok(layout) => layout,
        Err(e) => {
            file.shutdown();
            return Err(e);
        }
    };
    Ok(CueSheet::new(path, tracks, leadout, String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackfile::hunk_cache::tests::MemorySource;
    use std::sync::atomic::AtomicU64;

    fn memory_file() -> Arc<TrackFile> {
        let chd = ChdFile::from_source(Path::new("mem.chd"), || {
            Ok(MemorySource {
                hunks: 64,
                bytes: CHD_FRAME_SIZE * 8,
                reads: Arc::new(AtomicU64::new(0)),
                fail_hunk: None,
            })
        })
        .unwrap();
        Arc::new(TrackFile::ChdHunked(chd))
    }

    #[test]
    fn test_parse_cht2_and_chtr() {
        let meta = parse_track_metadata(
            "TRACK:2 TYPE:AUDIO SUBTYPE:NONE FRAMES:1000 PREGAP:150 PGTYPE:VAUDIO PGSUB:RW POSTGAP:0",
        )
        .unwrap();
        assert_eq!(meta.number, 2);
        assert_eq!(meta.frames, 1000);
        assert_eq!(meta.pregap, 150);
        assert_eq!(meta.pgtype, "VAUDIO");

        let old = parse_track_metadata("TRACK:1 TYPE:MODE1_RAW SUBTYPE:NONE FRAMES:300").unwrap();
        assert_eq!(old.track_type, "MODE1_RAW");
        assert_eq!(old.pregap, 0);
        assert!(parse_track_metadata("garbage").is_err());
    }

    #[test]
    fn test_layout_with_stored_pregap_and_padding() {
        let file = memory_file();
        let metas = [
            parse_track_metadata("TRACK:1 TYPE:MODE1_RAW SUBTYPE:NONE FRAMES:101 PREGAP:0 PGTYPE:MODE1 PGSUB:RW POSTGAP:0").unwrap(),
            parse_track_metadata("TRACK:2 TYPE:AUDIO SUBTYPE:NONE FRAMES:250 PREGAP:150 PGTYPE:VAUDIO PGSUB:RW POSTGAP:0").unwrap(),
        ];
        let (tracks, leadout) = layout_tracks(&metas, &file, LoadOptions::default()).unwrap();

        assert_eq!(tracks[0].start, 0);
        assert_eq!(tracks[0].length, 101);
        // 101 frames pad to 104, then the 150 stored pregap frames
        assert_eq!(tracks[1].skip, (104 + 150) * CHD_FRAME_SIZE as u64);
        assert_eq!(tracks[1].start, 101 + 150);
        assert_eq!(tracks[1].length, 100);
        assert_eq!(leadout, 351);
        assert_eq!(tracks[1].stride(), CHD_FRAME_SIZE);
        file.shutdown();
    }

    #[test]
    fn test_mixed_sector_sizes_need_skip_sync() {
        let file = memory_file();
        let metas = [
            parse_track_metadata("TRACK:1 TYPE:MODE1 SUBTYPE:NONE FRAMES:40").unwrap(),
            parse_track_metadata("TRACK:2 TYPE:MODE1_RAW SUBTYPE:NONE FRAMES:40").unwrap(),
        ];
        assert!(matches!(
            layout_tracks(&metas, &file, LoadOptions::default()),
            Err(ImageError::UnsupportedSectorSize(_))
        ));
        let (tracks, _) = layout_tracks(&metas, &file, LoadOptions { skip_sync: true }).unwrap();
        assert_eq!(tracks.len(), 2);

        let bad = [parse_track_metadata("TRACK:1 TYPE:MODE2_FORM2 SUBTYPE:NONE FRAMES:4").unwrap()];
        assert!(matches!(
            layout_tracks(&bad, &file, LoadOptions::default()),
            Err(ImageError::UnsupportedSectorSize(_))
        ));
    }

    #[test]
    fn test_reads_through_chd_track() {
        let file = memory_file();
        let metas = [parse_track_metadata("TRACK:1 TYPE:MODE1_RAW SUBTYPE:NONE FRAMES:100").unwrap()];
        let (tracks, leadout) = layout_tracks(&metas, &file, LoadOptions::default()).unwrap();
        let sheet = CueSheet::new(Path::new("mem.chd"), tracks, leadout, String::new());

        // Sector 9 is frame 9, the second frame of hunk 1 (8 frames per hunk)
        let mut buf = vec![0u8; 2048];
        sheet.read_sector(&mut buf, false, 9).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
        sheet.shutdown();
    }
}
