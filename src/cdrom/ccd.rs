//! CloneCD loader (`.ccd` control file + `.img` raw sectors + optional `.sub`)
//!
//! The `.ccd` file is INI-style. Track starts come from the TOC entries
//! (`[Entry n]` with `Point` 1..=99); the data mode comes from the session's
//! `PreGapMode` unless a `[TRACK n]` section names one.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::{CueSheet, NewTrack, TrackListBuilder, TrackMode};
use crate::error::{ImageError, Result};
use crate::trackfile::{FileKind, TrackFile};

/// TOC point of the leadout entry
const POINT_LEADOUT: i64 = 0xA2;
/// Q-channel control bit marking a data track
const CONTROL_DATA: i64 = 0x04;

type Sections = Vec<(String, HashMap<String, String>)>;

fn parse_sections(text: &str) -> Sections {
    let mut sections: Sections = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push((name.trim().to_ascii_uppercase(), HashMap::new()));
        } else if let Some((key, value)) = line.split_once('=') {
            if let Some((_, entries)) = sections.last_mut() {
                entries.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
            }
        }
    }
    sections
}

/// Decimal or `0x` hex, possibly negative
fn parse_number(text: &str) -> Option<i64> {
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if neg { -value } else { value })
}

fn field(entries: &HashMap<String, String>, key: &str, section: &str) -> Result<i64> {
    let text = entries
        .get(key)
        .ok_or_else(|| ImageError::InvalidImage(format!("[{}] has no {}", section, key)))?;
    parse_number(text)
        .ok_or_else(|| ImageError::InvalidImage(format!("[{}] {}={} is not a number", section, key, text)))
}

struct TocTrack {
    number: u8,
    start: u32,
    data: bool,
}

pub fn load(path: &Path) -> Result<CueSheet> {
    let text = fs::read_to_string(path).map_err(|e| ImageError::io(path, e))?;
    let sections = parse_sections(&text);
    if !sections.iter().any(|(name, _)| name == "CLONECD") {
        return Err(ImageError::InvalidImage(format!(
            "{} has no [CloneCD] section",
            path.display()
        )));
    }

    let session_mode2 = sections
        .iter()
        .filter(|(name, _)| name.starts_with("SESSION"))
        .find_map(|(_, e)| e.get("PREGAPMODE").and_then(|v| parse_number(v)))
        .is_some_and(|mode| mode == 2);

    let mut toc: Vec<TocTrack> = Vec::new();
    let mut leadout = None;
    for (name, entries) in sections.iter().filter(|(name, _)| name.starts_with("ENTRY")) {
        let point = field(entries, "POINT", name)?;
        if point == POINT_LEADOUT {
            leadout = Some(field(entries, "PLBA", name)?);
        } else if (1..=99).contains(&point) {
            let plba = field(entries, "PLBA", name)?;
            let start = u32::try_from(plba)
                .map_err(|_| ImageError::InvalidImage(format!("[{}] PLBA={} is negative", name, plba)))?;
            toc.push(TocTrack {
                number: point as u8,
                start,
                data: field(entries, "CONTROL", name)? & CONTROL_DATA != 0,
            });
        }
    }
    if toc.is_empty() {
        return Err(ImageError::InvalidImage(format!("{} lists no tracks", path.display())));
    }
    toc.sort_by_key(|t| t.number);

    // Per-track MODE overrides the session default
    let track_modes: HashMap<u8, i64> = sections
        .iter()
        .filter_map(|(name, e)| {
            let number = name.strip_prefix("TRACK")?.trim().parse().ok()?;
            Some((number, parse_number(e.get("MODE")?)?))
        })
        .collect();

    let img = path.with_extension("img");
    if !img.is_file() {
        return Err(ImageError::TrackFileNotFound(img));
    }
    let file = Arc::new(TrackFile::open(&img, FileKind::Binary)?);

    let mut builder = TrackListBuilder::default();
    for track in &toc {
        let mode = match (track.data, track_modes.get(&track.number)) {
            (false, _) => TrackMode::Audio,
            (true, Some(2)) => TrackMode::Mode2Raw,
            (true, Some(_)) => TrackMode::Mode1Raw,
            (true, None) if session_mode2 => TrackMode::Mode2Raw,
            (true, None) => TrackMode::Mode1Raw,
        };
        builder
            .add(NewTrack {
                number: track.number,
                mode,
                index1: track.start,
                index0: None,
                pregap: 0,
                postgap: 0,
                file: Arc::clone(&file),
            })
            .map_err(ImageError::InvalidImage)?;
    }
    let (tracks, end) = builder.finish().map_err(ImageError::InvalidImage)?;
    if let Some(toc_leadout) = leadout {
        if toc_leadout != end as i64 {
            debug!(toc_leadout, image_end = end, "CloneCD leadout differs from image size");
        }
    }

    let mcn = sections
        .iter()
        .find(|(name, _)| name == "DISC")
        .and_then(|(_, e)| e.get("CATALOG").cloned())
        .unwrap_or_default();

    Ok(CueSheet::new(path, tracks, end, mcn))
}
