//! CUE sheet loader
//!
//! Line-oriented: the first word of each line is the keyword, matched without
//! regard to case. Times are `mm:ss:ff` at 75 frames per second.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use super::{CueSheet, NewTrack, TrackListBuilder, TrackMode};
use crate::common::Msf;
use crate::error::{ImageError, Result};
use crate::trackfile::{FileKind, TrackFile};

/// A TRACK being collected until the next TRACK, FILE or end of sheet
struct PendingTrack {
    line: usize,
    number: u8,
    mode: TrackMode,
    index1: Option<u32>,
    index0: Option<u32>,
    pregap: u32,
    postgap: u32,
    file: Arc<TrackFile>,
}

/// Splits one line into whitespace-separated words, honoring double quotes
struct Words<'a> {
    rest: &'a str,
}

impl<'a> Words<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    /// Next word, quotes stripped
    fn next_word(&mut self) -> Option<&'a str> {
        let s = self.rest.trim_start();
        if s.is_empty() {
            self.rest = s;
            return None;
        }
        if let Some(quoted) = s.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            self.rest = quoted.get(end + 1..).unwrap_or("");
            return Some(&quoted[..end]);
        }
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        self.rest = &s[end..];
        Some(&s[..end])
    }

    fn keyword(&mut self) -> String {
        self.next_word().unwrap_or("").to_ascii_uppercase()
    }
}

fn frames(words: &mut Words<'_>, line: usize, what: &str) -> Result<u32> {
    let text = words
        .next_word()
        .ok_or_else(|| ImageError::cue(line, format!("{} needs a time", what)))?;
    Msf::parse_frames(text).ok_or_else(|| ImageError::cue(line, format!("bad time {:?}", text)))
}

/// Find a FILE target: as written, next to the sheet, then with `\` as `/`
pub fn resolve_track_path(name: &str, cue_dir: &Path) -> Option<PathBuf> {
    let unixy = name.replace('\\', "/");
    [
        PathBuf::from(name),
        cue_dir.join(name),
        PathBuf::from(&unixy),
        cue_dir.join(&unixy),
    ]
    .into_iter()
    .find(|p| p.is_file())
}

fn flush(builder: &mut TrackListBuilder, pending: Option<PendingTrack>) -> Result<()> {
    let Some(track) = pending else {
        return Ok(());
    };
    let index1 = track
        .index1
        .ok_or_else(|| ImageError::cue(track.line, format!("track {} has no INDEX 01", track.number)))?;
    builder
        .add(NewTrack {
            number: track.number,
            mode: track.mode,
            index1,
            index0: track.index0,
            pregap: track.pregap,
            postgap: track.postgap,
            file: track.file,
        })
        .map_err(|msg| ImageError::cue(track.line, msg))
}

/// Parse CUE text; FILE names are resolved against `cue_dir`
pub fn parse(text: &str, cue_dir: &Path, cue_path: &Path) -> Result<CueSheet> {
    let mut builder = TrackListBuilder::default();
    let mut current_file: Option<Arc<TrackFile>> = None;
    let mut pending: Option<PendingTrack> = None;
    let mut mcn = String::new();

    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let mut words = Words::new(raw);
        let keyword = words.keyword();

        match keyword.as_str() {
            "TRACK" => {
                flush(&mut builder, pending.take())?;
                let number = words
                    .next_word()
                    .and_then(|w| w.parse::<u8>().ok())
                    .ok_or_else(|| ImageError::cue(line, "TRACK needs a number"))?;
                let mode = TrackMode::from_cue(&words.keyword(), line)?;
                let file = current_file
                    .clone()
                    .ok_or_else(|| ImageError::cue(line, "TRACK before any FILE"))?;
                trace!(line, number, ?mode, "CUE track");
                pending = Some(PendingTrack {
                    line,
                    number,
                    mode,
                    index1: None,
                    index0: None,
                    pregap: 0,
                    postgap: 0,
                    file,
                });
            }
            "INDEX" => {
                let index = words
                    .next_word()
                    .and_then(|w| w.parse::<u32>().ok())
                    .ok_or_else(|| ImageError::cue(line, "INDEX needs a number"))?;
                let at = frames(&mut words, line, "INDEX")?;
                let track = pending
                    .as_mut()
                    .ok_or_else(|| ImageError::cue(line, "INDEX outside a TRACK"))?;
                match index {
                    0 => track.index0 = Some(at),
                    1 => track.index1 = Some(at),
                    _ => {}
                }
            }
            "FILE" => {
                flush(&mut builder, pending.take())?;
                let name = words
                    .next_word()
                    .ok_or_else(|| ImageError::cue(line, "FILE needs a name"))?;
                let kind = match words.keyword().as_str() {
                    "BINARY" | "MOTOROLA" => FileKind::Binary,
                    "WAVE" | "MP3" | "AIFF" | "FLAC" | "OGG" => FileKind::Audio,
                    other => {
                        return Err(ImageError::cue(line, format!("unsupported FILE type {:?}", other)))
                    }
                };
                let path = resolve_track_path(name, cue_dir)
                    .ok_or_else(|| ImageError::TrackFileNotFound(cue_dir.join(name)))?;
                debug!(line, path = %path.display(), ?kind, "CUE file");
                current_file = Some(Arc::new(TrackFile::open(&path, kind)?));
            }
            "PREGAP" | "POSTGAP" => {
                let at = frames(&mut words, line, &keyword)?;
                let track = pending
                    .as_mut()
                    .ok_or_else(|| ImageError::cue(line, format!("{} outside a TRACK", keyword)))?;
                if keyword == "PREGAP" {
                    track.pregap = at;
                } else {
                    track.postgap = at;
                }
            }
            "CATALOG" => {
                mcn = words.next_word().unwrap_or("").to_string();
            }
            "CDTEXTFILE" | "FLAGS" | "ISRC" | "PERFORMER" | "REM" | "SONGWRITER" | "TITLE" | "" => {}
            other => return Err(ImageError::cue(line, format!("unknown keyword {:?}", other))),
        }
    }

    let last_line = text.lines().count().max(1);
    if pending.is_none() && current_file.is_none() {
        return Err(ImageError::cue(last_line, "sheet has no FILE or TRACK"));
    }
    flush(&mut builder, pending)?;
    let (tracks, leadout) = builder.finish().map_err(|msg| ImageError::cue(last_line, msg))?;

    Ok(CueSheet::new(cue_path, tracks, leadout, mcn))
}

/// Load a `.cue` file and every track file it references
pub fn load(path: &Path) -> Result<CueSheet> {
    let bytes = fs::read(path).map_err(|e| ImageError::io(path, e))?;
    if bytes.contains(&0) {
        return Err(ImageError::cue(1, "not a text file"));
    }
    let text = String::from_utf8_lossy(&bytes);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse(&text, dir, path)
}
