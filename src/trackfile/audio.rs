//! Compressed audio track files (WAVE, MP3, FLAC, OGG) decoded with symphonia
//!
//! Tracks are exposed as a stream of 16-bit little-endian stereo PCM at
//! 44.1 kHz, the same shape as a Red Book audio sector. Sources at other
//! rates are resampled by nearest-sample picking; mono is duplicated and
//! channels beyond the first two are dropped. All byte offsets and lengths
//! are in that normalized stream.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::{Time, TimeBase},
};
use tracing::{debug, trace, warn};

use crate::error::{ImageError, Result};

/// Output sample rate of every decoded track
pub const CD_AUDIO_RATE: u32 = 44_100;
/// Bytes per normalized stereo frame
const FRAME_BYTES: u64 = 4;

// =============================================================================
// Decoder State
// =============================================================================

struct DecodeState {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    /// Normalized bytes decoded but not yet handed out
    pending: VecDeque<u8>,
    /// Source frame index of the next decoded packet
    src_pos: u64,
    /// Output frames produced so far (including those still pending)
    out_pos: u64,
    /// Bytes to drop after a seek to a non frame-aligned offset
    discard: usize,
    end_of_stream: bool,
}

/// A decoded audio track file
pub struct AudioFile {
    path: PathBuf,
    track_id: u32,
    /// Native sample rate of the source
    src_rate: u32,
    time_base: Option<TimeBase>,
    /// Normalized stream length in bytes
    length: u64,
    state: Mutex<DecodeState>,
}

struct Probed {
    format: Box<dyn FormatReader>,
    track_id: u32,
    src_rate: u32,
    time_base: Option<TimeBase>,
    n_frames: Option<u64>,
}

fn probe(path: &Path) -> Result<Probed> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ImageError::TrackFileNotFound(path.to_path_buf())
        } else {
            ImageError::io(path, e)
        }
    })?;
    let media_source = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        media_source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ImageError::Audio(format!("no audio track in {}", path.display())))?;

    Ok(Probed {
        track_id: track.id,
        src_rate: track.codec_params.sample_rate.unwrap_or(CD_AUDIO_RATE),
        time_base: track.codec_params.time_base,
        n_frames: track.codec_params.n_frames,
        format,
    })
}

/// Count source frames by walking packet durations without decoding
fn count_frames(mut probed: Probed) -> Result<u64> {
    let mut frames = 0u64;
    loop {
        match probed.format.next_packet() {
            Ok(packet) if packet.track_id() == probed.track_id => frames += packet.dur,
            Ok(_) => {}
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(frames)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl AudioFile {
    pub fn open(path: &Path) -> Result<Self> {
        let probed = probe(path)?;
        let src_frames = match probed.n_frames {
            Some(n) => n,
            None => count_frames(probe(path)?)?,
        };

        let decoder = {
            let track = probed
                .format
                .tracks()
                .iter()
                .find(|t| t.id == probed.track_id)
                .ok_or_else(|| ImageError::Audio("audio track vanished after probe".into()))?;
            symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?
        };

        let src_rate = probed.src_rate.max(1);
        let out_frames = (src_frames * CD_AUDIO_RATE as u64).div_ceil(src_rate as u64);

        debug!(
            path = %path.display(),
            src_rate,
            src_frames,
            "Opened compressed audio track"
        );

        Ok(Self {
            path: path.to_path_buf(),
            track_id: probed.track_id,
            src_rate,
            time_base: probed.time_base,
            length: out_frames * FRAME_BYTES,
            state: Mutex::new(DecodeState {
                format: probed.format,
                decoder,
                pending: VecDeque::new(),
                src_pos: 0,
                out_pos: 0,
                discard: 0,
                end_of_stream: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the normalized PCM stream in bytes
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DecodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let t = tb.calc_time(ts);
                t.seconds * self.src_rate as u64 + (t.frac * self.src_rate as f64).round() as u64
            }
            None => ts,
        }
    }

    /// Position the stream so the next `decode` starts at `offset`
    pub fn seek(&self, offset: u64) -> Result<()> {
        let mut state = self.lock();
        let current = state.out_pos * FRAME_BYTES - state.pending.len() as u64 + state.discard as u64;
        if offset == current {
            return Ok(());
        }

        let target_out = offset / FRAME_BYTES;
        let src_target = target_out * self.src_rate as u64 / CD_AUDIO_RATE as u64;
        let rate = self.src_rate as u64;
        let time = Time::new(src_target / rate, (src_target % rate) as f64 / rate as f64);

        let seeked = state.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        )?;
        state.decoder.reset();

        state.src_pos = self.ts_to_frames(seeked.actual_ts);
        state.out_pos = target_out;
        state.pending.clear();
        state.discard = (offset % FRAME_BYTES) as usize;
        state.end_of_stream = false;

        trace!(offset, src_target, actual = state.src_pos, "Seeked audio track");
        Ok(())
    }

    /// Fill `buf` with normalized PCM; returns bytes written (short at end of stream)
    pub fn decode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.lock();
        while state.pending.len() < buf.len() + state.discard && !state.end_of_stream {
            if !self.decode_packet(&mut state)? {
                state.end_of_stream = true;
            }
        }

        let discard = state.discard.min(state.pending.len());
        state.pending.drain(..discard);
        state.discard -= discard;

        let n = buf.len().min(state.pending.len());
        for (dst, src) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    /// Decode one packet into `pending`; false at end of stream
    fn decode_packet(&self, state: &mut DecodeState) -> Result<bool> {
        loop {
            let packet = match state.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match state.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(msg)) => {
                    warn!(path = %self.path.display(), "Skipping undecodable packet: {}", msg);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let spec = *decoded.spec();
            let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
            samples.copy_interleaved_ref(decoded);

            let channels = spec.channels.count().max(1);
            let samples = samples.samples();
            let frames = (samples.len() / channels) as u64;
            if frames == 0 {
                continue;
            }

            let first = state.src_pos;
            let end = first + frames;
            loop {
                let want = state.out_pos * self.src_rate as u64 / CD_AUDIO_RATE as u64;
                if want >= end {
                    break;
                }
                let idx = want.saturating_sub(first) as usize * channels;
                let left = samples[idx];
                let right = if channels > 1 { samples[idx + 1] } else { left };
                state.pending.extend(left.to_le_bytes());
                state.pending.extend(right.to_le_bytes());
                state.out_pos += 1;
            }
            state.src_pos = end;
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Write a 16-bit PCM WAVE file
    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[i16]) {
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        File::create(path).unwrap().write_all(&out).unwrap();
    }

    fn sample_at(buf: &[u8], frame: usize, channel: usize) -> i16 {
        let i = frame * 4 + channel * 2;
        i16::from_le_bytes([buf[i], buf[i + 1]])
    }

    #[test]
    fn test_stereo_44k_passthrough() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("track.wav");
        let samples: Vec<i16> = (0..200).map(|i| i as i16 * 3).collect();
        write_wav(&path, 44_100, 2, &samples);

        let audio = AudioFile::open(&path).unwrap();
        assert_eq!(audio.len(), 400);

        let mut buf = vec![0u8; 512];
        let n = audio.decode(&mut buf).unwrap();
        assert_eq!(n, 400);
        assert_eq!(sample_at(&buf, 0, 1), 3);
        assert_eq!(sample_at(&buf, 99, 0), 594);
        assert_eq!(audio.decode(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_mono_22k_is_normalized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mono.wav");
        let samples: Vec<i16> = (0..100).map(|i| i as i16 * 10).collect();
        write_wav(&path, 22_050, 1, &samples);

        let audio = AudioFile::open(&path).unwrap();
        assert_eq!(audio.len(), 200 * 4);

        let mut buf = vec![0u8; 16];
        assert_eq!(audio.decode(&mut buf).unwrap(), 16);
        // Each source frame is emitted twice, left duplicated to right
        assert_eq!(sample_at(&buf, 0, 0), 0);
        assert_eq!(sample_at(&buf, 1, 1), 0);
        assert_eq!(sample_at(&buf, 2, 0), 10);
        assert_eq!(sample_at(&buf, 3, 1), 10);
    }

    #[test]
    fn test_seek_then_decode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seek.wav");
        let samples: Vec<i16> = (0..2000).map(|i| i as i16).collect();
        write_wav(&path, 44_100, 2, &samples);

        let audio = AudioFile::open(&path).unwrap();
        audio.seek(400).unwrap();

        let mut buf = vec![0u8; 8];
        assert_eq!(audio.decode(&mut buf).unwrap(), 8);
        assert_eq!(sample_at(&buf, 0, 0), 200);
        assert_eq!(sample_at(&buf, 1, 1), 203);

        // Sequential seek to the current position is a no-op
        audio.seek(408).unwrap();
        audio.decode(&mut buf).unwrap();
        assert_eq!(sample_at(&buf, 0, 0), 204);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            AudioFile::open(&dir.path().join("gone.wav")),
            Err(ImageError::TrackFileNotFound(_))
        ));
    }
}
