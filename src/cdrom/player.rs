//! CD audio playback state shared between drive commands and the mixer
//!
//! Commands (`play`, `pause`, `stop`, channel control) arrive from the
//! emulated drive while `fill` is called from the mixer thread; both go
//! through one mutex.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use super::types::{AudioStatus, ChannelControl, SubchannelInfo};
use super::CueSheet;
use crate::common::RAW_SECTOR_SIZE;
use crate::error::{ImageError, Result};

#[derive(Default)]
struct PlayerState {
    disc: Option<Arc<CueSheet>>,
    drive: Option<u8>,
    start_frame: u32,
    current_frame: u32,
    target_frame: u32,
    playing: bool,
    paused: bool,
    ctrl: ChannelControl,
    /// Sector bytes read ahead of the mixer
    buffer: Vec<u8>,
}

impl PlayerState {
    fn halt(&mut self) {
        self.playing = false;
        self.paused = false;
    }
}

/// The single CD audio player of a registry
#[derive(Default)]
pub struct AudioPlayer {
    state: Mutex<PlayerState>,
}

impl AudioPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start playing `len` sectors from `start` on `disc`
    ///
    /// Asking for a data track succeeds but leaves the player stopped, the
    /// way a drive accepts the command and then reports no audio. While
    /// playing, only a repeat of the same request is accepted.
    pub fn play(&self, drive: u8, disc: &Arc<CueSheet>, start: u32, len: u32) -> Result<()> {
        let target = start.saturating_add(len);
        let mut state = self.lock();

        if state.playing {
            let same = state.drive == Some(drive)
                && state.disc.as_ref().is_some_and(|d| Arc::ptr_eq(d, disc))
                && state.start_frame == start
                && state.target_frame == target;
            if same {
                return Ok(());
            }
            return Err(ImageError::PlayerBusy);
        }

        state.disc = Some(Arc::clone(disc));
        state.drive = Some(drive);
        state.start_frame = start;
        state.current_frame = start;
        state.target_frame = target;
        state.paused = false;
        state.buffer.clear();

        let data_track = disc.track_at(start).is_some_and(|t| !t.mode.is_audio());
        if data_track {
            warn!(drive, start, "Refusing to play a data track");
            state.playing = false;
        } else {
            debug!(drive, start, len, "Audio playback started");
            state.playing = true;
        }
        Ok(())
    }

    /// Pause (`resume == false`) or resume playback
    pub fn pause(&self, resume: bool) {
        self.lock().paused = !resume;
    }

    pub fn stop(&self) {
        self.lock().halt();
    }

    pub fn status(&self) -> AudioStatus {
        let state = self.lock();
        AudioStatus {
            playing: state.playing,
            paused: state.paused,
        }
    }

    pub fn current_frame(&self) -> u32 {
        self.lock().current_frame
    }

    pub fn set_channel_control(&self, ctrl: ChannelControl) {
        self.lock().ctrl = ctrl;
    }

    pub fn channel_control(&self) -> ChannelControl {
        self.lock().ctrl
    }

    /// Q-subchannel report for the current position of `drive`
    pub fn audio_sub(&self, drive: u8) -> Option<SubchannelInfo> {
        let state = self.lock();
        if state.drive != Some(drive) {
            return None;
        }
        state.disc.as_ref()?.audio_sub(state.current_frame)
    }

    /// Stop and forget `drive`'s disc if the player holds it
    pub fn release(&self, drive: u8) {
        let mut state = self.lock();
        if state.drive == Some(drive) {
            state.halt();
            state.disc = None;
            state.drive = None;
            state.buffer.clear();
            debug!(drive, "Audio player released drive");
        }
    }

    /// Produce interleaved 16-bit stereo samples for the mixer
    ///
    /// Silence while stopped or paused. Playback stops by itself at the
    /// target frame or on the first unreadable sector; the rest of `out` is
    /// silence.
    pub fn fill(&self, out: &mut [i16]) {
        let mut state = self.lock();
        if !state.playing || state.paused {
            out.fill(0);
            return;
        }

        let need = out.len() * 2;
        let mut sector = [0u8; RAW_SECTOR_SIZE as usize];
        while state.buffer.len() < need {
            if state.current_frame >= state.target_frame {
                debug!(frame = state.current_frame, "Audio playback reached target");
                state.halt();
                break;
            }
            let Some(disc) = state.disc.clone() else {
                state.halt();
                break;
            };
            match disc.read_sector(&mut sector, true, state.current_frame) {
                Ok(()) => {
                    state.buffer.extend_from_slice(&sector);
                    state.current_frame += 1;
                }
                Err(e) => {
                    debug!(frame = state.current_frame, "Audio playback stopped: {}", e);
                    state.halt();
                    break;
                }
            }
        }

        let take = need.min(state.buffer.len());
        for (dst, src) in out.iter_mut().zip(state.buffer[..take].chunks_exact(2)) {
            *dst = i16::from_le_bytes([src[0], src[1]]);
        }
        out[take / 2..].fill(0);
        state.buffer.drain(..take);

        let ctrl = state.ctrl;
        if ctrl.is_active() {
            apply_channel_control(out, &ctrl);
        }
        trace!(samples = out.len(), frame = state.current_frame, "Filled audio");
    }
}

/// Route and scale each stereo frame in place
fn apply_channel_control(samples: &mut [i16], ctrl: &ChannelControl) {
    for frame in samples.chunks_exact_mut(2) {
        let src = [frame[0], frame[1]];
        for ch in 0..2 {
            let from = src[(ctrl.out[ch] % 2) as usize] as i32;
            let scaled = from * ctrl.vol[ch] as i32 / 255;
            frame[ch] = scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }
}
