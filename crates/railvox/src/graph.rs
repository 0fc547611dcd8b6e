//! The audio output graph: voices → gain → high-pass → [convolution] → output.
//!
//! The topology is fixed. Voices (scheduled clip buffers) always feed the gain stage, so
//! swapping the reverb downstream never disturbs anything already scheduled. All state
//! lives behind one lock that the render side takes once per quantum, which makes
//! rewiring atomic with respect to playback.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::buffer::AudioBuffer;
use crate::dsp::{Biquad, BiquadCoeffs, Convolver, ImpulseSpectra, RENDER_QUANTUM};

/// Stable identity of a scheduled voice, handed out at schedule time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceHandle(u64);

impl VoiceHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VoiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voice#{}", self.0)
    }
}

/// Resonance of the high-pass stage.
pub const FILTER_Q: f64 = 0.4;

/// Output format and high-pass cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub filter_cutoff_hz: f64,
    /// Frames over which stopped voices fade out.
    pub stop_fade_frames: usize,
}

impl Default for GraphFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            filter_cutoff_hz: 350.0,
            stop_fade_frames: 220,
        }
    }
}

impl From<&crate::config::EngineConfig> for GraphFormat {
    fn from(config: &crate::config::EngineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            filter_cutoff_hz: config.filter_cutoff_hz,
            stop_fade_frames: (config.sample_rate as u64 * config.stop_fade_ms / 1000) as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoiceStatus {
    Playing,
    Ended,
    Silenced,
}

struct Voice {
    handle: VoiceHandle,
    buffer: Arc<AudioBuffer>,
    start_frame: u64,
    rate: f64,
    position: f64,
    /// (remaining, total) fade-out frames once stopped.
    fade: Option<(usize, usize)>,
}

impl Voice {
    /// Mix this voice into `mix` for the quantum beginning at `block_start`.
    fn render(&mut self, mix: &mut [f32], block_start: u64, channels: usize) -> VoiceStatus {
        let frames = mix.len() / channels;
        let len = self.buffer.frames();
        let first = self.start_frame.saturating_sub(block_start) as usize;

        for i in first.min(frames)..frames {
            if self.position >= len as f64 {
                return VoiceStatus::Ended;
            }
            let fade_gain = match self.fade.as_mut() {
                Some((0, _)) => return VoiceStatus::Silenced,
                Some((remaining, total)) => {
                    let g = *remaining as f32 / *total as f32;
                    *remaining -= 1;
                    g
                }
                None => 1.0,
            };

            let idx = self.position as usize;
            let frac = (self.position - idx as f64) as f32;
            let buffer_channels = self.buffer.channels() as usize;
            for c in 0..channels {
                let bc = c % buffer_channels;
                let a = self.buffer.sample(idx, bc);
                let b = self.buffer.sample(idx + 1, bc);
                mix[i * channels + c] += (a + (b - a) * frac) * fade_gain;
            }
            self.position += self.rate;
        }

        if self.position >= len as f64 {
            VoiceStatus::Ended
        } else if matches!(self.fade, Some((0, _))) {
            VoiceStatus::Silenced
        } else {
            VoiceStatus::Playing
        }
    }
}

struct GraphState {
    format: GraphFormat,
    suspended: bool,
    /// Frames rendered so far; the graph clock.
    frames_rendered: u64,
    next_handle: u64,
    voices: Vec<Voice>,
    gain: f32,
    filters: Vec<Biquad>,
    convolver: Option<Convolver>,
    quantum: Vec<f32>,
    cursor: usize,
    ended_tx: mpsc::UnboundedSender<VoiceHandle>,
}

impl GraphState {
    fn render_quantum(&mut self) {
        let channels = self.format.channels as usize;
        self.quantum.fill(0.0);

        let block_start = self.frames_rendered;
        let mut finished = Vec::new();
        for voice in &mut self.voices {
            match voice.render(&mut self.quantum, block_start, channels) {
                VoiceStatus::Playing => {}
                status => finished.push((voice.handle, status)),
            }
        }
        if !finished.is_empty() {
            self.voices
                .retain(|v| !finished.iter().any(|(h, _)| *h == v.handle));
            for (handle, status) in finished {
                if status == VoiceStatus::Ended {
                    // Engine may already be gone; nothing to notify then
                    let _ = self.ended_tx.send(handle);
                }
            }
        }

        let gain = self.gain;
        if gain != 1.0 {
            self.quantum.iter_mut().for_each(|s| *s *= gain);
        }
        for (c, filter) in self.filters.iter_mut().enumerate() {
            filter.process_interleaved(&mut self.quantum, channels, c);
        }
        if let Some(convolver) = self.convolver.as_mut() {
            convolver.process(&mut self.quantum, channels);
        }

        self.frames_rendered += RENDER_QUANTUM as u64;
    }
}

/// Cloneable handle to the shared output graph.
#[derive(Clone)]
pub struct OutputGraph {
    state: Arc<Mutex<GraphState>>,
    ended_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<VoiceHandle>>>>,
}

impl fmt::Debug for OutputGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutputGraph")
            .field("format", &state.format)
            .field("suspended", &state.suspended)
            .field("voices", &state.voices.len())
            .field("reverb", &state.convolver.is_some())
            .finish()
    }
}

impl OutputGraph {
    pub fn new(format: GraphFormat) -> Self {
        let channels = format.channels.max(1) as usize;
        let format = GraphFormat {
            channels: channels as u16,
            ..format
        };
        let coeffs = BiquadCoeffs::highpass(
            format.filter_cutoff_hz,
            FILTER_Q,
            format.sample_rate as f64,
        );
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        let state = GraphState {
            format,
            suspended: false,
            frames_rendered: 0,
            next_handle: 1,
            voices: Vec::new(),
            gain: 1.0,
            filters: (0..channels).map(|_| Biquad::new(coeffs)).collect(),
            convolver: None,
            quantum: vec![0.0; RENDER_QUANTUM * channels],
            cursor: RENDER_QUANTUM * channels,
            ended_tx,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            ended_rx: Arc::new(Mutex::new(Some(ended_rx))),
        }
    }

    pub fn format(&self) -> GraphFormat {
        self.state.lock().format
    }

    /// Receiver of handles whose voices played to their natural end. Can be taken once.
    pub fn take_ended_receiver(&self) -> Option<mpsc::UnboundedReceiver<VoiceHandle>> {
        self.ended_rx.lock().take()
    }

    /// False once the end-notice receiver has been dropped.
    pub fn has_ended_listener(&self) -> bool {
        !self.state.lock().ended_tx.is_closed()
    }

    /// Graph clock in seconds. Does not advance while suspended.
    pub fn current_time(&self) -> f64 {
        let state = self.state.lock();
        state.frames_rendered as f64 / state.format.sample_rate as f64
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn suspend(&self) {
        self.state.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.state.lock().suspended = false;
    }

    pub fn set_gain(&self, gain: f32) {
        self.state.lock().gain = gain;
    }

    pub fn gain(&self) -> f32 {
        self.state.lock().gain
    }

    /// Route the filter through `spectra`, or straight to the output with `None`.
    ///
    /// The previous convolution stage is disconnected first; its tail is dropped.
    pub fn set_reverb(&self, spectra: Option<Arc<ImpulseSpectra>>) {
        let mut state = self.state.lock();
        let channels = state.format.channels as usize;
        state.convolver = spectra.map(|s| Convolver::new(s, channels));
    }

    /// Whether the convolution stage is currently connected.
    pub fn has_reverb(&self) -> bool {
        self.state.lock().convolver.is_some()
    }

    /// The impulse response currently connected, if any.
    pub fn reverb(&self) -> Option<Arc<ImpulseSpectra>> {
        self.state
            .lock()
            .convolver
            .as_ref()
            .map(|c| Arc::clone(c.spectra()))
    }

    /// Start `buffer` at graph time `start_at` (seconds), played at `rate`.
    ///
    /// Start times already in the past begin on the next rendered frame.
    pub fn schedule(&self, buffer: Arc<AudioBuffer>, start_at: f64, rate: f32) -> VoiceHandle {
        let mut state = self.state.lock();
        let handle = VoiceHandle::new(state.next_handle);
        state.next_handle += 1;

        let start_frame = (start_at.max(0.0) * state.format.sample_rate as f64).round() as u64;
        let rate = if rate.is_finite() && rate > 0.0 { rate as f64 } else { 1.0 };
        // Buffers decoded at another rate still play at their natural pitch
        let rate = rate * buffer.sample_rate() as f64 / state.format.sample_rate as f64;

        debug!(%handle, start_frame, rate, "voice scheduled");
        state.voices.push(Voice {
            handle,
            buffer,
            start_frame,
            rate,
            position: 0.0,
            fade: None,
        });
        handle
    }

    /// Silence every voice. Voices already sounding fade out briefly; the rest are
    /// dropped at once. Silenced voices never report an end.
    pub fn stop_all(&self) {
        let mut state = self.state.lock();
        let now = state.frames_rendered;
        let fade = state.format.stop_fade_frames;
        state.voices.retain_mut(|voice| {
            if fade == 0 || voice.start_frame >= now || voice.fade.is_some() {
                return voice.fade.is_some() && fade > 0;
            }
            voice.fade = Some((fade, fade));
            true
        });
    }

    /// Number of voices still attached (including ones fading out).
    pub fn active_voices(&self) -> usize {
        self.state.lock().voices.len()
    }

    /// Render interleaved samples into `out`. Outputs silence while suspended.
    pub fn render(&self, out: &mut [f32]) {
        let mut state = self.state.lock();
        if state.suspended {
            out.fill(0.0);
            return;
        }

        let mut written = 0;
        while written < out.len() {
            if state.cursor >= state.quantum.len() {
                state.render_quantum();
                state.cursor = 0;
            }
            let n = (state.quantum.len() - state.cursor).min(out.len() - written);
            let cursor = state.cursor;
            out[written..written + n].copy_from_slice(&state.quantum[cursor..cursor + n]);
            written += n;
            state.cursor += n;
        }
    }
}
