//! Per-utterance state: remaining tokens, in-flight requests and scheduled units.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::config::SpeechSettings;
use crate::error::VoxResult;
use crate::graph::VoiceHandle;
use crate::queue::PendingQueue;
use crate::token::{sanitize_silence, ClipToken};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Every token was played.
    Finished,
    /// `stop()` was called, or a newer utterance replaced this one.
    Cancelled,
    /// The output device could not be resumed.
    Failed,
}

/// A clip committed to the output timeline that has not finished yet.
#[derive(Debug, Clone)]
pub struct ScheduledUnit {
    pub handle: VoiceHandle,
    pub path: String,
    /// Absolute start time on the device clock, in seconds.
    pub start_at: f64,
    pub rate: f32,
    /// Playback duration at `rate`, in seconds.
    pub duration: f64,
}

/// One utterance in progress.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub tokens: VecDeque<ClipToken>,
    pub settings: SpeechSettings,
    /// Reverb key this session asked for, if any.
    pub reverb: Option<String>,
    pub queue: PendingQueue,
    pub scheduled: Vec<ScheduledUnit>,
    /// Device time at which the next clip should begin; unset until the first commit.
    pub next_begin: Option<f64>,
    pub begun: bool,
    /// Silence collected from tokens, waiting for the next clip.
    pub pending_delay: f64,
    pub(crate) started: Option<oneshot::Sender<VoxResult<()>>>,
}

impl Session {
    pub fn new(
        id: u64,
        tokens: impl IntoIterator<Item = ClipToken>,
        settings: SpeechSettings,
        max_pending: usize,
    ) -> Self {
        let reverb = settings.reverb().map(str::to_string);
        Self {
            id,
            tokens: tokens.into_iter().collect(),
            settings,
            reverb,
            queue: PendingQueue::new(max_pending),
            scheduled: Vec::new(),
            next_begin: None,
            begun: false,
            pending_delay: 0.0,
            started: None,
        }
    }

    /// Take tokens until the next clip id, folding silence into its delay.
    ///
    /// Returns `(id, delay_seconds)`. Trailing silence with no clip after it is dropped.
    pub fn next_clip(&mut self) -> Option<(String, f64)> {
        while let Some(token) = self.tokens.pop_front() {
            match token {
                ClipToken::Silence(secs) => self.pending_delay += sanitize_silence(secs),
                ClipToken::Clip(id) => {
                    let delay = std::mem::take(&mut self.pending_delay);
                    return Some((id, delay));
                }
            }
        }
        self.pending_delay = 0.0;
        None
    }

    /// Forget a unit that finished playing. None if it was never scheduled here.
    pub fn remove_unit(&mut self, handle: VoiceHandle) -> Option<ScheduledUnit> {
        let index = self.scheduled.iter().position(|u| u.handle == handle)?;
        Some(self.scheduled.remove(index))
    }

    /// No tokens, no pending requests and nothing left sounding.
    pub fn is_exhausted(&self) -> bool {
        self.tokens.is_empty() && self.queue.is_empty() && self.scheduled.is_empty()
    }

    pub(crate) fn set_started_reply(&mut self, reply: oneshot::Sender<VoxResult<()>>) {
        self.started = Some(reply);
    }

    pub(crate) fn take_started_reply(&mut self) -> Option<oneshot::Sender<VoxResult<()>>> {
        self.started.take()
    }
}
