//! Commits resolved clips to the output timeline, strictly in order, one per pass.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::buffer::AudioBuffer;
use crate::config::EngineConfig;
use crate::device::AudioContext;
use crate::graph::VoiceHandle;
use crate::remap::remap_rate;
use crate::session::{ScheduledUnit, Session};

/// The clock and voice-start surface the scheduler needs from the output.
pub trait Timeline {
    /// Device clock, in seconds.
    fn current_time(&self) -> f64;
    /// Output latency reported by the device, if known.
    fn base_latency(&self) -> Option<f64>;
    /// Start `buffer` at absolute time `at`, played at `rate`.
    fn start(&self, buffer: Arc<AudioBuffer>, at: f64, rate: f32) -> VoiceHandle;
}

impl Timeline for AudioContext {
    fn current_time(&self) -> f64 {
        AudioContext::current_time(self)
    }

    fn base_latency(&self) -> Option<f64> {
        AudioContext::base_latency(self)
    }

    fn start(&self, buffer: Arc<AudioBuffer>, at: f64, rate: f32) -> VoiceHandle {
        self.graph().schedule(buffer, at, rate)
    }
}

/// A clip that was just committed.
#[derive(Debug, Clone)]
pub struct Commit {
    pub unit: ScheduledUnit,
    /// First commit of the session.
    pub first: bool,
}

/// Outcome of one scheduling pass.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    /// Paths of failed requests dropped from the head of the queue.
    pub skipped: Vec<String>,
    pub committed: Option<Commit>,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Commit at most one clip from the head of the session's queue.
    ///
    /// Does nothing while the head is still loading or while the session already has
    /// `max_scheduled` units on the timeline. Failed heads are dropped and the next head
    /// is considered in the same pass.
    pub fn schedule(&self, session: &mut Session, timeline: &dyn Timeline) -> ScheduleReport {
        let mut report = ScheduleReport::default();
        loop {
            if session.scheduled.len() >= self.config.max_scheduled {
                return report;
            }
            let Some(request) = session.queue.pop_resolved() else {
                return report;
            };

            let buffer = match request.outcome {
                Ok(buffer) => buffer,
                Err(reason) => {
                    warn!(path = %request.path, %reason, "⚠️ Clip skipped");
                    report.skipped.push(request.path);
                    continue;
                }
            };

            let rate = remap_rate(
                request
                    .rate_override
                    .or(session.settings.rate)
                    .unwrap_or(1.0),
            );
            let delay = request.delay / rate as f64;
            let duration = buffer.duration() / rate as f64;
            let next_begin = *session
                .next_begin
                .get_or_insert_with(|| timeline.current_time());
            let start_at = next_begin + delay;

            let handle = timeline.start(buffer, start_at, rate);
            let latency = self.config.latency_compensation(timeline.base_latency());
            session.next_begin = Some(next_begin + duration + delay - latency);

            debug!(
                session = session.id,
                path = %request.path,
                start_at,
                rate,
                duration,
                "clip queued"
            );
            let unit = ScheduledUnit {
                handle,
                path: request.path,
                start_at,
                rate,
                duration,
            };
            session.scheduled.push(unit.clone());

            let first = !session.begun;
            session.begun = true;
            report.committed = Some(Commit { unit, first });
            return report;
        }
    }
}
