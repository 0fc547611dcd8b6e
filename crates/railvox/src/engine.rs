//! The speech engine: one control loop that owns every piece of session state.
//!
//! Public calls, request completions, voice-end notices and the driver tick all arrive as
//! [`Command`]s on a single queue and are handled one at a time by [`EngineActor`], so
//! nothing in here needs a lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::asset::{AssetStore, FsAssetStore};
use crate::config::{EngineConfig, SpeechSettings};
use crate::device::AudioContext;
use crate::error::{VoxError, VoxResult};
use crate::graph::{GraphFormat, OutputGraph, VoiceHandle};
use crate::remap::remap_volume;
use crate::request::{fetch_and_decode, RequestPipeline, Resolved};
use crate::reverb::{ImpulseResponseCache, ReverbUnit};
use crate::scheduler::{ScheduleReport, Scheduler};
use crate::session::{EndReason, Session};
use crate::token::ClipToken;

/// Callback fired on speech start or end.
pub type SpeechHook = Option<Arc<dyn Fn() + Send + Sync>>;

/// Lifecycle notifications, in the order they happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoxEvent {
    /// The first clip of an utterance was committed to the timeline.
    SpeakStarted { session: u64 },
    ClipScheduled {
        session: u64,
        path: String,
        start_at: f64,
        rate: f32,
        duration: f64,
    },
    /// A clip could not be fetched or decoded and was left out.
    ClipSkipped { session: u64, path: String },
    ClipEnded { session: u64, path: String },
    ReverbLoaded { file: String },
    SpeakEnded { session: u64, reason: EndReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechState {
    Idle,
    Speaking,
}

/// Snapshot of the engine, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: SpeechState,
    pub session: Option<u64>,
    pub tokens_remaining: usize,
    pub pending: usize,
    pub scheduled: usize,
    pub next_begin: Option<f64>,
    pub reverb: Option<String>,
    pub reverb_connected: bool,
    pub cached_reverbs: usize,
    pub gain: f32,
    pub current_time: f64,
    pub suspended: bool,
}

/// Messages handled by the control loop.
pub(crate) enum Command {
    Speak {
        tokens: Vec<ClipToken>,
        settings: SpeechSettings,
        reply: oneshot::Sender<VoxResult<()>>,
    },
    Stop,
    Status(oneshot::Sender<EngineStatus>),
    Resolved(Resolved),
    UnitEnded(VoiceHandle),
    Resumed {
        session: u64,
        result: VoxResult<()>,
    },
    ReverbLoaded {
        file: String,
        result: VoxResult<ReverbUnit>,
    },
    Shutdown,
}

impl From<Resolved> for Command {
    fn from(resolved: Resolved) -> Self {
        Command::Resolved(resolved)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Speak { tokens, .. } => write!(f, "Speak({} tokens)", tokens.len()),
            Command::Stop => f.write_str("Stop"),
            Command::Status(_) => f.write_str("Status"),
            Command::Resolved(r) => write!(f, "Resolved({}, session {})", r.id, r.session),
            Command::UnitEnded(h) => write!(f, "UnitEnded({})", h),
            Command::Resumed { session, .. } => write!(f, "Resumed(session {})", session),
            Command::ReverbLoaded { file, .. } => write!(f, "ReverbLoaded({})", file),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Configures and starts a [`VoxEngine`].
pub struct VoxEngineBuilder {
    config: EngineConfig,
    assets: Option<Arc<dyn AssetStore>>,
    context: Option<AudioContext>,
    on_speak_start: SpeechHook,
    on_speak_end: SpeechHook,
}

impl VoxEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            assets: None,
            context: None,
            on_speak_start: None,
            on_speak_end: None,
        }
    }

    /// Where clips, chimes and impulse responses are read from. Defaults to the working directory.
    pub fn assets(mut self, assets: Arc<dyn AssetStore>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Output to use instead of the default device.
    pub fn context(mut self, context: AudioContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn on_speak_start(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_speak_start = Some(Arc::new(hook));
        self
    }

    pub fn on_speak_end(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_speak_end = Some(Arc::new(hook));
        self
    }

    /// Start the control loop. Must be called from within a tokio runtime.
    ///
    /// Without an explicit context this opens the default output device; failing to do so
    /// is an error.
    pub fn build(self) -> VoxResult<VoxEngine> {
        self.config.validate()?;
        let context = match self.context {
            Some(context) => context,
            None => AudioContext::open_default(OutputGraph::new(GraphFormat::from(&self.config)))?,
        };
        let assets: Arc<dyn AssetStore> = match self.assets {
            Some(assets) => assets,
            None => Arc::new(FsAssetStore::cwd()),
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let forwarder = match context.graph().take_ended_receiver() {
            Some(mut ended) => {
                let tx = commands_tx.clone();
                let task = tokio::spawn(async move {
                    while let Some(handle) = ended.recv().await {
                        if tx.send(Command::UnitEnded(handle)).is_err() {
                            break;
                        }
                    }
                });
                Some(task.abort_handle())
            }
            None => {
                warn!("Output graph end notices already claimed; units will not retire");
                None
            }
        };

        let format = context.graph().format();
        info!(
            "🔊 Speech engine started ({} output, {} Hz, {} ch)",
            context.backend_name(),
            format.sample_rate,
            format.channels
        );

        let actor = EngineActor {
            pipeline: RequestPipeline::new(
                Arc::clone(&assets),
                format.channels,
                format.sample_rate,
                commands_tx.clone(),
            ),
            scheduler: Scheduler::new(&self.config),
            config: self.config,
            context: context.clone(),
            assets,
            cache: ImpulseResponseCache::new(),
            session: None,
            next_session: 0,
            pump_due: None,
            commands_tx: commands_tx.clone(),
            forwarder,
            events: events_tx,
            on_speak_start: self.on_speak_start,
            on_speak_end: self.on_speak_end,
        };
        tokio::spawn(actor.run(commands_rx));

        Ok(VoxEngine {
            commands: commands_tx,
            events: Mutex::new(Some(events_rx)),
            context,
        })
    }
}

/// Handle to a running speech engine.
///
/// Dropping the handle stops any utterance in progress and shuts the control loop down.
pub struct VoxEngine {
    commands: mpsc::UnboundedSender<Command>,
    events: Mutex<Option<mpsc::UnboundedReceiver<VoxEvent>>>,
    context: AudioContext,
}

impl VoxEngine {
    pub fn builder(config: EngineConfig) -> VoxEngineBuilder {
        VoxEngineBuilder::new(config)
    }

    /// Speak `tokens`, replacing any utterance in progress.
    ///
    /// Returns once playback has been set in motion. Clips keep loading and playing in the
    /// background; watch [`VoxEvent::SpeakEnded`] or the end hook for completion.
    pub async fn speak(
        &self,
        tokens: impl IntoIterator<Item = ClipToken>,
        settings: SpeechSettings,
    ) -> VoxResult<()> {
        let (reply, started) = oneshot::channel();
        self.send(Command::Speak {
            tokens: tokens.into_iter().collect(),
            settings,
            reply,
        })?;
        started.await.map_err(|_| VoxError::EngineClosed)?
    }

    /// Cancel the utterance in progress. Does nothing while idle.
    pub fn stop(&self) -> VoxResult<()> {
        self.send(Command::Stop)
    }

    pub async fn status(&self) -> VoxResult<EngineStatus> {
        let (reply, status) = oneshot::channel();
        self.send(Command::Status(reply))?;
        status.await.map_err(|_| VoxError::EngineClosed)
    }

    /// Take the lifecycle event receiver. Can only be taken once.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<VoxEvent>> {
        self.events.lock().take()
    }

    pub fn context(&self) -> &AudioContext {
        &self.context
    }

    fn send(&self, command: Command) -> VoxResult<()> {
        self.commands
            .send(command)
            .map_err(|_| VoxError::EngineClosed)
    }
}

impl Drop for VoxEngine {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Owns the session, the reverb cache and the driver timer.
struct EngineActor {
    config: EngineConfig,
    context: AudioContext,
    assets: Arc<dyn AssetStore>,
    pipeline: RequestPipeline<Command>,
    scheduler: Scheduler,
    cache: ImpulseResponseCache,
    session: Option<Session>,
    next_session: u64,
    /// When the next driver tick fires; `None` while no tick is armed.
    pump_due: Option<Instant>,
    commands_tx: mpsc::UnboundedSender<Command>,
    /// Task relaying the graph's end notices onto the command queue.
    forwarder: Option<AbortHandle>,
    events: mpsc::UnboundedSender<VoxEvent>,
    on_speak_start: SpeechHook,
    on_speak_end: SpeechHook,
}

impl EngineActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let due = self.pump_due;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = sleep_until(due) => {
                    self.pump_due = None;
                    self.pump();
                }
            }
        }
        self.stop(EndReason::Cancelled);
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        debug!("Speech engine control loop exited");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Speak {
                tokens,
                settings,
                reply,
            } => self.speak(tokens, settings, reply),
            Command::Stop => self.stop(EndReason::Cancelled),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Resolved(resolved) => self.resolved(resolved),
            Command::UnitEnded(handle) => self.unit_ended(handle),
            Command::Resumed { session, result } => self.resumed(session, result),
            Command::ReverbLoaded { file, result } => self.reverb_loaded(file, result),
            Command::Shutdown => {}
        }
    }

    fn speak(
        &mut self,
        tokens: Vec<ClipToken>,
        settings: SpeechSettings,
        reply: oneshot::Sender<VoxResult<()>>,
    ) {
        self.stop(EndReason::Cancelled);

        self.next_session += 1;
        let id = self.next_session;
        info!(
            session = id,
            tokens = tokens.len(),
            vox_path = %settings.vox_path,
            "🗣️ Speaking"
        );
        let mut session = Session::new(id, tokens, settings, self.config.max_pending);

        self.connect_reverb(session.reverb.as_deref());
        let gain = remap_volume(session.settings.volume.unwrap_or(1.0));
        self.context.graph().set_gain(gain);

        if let Some(chime) = session.settings.chime() {
            let path = format!("{}/{}", self.config.data_path, chime);
            let request = self.pipeline.start(id, path, 0.0, Some(1.0));
            if let Err(mut request) = session.queue.push(request) {
                request.cancel();
            }
            session.tokens.push_front(ClipToken::Silence(1.0));
        }

        if self.context.is_suspended() {
            debug!(session = id, "Output suspended, resuming before first tick");
            session.set_started_reply(reply);
            let context = self.context.clone();
            let tx = self.commands_tx.clone();
            tokio::spawn(async move {
                let result = context.resume().await;
                let _ = tx.send(Command::Resumed {
                    session: id,
                    result,
                });
            });
            self.session = Some(session);
        } else {
            self.session = Some(session);
            let _ = reply.send(Ok(()));
            self.pump();
        }
    }

    fn resumed(&mut self, session_id: u64, result: VoxResult<()>) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == session_id) else {
            return;
        };
        let reply = session.take_started_reply();
        match result {
            Ok(()) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                self.pump();
            }
            Err(e) => {
                error!(session = session_id, "Failed to resume output: {}", e);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                self.stop(EndReason::Failed);
            }
        }
    }

    /// Connect the reverb `file` asks for, loading it in the background on a cache miss.
    fn connect_reverb(&mut self, file: Option<&str>) {
        let graph = self.context.graph();
        let Some(file) = file else {
            graph.set_reverb(None);
            return;
        };
        if let Some(unit) = self.cache.get(file) {
            debug!(file, "Reverb cached, connecting");
            graph.set_reverb(Some(unit.spectra()));
            return;
        }

        // Straight through until the impulse response arrives
        graph.set_reverb(None);
        if !self.cache.begin_load(file) {
            return;
        }

        info!(file, "Loading reverb impulse response");
        let assets = Arc::clone(&self.assets);
        let tx = self.commands_tx.clone();
        let path = format!("{}/{}", self.config.data_path, file);
        let file = file.to_string();
        let output = graph.format();
        tokio::spawn(async move {
            let result: VoxResult<ReverbUnit> = async {
                let impulse =
                    fetch_and_decode(assets.as_ref(), &path, output.channels, output.sample_rate)
                        .await?;
                let key = file.clone();
                tokio::task::spawn_blocking(move || ReverbUnit::from_impulse(key, &impulse))
                    .await
                    .map_err(|e| VoxError::Decode(format!("impulse response task failed: {}", e)))
            }
            .await;
            let _ = tx.send(Command::ReverbLoaded { file, result });
        });
    }

    fn reverb_loaded(&mut self, file: String, result: VoxResult<ReverbUnit>) {
        match result {
            Ok(unit) => {
                let unit = self.cache.insert(unit);
                info!(file = %file, "✅ Reverb loaded");
                self.emit(VoxEvent::ReverbLoaded { file: file.clone() });

                let wanted = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.reverb.as_deref() == Some(file.as_str()));
                if wanted {
                    self.context.graph().set_reverb(Some(unit.spectra()));
                }
            }
            Err(e) => {
                self.cache.abandon_load(&file);
                warn!(file = %file, "Failed to load reverb: {}", e);
            }
        }
    }

    fn resolved(&mut self, resolved: Resolved) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == resolved.session) else {
            debug!(request = %resolved.id, "Discarding completion for a finished session");
            return;
        };
        if !session.queue.resolve(resolved.id, resolved.outcome) {
            debug!(request = %resolved.id, "Discarding completion for a dropped request");
        }
    }

    fn unit_ended(&mut self, handle: VoiceHandle) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(unit) = session.remove_unit(handle) {
            debug!(session = session.id, path = %unit.path, "clip ended");
            let event = VoxEvent::ClipEnded {
                session: session.id,
                path: unit.path,
            };
            self.emit(event);
        }
    }

    /// One driver tick: schedule, refill, then finish or re-arm.
    fn pump(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let report = self.scheduler.schedule(session, &self.context);

        while !session.queue.is_full() {
            let Some((id, delay)) = session.next_clip() else {
                break;
            };
            let path = format!("{}/{}.mp3", session.settings.vox_path, id);
            let request = self.pipeline.start(session.id, path, delay, None);
            if let Err(mut request) = session.queue.push(request) {
                request.cancel();
                break;
            }
        }

        let session_id = session.id;
        let finished = session.is_exhausted();

        self.report(session_id, report);
        if finished {
            self.stop(EndReason::Finished);
        } else {
            self.pump_due = Some(Instant::now() + self.config.tick_interval());
        }
    }

    fn report(&mut self, session: u64, report: ScheduleReport) {
        for path in report.skipped {
            self.emit(VoxEvent::ClipSkipped { session, path });
        }
        let Some(commit) = report.committed else {
            return;
        };
        if commit.first {
            info!(session, "▶️ Speech started");
            self.emit(VoxEvent::SpeakStarted { session });
            if let Some(hook) = &self.on_speak_start {
                hook();
            }
        }
        self.emit(VoxEvent::ClipScheduled {
            session,
            path: commit.unit.path,
            start_at: commit.unit.start_at,
            rate: commit.unit.rate,
            duration: commit.unit.duration,
        });
    }

    /// Tear the session down. Does nothing while idle.
    fn stop(&mut self, reason: EndReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.pump_due = None;
        let cancelled = session.queue.cancel_all();
        self.context.graph().stop_all();
        if let Some(reply) = session.take_started_reply() {
            let _ = reply.send(Ok(()));
        }

        info!(
            session = session.id,
            ?reason,
            cancelled,
            scheduled = session.scheduled.len(),
            "🛑 Speech ended"
        );
        self.emit(VoxEvent::SpeakEnded {
            session: session.id,
            reason,
        });
        if let Some(hook) = &self.on_speak_end {
            hook();
        }
    }

    fn status(&self) -> EngineStatus {
        let graph = self.context.graph();
        let session = self.session.as_ref();
        EngineStatus {
            state: if session.is_some() {
                SpeechState::Speaking
            } else {
                SpeechState::Idle
            },
            session: session.map(|s| s.id),
            tokens_remaining: session.map_or(0, |s| s.tokens.len()),
            pending: session.map_or(0, |s| s.queue.len()),
            scheduled: session.map_or(0, |s| s.scheduled.len()),
            next_begin: session.and_then(|s| s.next_begin),
            reverb: session.and_then(|s| s.reverb.clone()),
            reverb_connected: graph.has_reverb(),
            cached_reverbs: self.cache.len(),
            gain: graph.gain(),
            current_time: graph.current_time(),
            suspended: graph.is_suspended(),
        }
    }

    fn emit(&self, event: VoxEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}
