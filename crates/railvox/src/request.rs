//! The request pipeline: one fetch + decode per clip, run concurrently off the control loop.
//!
//! Each [`PlaybackRequest`] starts its work immediately. Completion is not written into the
//! request directly; it is posted as a [`Resolved`] message to the engine's command queue
//! and applied there, so only the control loop ever mutates request state.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::asset::AssetStore;
use crate::buffer::{decode, AudioBuffer};
use crate::error::{VoxError, VoxResult};

/// Identity of a request within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum RequestState {
    Pending,
    Ready(Arc<AudioBuffer>),
    Failed(String),
}

/// A request that has left the queue with its outcome settled.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub path: String,
    pub delay: f64,
    pub rate_override: Option<f32>,
    /// Decoded clip, or why it could not be fetched.
    pub outcome: Result<Arc<AudioBuffer>, String>,
}

/// A clip on its way from storage to the scheduler.
pub struct PlaybackRequest {
    id: RequestId,
    path: String,
    /// Seconds of silence to leave before this clip.
    delay: f64,
    rate_override: Option<f32>,
    state: RequestState,
    task: Option<AbortHandle>,
}

impl fmt::Debug for PlaybackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackRequest")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("delay", &self.delay)
            .field("rate_override", &self.rate_override)
            .field("state", &self.state)
            .finish()
    }
}

impl PlaybackRequest {
    /// A request whose work is driven elsewhere (or already done).
    pub fn new(id: RequestId, path: impl Into<String>, delay: f64, rate_override: Option<f32>) -> Self {
        Self {
            id,
            path: path.into(),
            delay,
            rate_override,
            state: RequestState::Pending,
            task: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn rate_override(&self) -> Option<f32> {
        self.rate_override
    }

    pub fn state(&self) -> &RequestState {
        &self.state
    }

    /// Ready or Failed.
    pub fn is_resolved(&self) -> bool {
        !matches!(self.state, RequestState::Pending)
    }

    /// Apply the outcome of the fetch/decode. Ignored once resolved.
    pub fn resolve(&mut self, outcome: VoxResult<AudioBuffer>) {
        if self.is_resolved() {
            return;
        }
        self.task = None;
        self.state = match outcome {
            Ok(buffer) => RequestState::Ready(Arc::new(buffer)),
            Err(e) => RequestState::Failed(e.to_string()),
        };
    }

    /// Abort outstanding work. Safe on requests that already finished.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Settle into a [`ResolvedRequest`]. Hands the request back while it is still pending.
    pub fn into_resolved(self) -> Result<ResolvedRequest, Self> {
        let outcome = match &self.state {
            RequestState::Pending => return Err(self),
            RequestState::Ready(buffer) => Ok(Arc::clone(buffer)),
            RequestState::Failed(reason) => Err(reason.clone()),
        };
        Ok(ResolvedRequest {
            path: self.path,
            delay: self.delay,
            rate_override: self.rate_override,
            outcome,
        })
    }

    pub(crate) fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }
}

/// Completion notice for one request.
#[derive(Debug)]
pub struct Resolved {
    pub session: u64,
    pub id: RequestId,
    pub outcome: VoxResult<AudioBuffer>,
}

/// Starts requests and reports their completion as `C` on a single queue.
pub struct RequestPipeline<C> {
    assets: Arc<dyn AssetStore>,
    channels: u16,
    sample_rate: u32,
    notify: mpsc::UnboundedSender<C>,
    next_id: u64,
}

impl<C> RequestPipeline<C>
where
    C: From<Resolved> + Send + 'static,
{
    pub fn new(
        assets: Arc<dyn AssetStore>,
        channels: u16,
        sample_rate: u32,
        notify: mpsc::UnboundedSender<C>,
    ) -> Self {
        Self {
            assets,
            channels,
            sample_rate,
            notify,
            next_id: 1,
        }
    }

    /// Create a request for `path` and begin fetching it right away.
    pub fn start(
        &mut self,
        session: u64,
        path: String,
        delay: f64,
        rate_override: Option<f32>,
    ) -> PlaybackRequest {
        let id = RequestId::new(self.next_id);
        self.next_id += 1;

        let assets = Arc::clone(&self.assets);
        let notify = self.notify.clone();
        let (channels, sample_rate) = (self.channels, self.sample_rate);
        let fetch_path = path.clone();

        debug!(%id, path = %path, delay, "request started");
        let task = tokio::spawn(async move {
            let outcome = fetch_and_decode(assets.as_ref(), &fetch_path, channels, sample_rate).await;
            // Engine gone means nobody is waiting for this clip
            let _ = notify.send(C::from(Resolved {
                session,
                id,
                outcome,
            }));
        });

        PlaybackRequest::new(id, path, delay, rate_override).with_task(task.abort_handle())
    }
}

/// Fetch `path` and decode it on the blocking pool.
pub async fn fetch_and_decode(
    assets: &dyn AssetStore,
    path: &str,
    channels: u16,
    sample_rate: u32,
) -> VoxResult<AudioBuffer> {
    let bytes = assets.fetch(path).await?;
    tokio::task::spawn_blocking(move || decode(bytes, channels, sample_rate))
        .await
        .map_err(|e| VoxError::Decode(format!("decode task failed: {}", e)))?
}
