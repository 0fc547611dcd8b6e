//! Output backends that pull audio from the [`OutputGraph`].
//!
//! - [`RodioBackend`]: the default output device, via CPAL and Rodio.
//! - [`OfflineBackend`]: renders on a tokio timer with no device, optionally capturing to WAV.
//!
//! Both are wrapped by [`AudioContext`], the engine's view of "the device".

use cpal::traits::{DeviceTrait, HostTrait};
use parking_lot::Mutex;
use rodio::{OutputStream, Source};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dsp::RENDER_QUANTUM;
use crate::error::{VoxError, VoxResult};
use crate::graph::OutputGraph;

/// Something that drains the output graph to a sink.
pub trait OutputBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend is still pulling audio.
    fn is_alive(&self) -> bool;

    /// Device buffering delay in seconds, when the backend knows it.
    fn base_latency(&self) -> Option<f64> {
        None
    }
}

/// Graph + backend: the clock, routing and lifecycle the engine schedules against.
#[derive(Clone)]
pub struct AudioContext {
    graph: OutputGraph,
    backend: Arc<dyn OutputBackend>,
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("backend", &self.backend.name())
            .field("graph", &self.graph)
            .finish()
    }
}

impl AudioContext {
    pub fn new(graph: OutputGraph, backend: Arc<dyn OutputBackend>) -> Self {
        Self { graph, backend }
    }

    /// Open the default output device. Failure here is fatal for the engine.
    pub fn open_default(graph: OutputGraph) -> VoxResult<Self> {
        let backend = RodioBackend::open(graph.clone())?;
        Ok(Self::new(graph, Arc::new(backend)))
    }

    /// Render headlessly, optionally capturing to `capture` as a WAV file.
    pub fn offline(graph: OutputGraph, capture: Option<PathBuf>) -> VoxResult<Self> {
        let backend = OfflineBackend::spawn(graph.clone(), capture)?;
        Ok(Self::new(graph, Arc::new(backend)))
    }

    pub fn graph(&self) -> &OutputGraph {
        &self.graph
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn current_time(&self) -> f64 {
        self.graph.current_time()
    }

    pub fn base_latency(&self) -> Option<f64> {
        self.backend.base_latency()
    }

    pub fn is_suspended(&self) -> bool {
        self.graph.is_suspended()
    }

    pub fn suspend(&self) {
        self.graph.suspend();
    }

    /// Resume a suspended output. Fails when the backend has shut down.
    ///
    /// The engine awaits this off the control loop before its first tick.
    pub async fn resume(&self) -> VoxResult<()> {
        if !self.backend.is_alive() {
            return Err(VoxError::AudioDevice(format!(
                "{} output has shut down",
                self.backend.name()
            )));
        }
        self.graph.resume();
        Ok(())
    }
}

/// Rodio source that pulls interleaved samples from the graph one quantum at a time.
pub struct GraphSource {
    graph: OutputGraph,
    buffer: Vec<f32>,
    pos: usize,
    channels: u16,
    sample_rate: u32,
}

impl GraphSource {
    pub fn new(graph: OutputGraph) -> Self {
        let format = graph.format();
        let len = RENDER_QUANTUM * format.channels as usize;
        Self {
            graph,
            buffer: vec![0.0; len],
            pos: len,
            channels: format.channels,
            sample_rate: format.sample_rate,
        }
    }
}

impl Iterator for GraphSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.pos >= self.buffer.len() {
            self.graph.render(&mut self.buffer);
            self.pos = 0;
        }
        let sample = self.buffer[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for GraphSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.buffer.len() - self.pos)
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Plays the graph on the default output device.
///
/// `OutputStream` is not `Send` on every platform, so it lives on a dedicated thread
/// that parks until the backend is dropped.
pub struct RodioBackend {
    device_name: String,
    alive: Arc<AtomicBool>,
    shutdown_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RodioBackend {
    pub fn open(graph: OutputGraph) -> VoxResult<Self> {
        info!("🔊 Initializing audio output");

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| VoxError::AudioDevice("No output device available".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let default_config = device.default_output_config()?;
        info!(
            device = %device_name,
            device_rate = default_config.sample_rate().0,
            graph_rate = graph.format().sample_rate,
            "📱 Using output device"
        );

        let alive = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoxResult<()>>();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let thread_alive = Arc::clone(&alive);
        let thread = thread::Builder::new()
            .name("railvox-output".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                if let Err(e) = handle.play_raw(GraphSource::new(graph)) {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }

                thread_alive.store(true, Ordering::SeqCst);
                let _ = ready_tx.send(Ok(()));

                // Returns on explicit shutdown or when the backend is dropped
                let _ = shutdown_rx.recv();
                thread_alive.store(false, Ordering::SeqCst);
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Audio output failed to start: {}", e);
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(VoxError::AudioStream(
                    "output thread exited before starting".to_string(),
                ));
            }
        }

        info!("✅ Audio output initialized");

        Ok(Self {
            device_name,
            alive,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl OutputBackend for RodioBackend {
    fn name(&self) -> &str {
        "rodio"
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for RodioBackend {
    fn drop(&mut self) {
        self.shutdown_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Renders the graph in real-time-paced blocks without a device.
pub struct OfflineBackend {
    alive: Arc<AtomicBool>,
    block: Duration,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineBackend {
    /// Render period of the offline loop.
    pub const BLOCK: Duration = Duration::from_millis(10);

    /// Must be called from within a tokio runtime.
    pub fn spawn(graph: OutputGraph, capture: Option<PathBuf>) -> VoxResult<Self> {
        let format = graph.format();
        let mut writer = match capture {
            Some(path) => {
                let spec = hound::WavSpec {
                    channels: format.channels,
                    sample_rate: format.sample_rate,
                    bits_per_sample: 32,
                    sample_format: hound::SampleFormat::Float,
                };
                info!(path = %path.display(), "Capturing offline render to WAV");
                Some(hound::WavWriter::create(&path, spec)?)
            }
            None => None,
        };

        let alive = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let block = Self::BLOCK;
        let frames = (format.sample_rate as u64 * block.as_millis() as u64 / 1000).max(1) as usize;
        let mut buffer = vec![0.0f32; frames * format.channels as usize];

        let task_alive = Arc::clone(&alive);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(block);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        graph.render(&mut buffer);
                        let mut failed = false;
                        if let Some(w) = writer.as_mut() {
                            for &sample in &buffer {
                                if let Err(e) = w.write_sample(sample) {
                                    warn!("Offline capture write failed: {}", e);
                                    failed = true;
                                    break;
                                }
                            }
                        }
                        if failed {
                            writer = None;
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            if let Some(w) = writer {
                if let Err(e) = w.finalize() {
                    warn!("Offline capture finalize failed: {}", e);
                }
            }
            task_alive.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            alive,
            block,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Signal the render loop to stop. The capture file is finalized in the background.
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Stop rendering and wait until any capture file has been finalized.
    pub async fn finish(&self) {
        self.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Offline render task failed: {}", e);
            }
        }
    }
}

impl OutputBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.shutdown_tx.lock().is_some()
    }

    fn base_latency(&self) -> Option<f64> {
        Some(self.block.as_secs_f64())
    }
}

impl Drop for OfflineBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AudioBuffer;
    use crate::graph::GraphFormat;

    #[test]
    fn test_graph_source_reports_format() {
        let graph = OutputGraph::new(GraphFormat::default());
        let mut source = GraphSource::new(graph);
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), 44_100);
        assert_eq!(source.next(), Some(0.0));
        assert!(source.total_duration().is_none());
    }

    #[tokio::test]
    async fn test_offline_backend_advances_clock() {
        let graph = OutputGraph::new(GraphFormat::default());
        let context = AudioContext::offline(graph, None).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(context.current_time() > 0.0);
        assert_eq!(context.backend_name(), "offline");
    }

    #[tokio::test]
    async fn test_resume_after_suspend() {
        let graph = OutputGraph::new(GraphFormat::default());
        let context = AudioContext::offline(graph, None).unwrap();
        context.suspend();
        assert!(context.is_suspended());
        tokio_test::assert_ok!(context.resume().await);
        assert!(!context.is_suspended());
    }

    #[tokio::test]
    async fn test_offline_capture_writes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.wav");
        let graph = OutputGraph::new(GraphFormat {
            channels: 1,
            filter_cutoff_hz: 0.0,
            ..GraphFormat::default()
        });
        graph.schedule(
            Arc::new(AudioBuffer::from_interleaved(vec![0.5; 441], 1, 44_100)),
            0.0,
            1.0,
        );

        let backend = OfflineBackend::spawn(graph, Some(path.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.finish().await;
        assert!(!backend.is_alive());

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert!(reader.len() > 0);
    }
}
