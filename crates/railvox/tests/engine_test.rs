//! End-to-end tests for the speech engine, rendered through the offline backend.
//!
//! Clips are tiny synthesized WAVs served from memory, so these run without audio hardware.

use async_trait::async_trait;
use bytes::Bytes;
use railvox::{
    AssetStore, AudioContext, ClipToken, EndReason, EngineConfig, GraphFormat, MemoryAssetStore,
    OutputBackend, OutputGraph, SpeechSettings, VoxEngine, VoxError, VoxEvent, VoxResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const RATE: u32 = 8_000;
/// 50 ms per clip.
const CLIP_FRAMES: usize = 400;
/// Offline backend block, reported as its base latency.
const LATENCY: f64 = 0.01;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> EngineConfig {
    EngineConfig {
        data_path: "data".to_string(),
        tick_interval_ms: 10,
        latency_margin_ms: 0,
        sample_rate: RATE,
        channels: 1,
        ..EngineConfig::default()
    }
}

fn wav(frames: usize, value: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample((value * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Memory store that holds some fetches back, to force out-of-order completion.
struct SlowStore {
    inner: MemoryAssetStore,
    delays: HashMap<String, Duration>,
}

impl SlowStore {
    fn new() -> Self {
        Self {
            inner: MemoryAssetStore::new(),
            delays: HashMap::new(),
        }
    }

    fn clip(self, path: &str, delay_ms: u64) -> Self {
        self.asset(path, wav(CLIP_FRAMES, 0.2), delay_ms)
    }

    fn asset(mut self, path: &str, bytes: Vec<u8>, delay_ms: u64) -> Self {
        self.inner.insert(path, bytes);
        self.delays
            .insert(path.to_string(), Duration::from_millis(delay_ms));
        self
    }
}

#[async_trait]
impl AssetStore for SlowStore {
    async fn fetch(&self, path: &str) -> VoxResult<Bytes> {
        if let Some(delay) = self.delays.get(path) {
            tokio::time::sleep(*delay).await;
        }
        self.inner.fetch(path).await
    }
}

fn offline_engine(store: SlowStore) -> (VoxEngine, UnboundedReceiver<VoxEvent>) {
    let config = test_config();
    let context = AudioContext::offline(OutputGraph::new(GraphFormat::from(&config)), None)
        .expect("offline output");
    let engine = VoxEngine::builder(config)
        .assets(Arc::new(store))
        .context(context)
        .build()
        .expect("engine");
    let events = engine.take_event_receiver().expect("event receiver");
    (engine, events)
}

fn clips(ids: &[&str]) -> Vec<ClipToken> {
    ids.iter().map(|id| ClipToken::clip(*id)).collect()
}

/// Collect events up to and including the end of `session`.
async fn until_end(events: &mut UnboundedReceiver<VoxEvent>, session: u64) -> Vec<VoxEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event channel closed");
        let done = matches!(event, VoxEvent::SpeakEnded { session: s, .. } if s == session);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn scheduled(events: &[VoxEvent]) -> Vec<(String, f64, f32, f64)> {
    events
        .iter()
        .filter_map(|e| match e {
            VoxEvent::ClipScheduled {
                path,
                start_at,
                rate,
                duration,
                ..
            } => Some((path.clone(), *start_at, *rate, *duration)),
            _ => None,
        })
        .collect()
}

fn end_reason(events: &[VoxEvent]) -> Option<EndReason> {
    events.iter().find_map(|e| match e {
        VoxEvent::SpeakEnded { reason, .. } => Some(*reason),
        _ => None,
    })
}

#[tokio::test]
async fn test_clips_play_in_submission_order() {
    init_tracing();
    let store = SlowStore::new()
        .clip("vox/a.mp3", 150)
        .clip("vox/b.mp3", 0)
        .clip("vox/c.mp3", 60);
    let (engine, mut events) = offline_engine(store);

    engine
        .speak(clips(&["a", "b", "c"]), SpeechSettings::new("vox"))
        .await
        .unwrap();
    let seen = until_end(&mut events, 1).await;

    let order: Vec<String> = scheduled(&seen).into_iter().map(|u| u.0).collect();
    assert_eq!(order, vec!["vox/a.mp3", "vox/b.mp3", "vox/c.mp3"]);

    let starts: Vec<f64> = scheduled(&seen).into_iter().map(|u| u.1).collect();
    assert!(starts.windows(2).all(|w| w[0] <= w[1]));

    assert!(matches!(seen.first(), Some(VoxEvent::SpeakStarted { session: 1 })));
    let ended = seen
        .iter()
        .filter(|e| matches!(e, VoxEvent::ClipEnded { .. }))
        .count();
    assert_eq!(ended, 3);
    assert_eq!(end_reason(&seen), Some(EndReason::Finished));
}

#[tokio::test]
async fn test_silence_becomes_delay() {
    init_tracing();
    let store = SlowStore::new().clip("vox/a.mp3", 0).clip("vox/b.mp3", 0);
    let (engine, mut events) = offline_engine(store);

    let tokens = vec![
        ClipToken::clip("a"),
        ClipToken::silence(0.1),
        ClipToken::silence(0.1),
        ClipToken::clip("b"),
    ];
    engine.speak(tokens, SpeechSettings::new("vox")).await.unwrap();
    let units = scheduled(&until_end(&mut events, 1).await);

    assert_eq!(units.len(), 2);
    let gap = units[1].1 - units[0].1;
    let expected = units[0].3 + 0.2 - LATENCY;
    assert!((gap - expected).abs() < 1e-6, "gap {} expected {}", gap, expected);
}

#[tokio::test]
async fn test_chime_leads_with_fixed_rate_and_gap() {
    init_tracing();
    let store = SlowStore::new().clip("data/chime.wav", 0).clip("vox/a.mp3", 0);
    let (engine, mut events) = offline_engine(store);

    let settings = SpeechSettings::new("vox")
        .with_chime("chime.wav")
        .with_rate(1.5);
    engine.speak(clips(&["a"]), settings).await.unwrap();
    let units = scheduled(&until_end(&mut events, 1).await);

    assert_eq!(units.len(), 2);
    assert_eq!(units[0].0, "data/chime.wav");
    assert_eq!(units[0].2, 1.0);
    // 1.5 remaps to 1.25, which also stretches the one-second gap
    assert!((units[1].2 - 1.25).abs() < 1e-6);
    let gap = units[1].1 - units[0].1;
    let expected = units[0].3 + 1.0 / 1.25 - LATENCY;
    assert!((gap - expected).abs() < 1e-6, "gap {} expected {}", gap, expected);
}

#[tokio::test]
async fn test_failed_clip_is_skipped() {
    init_tracing();
    let store = SlowStore::new().clip("vox/a.mp3", 0).clip("vox/c.mp3", 0);
    let (engine, mut events) = offline_engine(store);

    engine
        .speak(clips(&["a", "missing", "c"]), SpeechSettings::new("vox"))
        .await
        .unwrap();
    let seen = until_end(&mut events, 1).await;

    assert!(seen.contains(&VoxEvent::ClipSkipped {
        session: 1,
        path: "vox/missing.mp3".to_string()
    }));
    let order: Vec<String> = scheduled(&seen).into_iter().map(|u| u.0).collect();
    assert_eq!(order, vec!["vox/a.mp3", "vox/c.mp3"]);
    assert_eq!(end_reason(&seen), Some(EndReason::Finished));
}

#[tokio::test]
async fn test_queue_bounds_hold() {
    init_tracing();
    let mut store = SlowStore::new();
    let ids: Vec<String> = (0..30).map(|n| format!("w{}", n)).collect();
    for id in &ids {
        store = store.clip(&format!("vox/{}.mp3", id), 0);
    }
    let (engine, mut events) = offline_engine(store);

    let tokens: Vec<ClipToken> = ids.iter().map(ClipToken::clip).collect();
    engine.speak(tokens, SpeechSettings::new("vox")).await.unwrap();

    let mut peak_scheduled = 0;
    loop {
        let status = engine.status().await.unwrap();
        assert!(status.pending <= 10, "pending {}", status.pending);
        assert!(status.scheduled <= 5, "scheduled {}", status.scheduled);
        peak_scheduled = peak_scheduled.max(status.scheduled);
        if status.session.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(peak_scheduled > 1);

    let seen = until_end(&mut events, 1).await;
    assert_eq!(scheduled(&seen).len(), 30);
}

#[tokio::test]
async fn test_new_utterance_replaces_current() {
    init_tracing();
    let mut store = SlowStore::new().clip("vox/next.mp3", 0);
    for n in 0..8 {
        store = store.clip(&format!("vox/slow{}.mp3", n), 300);
    }
    let (engine, mut events) = offline_engine(store);

    let slow: Vec<ClipToken> = (0..8).map(|n| ClipToken::clip(format!("slow{}", n))).collect();
    engine.speak(slow, SpeechSettings::new("vox")).await.unwrap();
    engine
        .speak(clips(&["next"]), SpeechSettings::new("vox"))
        .await
        .unwrap();

    let first = until_end(&mut events, 1).await;
    assert_eq!(end_reason(&first), Some(EndReason::Cancelled));
    assert!(scheduled(&first).is_empty());

    let second = until_end(&mut events, 2).await;
    let order: Vec<String> = scheduled(&second).into_iter().map(|u| u.0).collect();
    assert_eq!(order, vec!["vox/next.mp3"]);
    assert_eq!(end_reason(&second), Some(EndReason::Finished));
}

#[tokio::test]
async fn test_replacement_tears_down_scheduled_units() {
    init_tracing();
    // Two-second clips stay on the timeline long enough to be torn down
    let mut store = SlowStore::new().clip("vox/next.mp3", 500);
    for n in 0..6 {
        store = store.asset(&format!("vox/long{}.mp3", n), wav(RATE as usize * 2, 0.2), 0);
    }
    let (engine, mut events) = offline_engine(store);
    let graph = engine.context().graph().clone();

    let long: Vec<ClipToken> = (0..6).map(|n| ClipToken::clip(format!("long{}", n))).collect();
    engine.speak(long, SpeechSettings::new("vox")).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while engine.status().await.unwrap().scheduled < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first utterance never scheduled");
    assert!(graph.active_voices() >= 2);

    engine
        .speak(clips(&["next"]), SpeechSettings::new("vox"))
        .await
        .unwrap();
    let status = engine.status().await.unwrap();
    assert_eq!(status.session, Some(2));
    assert_eq!(status.scheduled, 0);

    // Stopped voices fade out within a render block; "next" is still loading
    timeout(Duration::from_millis(300), async {
        while graph.active_voices() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("voices from the replaced utterance kept playing");

    let first = until_end(&mut events, 1).await;
    assert_eq!(end_reason(&first), Some(EndReason::Cancelled));
    assert!(scheduled(&first).len() >= 2);
    assert!(!first.iter().any(|e| matches!(e, VoxEvent::ClipEnded { .. })));

    let second = until_end(&mut events, 2).await;
    let order: Vec<String> = scheduled(&second).into_iter().map(|u| u.0).collect();
    assert_eq!(order, vec!["vox/next.mp3"]);
    assert_eq!(end_reason(&second), Some(EndReason::Finished));
}

#[tokio::test]
async fn test_out_of_range_rate_still_finishes() {
    init_tracing();
    let store = SlowStore::new().clip("vox/a.mp3", 0).clip("vox/b.mp3", 0);
    let (engine, mut events) = offline_engine(store);

    let settings = SpeechSettings::new("vox").with_rate(-4.0);
    engine.speak(clips(&["a", "b"]), settings).await.unwrap();
    let seen = until_end(&mut events, 1).await;

    let units = scheduled(&seen);
    assert_eq!(units.len(), 2);
    for (_, start_at, rate, duration) in &units {
        assert!((rate - 0.82).abs() < 1e-6);
        assert!(start_at.is_finite() && duration.is_finite());
    }
    assert!(units[1].1 > units[0].1);
    assert_eq!(end_reason(&seen), Some(EndReason::Finished));
}

#[tokio::test]
async fn test_stop_while_idle_is_a_no_op() {
    init_tracing();
    let (engine, mut events) = offline_engine(SlowStore::new());

    engine.stop().unwrap();
    engine.stop().unwrap();
    assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());

    let status = engine.status().await.unwrap();
    assert!(status.session.is_none());
}

#[tokio::test]
async fn test_stop_cancels_speech() {
    init_tracing();
    let store = SlowStore::new().clip("vox/a.mp3", 500);
    let (engine, mut events) = offline_engine(store);

    engine.speak(clips(&["a"]), SpeechSettings::new("vox")).await.unwrap();
    engine.stop().unwrap();

    let seen = until_end(&mut events, 1).await;
    assert_eq!(end_reason(&seen), Some(EndReason::Cancelled));

    // The late completion for the stopped session is discarded
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = engine.status().await.unwrap();
    assert!(status.session.is_none());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_empty_utterance_ends_without_starting() {
    init_tracing();
    let starts = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));

    let config = test_config();
    let context =
        AudioContext::offline(OutputGraph::new(GraphFormat::from(&config)), None).unwrap();
    let (s, e) = (Arc::clone(&starts), Arc::clone(&ends));
    let engine = VoxEngine::builder(config)
        .assets(Arc::new(SlowStore::new()))
        .context(context)
        .on_speak_start(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_speak_end(move || {
            e.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let mut events = engine.take_event_receiver().unwrap();
    assert!(engine.take_event_receiver().is_none());

    engine
        .speak(vec![ClipToken::silence(0.5)], SpeechSettings::new("vox"))
        .await
        .unwrap();
    let seen = until_end(&mut events, 1).await;

    assert_eq!(seen.len(), 1);
    assert_eq!(end_reason(&seen), Some(EndReason::Finished));
    assert_eq!(starts.load(Ordering::SeqCst), 0);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_hooks_fire_once_per_utterance() {
    init_tracing();
    let starts = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));

    let config = test_config();
    let context =
        AudioContext::offline(OutputGraph::new(GraphFormat::from(&config)), None).unwrap();
    let (s, e) = (Arc::clone(&starts), Arc::clone(&ends));
    let store = SlowStore::new().clip("vox/a.mp3", 0).clip("vox/b.mp3", 0);
    let engine = VoxEngine::builder(config)
        .assets(Arc::new(store))
        .context(context)
        .on_speak_start(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_speak_end(move || {
            e.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let mut events = engine.take_event_receiver().unwrap();

    engine.speak(clips(&["a", "b"]), SpeechSettings::new("vox")).await.unwrap();
    until_end(&mut events, 1).await;

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_volume_sets_gain() {
    init_tracing();
    let store = SlowStore::new().clip("vox/a.mp3", 0);
    let (engine, mut events) = offline_engine(store);

    let settings = SpeechSettings::new("vox").with_volume(1.5);
    engine.speak(clips(&["a"]), settings).await.unwrap();
    let status = engine.status().await.unwrap();
    assert!((status.gain - 6.0).abs() < 1e-5);
    until_end(&mut events, 1).await;

    engine.speak(clips(&["a"]), SpeechSettings::new("vox")).await.unwrap();
    assert!((engine.status().await.unwrap().gain - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_reverb_loads_once_and_is_reused() {
    init_tracing();
    let mut store = SlowStore::new().clip("vox/b.mp3", 0);
    store = store.clip("vox/a.mp3", 300);
    store.inner.insert("data/ir.test.wav", wav(64, 0.5));
    let (engine, mut events) = offline_engine(store);

    let settings = SpeechSettings::new("vox").with_reverb("ir.test.wav");
    engine.speak(clips(&["a", "b"]), settings.clone()).await.unwrap();

    let mut loaded = 0;
    let seen = until_end(&mut events, 1).await;
    for event in &seen {
        if let VoxEvent::ReverbLoaded { file } = event {
            assert_eq!(file, "ir.test.wav");
            loaded += 1;
        }
    }
    assert_eq!(loaded, 1);

    // Cache hit: connected before anything is fetched
    engine.speak(clips(&["b"]), settings).await.unwrap();
    let status = engine.status().await.unwrap();
    assert!(status.reverb_connected);
    assert_eq!(status.cached_reverbs, 1);
    assert_eq!(status.reverb.as_deref(), Some("ir.test.wav"));
    let seen = until_end(&mut events, 2).await;
    assert!(!seen.iter().any(|e| matches!(e, VoxEvent::ReverbLoaded { .. })));

    engine.speak(clips(&["b"]), SpeechSettings::new("vox")).await.unwrap();
    assert!(!engine.status().await.unwrap().reverb_connected);
}

#[tokio::test]
async fn test_uncached_reverb_passes_straight_through_until_loaded() {
    init_tracing();
    let store = SlowStore::new()
        .clip("vox/a.mp3", 600)
        .asset("data/ir.slow.wav", wav(64, 0.5), 200);
    let (engine, mut events) = offline_engine(store);

    let settings = SpeechSettings::new("vox").with_reverb("ir.slow.wav");
    engine.speak(clips(&["a"]), settings).await.unwrap();
    let status = engine.status().await.unwrap();
    assert_eq!(status.reverb.as_deref(), Some("ir.slow.wav"));
    assert!(!status.reverb_connected);
    assert_eq!(status.cached_reverbs, 0);

    let loaded = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(VoxEvent::ReverbLoaded { file }) => return file,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("reverb never loaded");
    assert_eq!(loaded, "ir.slow.wav");

    let status = engine.status().await.unwrap();
    assert_eq!(status.session, Some(1));
    assert!(status.reverb_connected);
    assert_eq!(status.cached_reverbs, 1);
    let seen = until_end(&mut events, 1).await;
    assert_eq!(end_reason(&seen), Some(EndReason::Finished));
}

#[tokio::test]
async fn test_shutdown_releases_end_notices() {
    init_tracing();
    let (engine, _events) = offline_engine(SlowStore::new());
    let graph = engine.context().graph().clone();
    // Give the forwarding task a moment to start
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(graph.has_ended_listener());

    drop(engine);
    timeout(Duration::from_secs(2), async {
        while graph.has_ended_listener() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("end-notice forwarding outlived the engine");
}

#[tokio::test]
async fn test_suspended_output_is_resumed() {
    init_tracing();
    let store = SlowStore::new().clip("vox/a.mp3", 0);
    let config = test_config();
    let context =
        AudioContext::offline(OutputGraph::new(GraphFormat::from(&config)), None).unwrap();
    context.suspend();
    let engine = VoxEngine::builder(config)
        .assets(Arc::new(store))
        .context(context)
        .build()
        .unwrap();
    let mut events = engine.take_event_receiver().unwrap();

    engine.speak(clips(&["a"]), SpeechSettings::new("vox")).await.unwrap();
    assert!(!engine.context().is_suspended());
    let seen = until_end(&mut events, 1).await;
    assert_eq!(end_reason(&seen), Some(EndReason::Finished));
}

struct DeadBackend;

impl OutputBackend for DeadBackend {
    fn name(&self) -> &str {
        "dead"
    }

    fn is_alive(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_resume_failure_is_reported() {
    init_tracing();
    let config = test_config();
    let graph = OutputGraph::new(GraphFormat::from(&config));
    let context = AudioContext::new(graph, Arc::new(DeadBackend));
    context.suspend();
    let engine = VoxEngine::builder(config)
        .assets(Arc::new(SlowStore::new().clip("vox/a.mp3", 0)))
        .context(context)
        .build()
        .unwrap();
    let mut events = engine.take_event_receiver().unwrap();

    let result = engine.speak(clips(&["a"]), SpeechSettings::new("vox")).await;
    assert!(matches!(result, Err(VoxError::AudioDevice(_))));

    let seen = until_end(&mut events, 1).await;
    assert_eq!(end_reason(&seen), Some(EndReason::Failed));
}
