//! railvox-say: speak one utterance of recorded clips and silences.
//!
//! Usage:
//!   cargo run -p railvox-say -- [--voice DIR] [--chime FILE] [--reverb FILE] \
//!       [--rate R] [--volume V] [--render OUT.wav] [--base-url URL] [--events] TOKEN...
//!
//! Each TOKEN is a clip id (played from `{voice}/{id}.mp3`) or a number of seconds of
//! silence. `--json '["a", 0.5, "b"]'` takes the tokens as a JSON array instead.

use anyhow::Context;
use railvox::{
    AssetStore, AudioContext, ClipToken, EngineConfig, FsAssetStore, GraphFormat,
    HttpAssetStore, OfflineBackend, OutputGraph, SpeechSettings, VoxEngine, VoxEvent, REVERBS,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time left for the device to play out its buffer before the process exits.
const DRAIN_MS: u64 = 250;

#[derive(Debug, Default)]
struct Args {
    voice: Option<String>,
    chime: Option<String>,
    reverb: Option<String>,
    rate: Option<f32>,
    volume: Option<f32>,
    render: Option<PathBuf>,
    base_url: Option<String>,
    events: bool,
    list_reverbs: bool,
    tokens: Vec<ClipToken>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Args::default();
        while let Some(a) = args.next() {
            match a.as_str() {
                "--voice" => parsed.voice = args.next(),
                "--chime" => parsed.chime = args.next(),
                "--reverb" => parsed.reverb = args.next(),
                "--rate" => parsed.rate = Some(number(&a, args.next())?),
                "--volume" => parsed.volume = Some(number(&a, args.next())?),
                "--render" => parsed.render = args.next().map(PathBuf::from),
                "--base-url" => parsed.base_url = args.next(),
                "--json" => {
                    let json = args.next().context("--json needs a value")?;
                    parsed.tokens.extend(ClipToken::parse_json(&json)?);
                }
                "--events" => parsed.events = true,
                "--list-reverbs" => parsed.list_reverbs = true,
                word => parsed.tokens.push(ClipToken::parse_word(word)),
            }
        }
        Ok(parsed)
    }

    /// Command-line values first, then `RAILVOX_*` environment variables.
    fn settings(&self, config: &EngineConfig) -> SpeechSettings {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let env_number = |key: &str| env(key).and_then(|v| v.parse::<f32>().ok());

        SpeechSettings {
            vox_path: self
                .voice
                .clone()
                .or_else(|| env("RAILVOX_VOICE"))
                .unwrap_or_else(|| config.data_path.clone()),
            vox_chime: self.chime.clone().or_else(|| env("RAILVOX_CHIME")),
            vox_reverb: self.reverb.clone().or_else(|| env("RAILVOX_REVERB")),
            volume: self.volume.or_else(|| env_number("RAILVOX_VOLUME")),
            rate: self.rate.or_else(|| env_number("RAILVOX_RATE")),
        }
    }
}

fn number(flag: &str, value: Option<String>) -> anyhow::Result<f32> {
    let value = value.with_context(|| format!("{} needs a value", flag))?;
    value
        .parse()
        .with_context(|| format!("{} expects a number, got {:?}", flag, value))
}

fn print_usage() {
    eprintln!("railvox-say: speak recorded clips and silences");
    eprintln!("  TOKEN...            Clip ids, or seconds of silence (e.g. station.a 0.5 platform.1)");
    eprintln!("  --voice DIR         Clip directory (default RAILVOX_VOICE or the data path)");
    eprintln!("  --chime FILE        Lead-in chime, relative to the data path");
    eprintln!("  --reverb FILE       Impulse response, relative to the data path (--list-reverbs)");
    eprintln!("  --rate R            Speaking rate, 0.1..1.9 (default 1)");
    eprintln!("  --volume V          Volume, 0..1.9 (default 1)");
    eprintln!("  --render OUT.wav    Render offline to a WAV file instead of the output device");
    eprintln!("  --base-url URL      Fetch assets over HTTP instead of from the working directory");
    eprintln!("  --json JSON         Tokens as a JSON array");
    eprintln!("  --events            Print engine events as JSON lines");
    eprintln!();
    eprintln!("Configuration: RAILVOX_CONFIG or config/railvox.toml, then RAILVOX_* environment.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[railvox-say] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse(std::env::args().skip(1))?;

    if args.list_reverbs {
        for (key, description) in REVERBS {
            let key = if key.is_empty() { "(none)" } else { *key };
            println!("{:<24} {}", key, description);
        }
        return Ok(());
    }
    if args.tokens.is_empty() {
        print_usage();
        return Ok(());
    }

    let config = EngineConfig::load().context("loading railvox configuration")?;
    let settings = args.settings(&config);

    let graph = OutputGraph::new(GraphFormat::from(&config));
    let (context, offline) = match &args.render {
        Some(path) => {
            let backend = Arc::new(OfflineBackend::spawn(graph.clone(), Some(path.clone()))?);
            let context = AudioContext::new(graph, Arc::clone(&backend) as _);
            (context, Some(backend))
        }
        None => (AudioContext::open_default(graph)?, None),
    };

    let assets: Arc<dyn AssetStore> = match &args.base_url {
        Some(url) => Arc::new(HttpAssetStore::new(url.as_str())?),
        None => Arc::new(FsAssetStore::cwd()),
    };

    let engine = VoxEngine::builder(config)
        .assets(assets)
        .context(context)
        .build()?;
    let mut events = engine
        .take_event_receiver()
        .context("event receiver already taken")?;

    info!(
        tokens = args.tokens.len(),
        vox_path = %settings.vox_path,
        "railvox-say started"
    );
    engine.speak(args.tokens, settings).await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if args.events {
                    println!("{}", serde_json::to_string(&event)?);
                }
                if let VoxEvent::SpeakEnded { reason, .. } = event {
                    info!(?reason, "Speech finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("CTRL-C received; stopping speech");
                engine.stop()?;
            }
        }
    }

    match offline {
        Some(backend) => {
            backend.finish().await;
            if let Some(path) = &args.render {
                info!(path = %path.display(), "Render written");
            }
        }
        None => tokio::time::sleep(Duration::from_millis(DRAIN_MS)).await,
    }
    Ok(())
}
