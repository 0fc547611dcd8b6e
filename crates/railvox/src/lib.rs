//! # Railvox - Gapless Speech From Recorded Clips
//!
//! This crate stitches pre-recorded voice clips and silence gaps into one continuous
//! announcement. Clips are fetched and decoded concurrently but always reach the output
//! in submission order, scheduled sample-accurately on the device clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Vox Engine                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐     │
//! │  │   Tokens     │→ │ Pending (10) │→ │ Scheduler    │     │
//! │  │ clip | gap   │  │ fetch+decode │  │ (≤5 ahead)   │     │
//! │  └──────────────┘  └──────────────┘  └──────────────┘     │
//! │                                              ↓              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐     │
//! │  │   Output     │← │  High-pass   │← │    Gain      │     │
//! │  │ (rodio/wav)  │  │ [+ reverb]   │  │ (volume)     │     │
//! │  └──────────────┘  └──────────────┘  └──────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod asset;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod graph;
pub mod queue;
pub mod remap;
pub mod request;
pub mod reverb;
pub mod scheduler;
pub mod session;
pub mod token;

pub use asset::{AssetStore, FsAssetStore, HttpAssetStore, MemoryAssetStore};
pub use buffer::{decode, AudioBuffer};
pub use config::{EngineConfig, SpeechSettings};
pub use device::{AudioContext, OfflineBackend, OutputBackend, RodioBackend};
pub use engine::{EngineStatus, SpeechHook, SpeechState, VoxEngine, VoxEngineBuilder, VoxEvent};
pub use error::{VoxError, VoxResult};
pub use graph::{GraphFormat, OutputGraph, VoiceHandle};
pub use remap::{remap_rate, remap_volume};
pub use reverb::{reverb_description, ImpulseResponseCache, ReverbUnit, REVERBS};
pub use session::EndReason;
pub use token::ClipToken;
