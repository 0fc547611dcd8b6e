//! Utterance tokens: clip references and silence gaps.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::VoxResult;

/// One atomic item of an utterance.
///
/// Silence never becomes a playable unit; it accumulates into the delay of the next clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClipToken {
    /// Seconds of silence before the next clip.
    Silence(f64),
    /// Clip identifier, resolved to `{vox_path}/{id}.mp3`.
    Clip(String),
}

impl ClipToken {
    pub fn clip(id: impl Into<String>) -> Self {
        ClipToken::Clip(id.into())
    }

    /// Silence token. Negative or non-finite durations collapse to zero.
    pub fn silence(seconds: f64) -> Self {
        ClipToken::Silence(sanitize_silence(seconds))
    }

    /// Parse a command-line word: numbers are silence, anything else is a clip id.
    pub fn parse_word(word: &str) -> Self {
        match word.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() => ClipToken::silence(secs),
            _ => ClipToken::Clip(word.trim().to_string()),
        }
    }

    /// Parse a JSON array such as `["station.a", 0.5, "platform.1"]`.
    pub fn parse_json(json: &str) -> VoxResult<Vec<ClipToken>> {
        let tokens: Vec<ClipToken> = serde_json::from_str(json)?;
        Ok(tokens
            .into_iter()
            .map(|t| match t {
                ClipToken::Silence(s) => ClipToken::silence(s),
                clip => clip,
            })
            .collect())
    }

    pub fn is_clip(&self) -> bool {
        matches!(self, ClipToken::Clip(_))
    }
}

impl fmt::Display for ClipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClipToken::Silence(s) => write!(f, "{s}"),
            ClipToken::Clip(id) => f.write_str(id),
        }
    }
}

impl From<&str> for ClipToken {
    fn from(id: &str) -> Self {
        ClipToken::Clip(id.to_string())
    }
}

impl From<String> for ClipToken {
    fn from(id: String) -> Self {
        ClipToken::Clip(id)
    }
}

impl From<f64> for ClipToken {
    fn from(seconds: f64) -> Self {
        ClipToken::silence(seconds)
    }
}

pub(crate) fn sanitize_silence(seconds: f64) -> f64 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    }
}
