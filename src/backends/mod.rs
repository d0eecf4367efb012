pub mod bing;
pub mod catalog;
pub mod espeak;
pub mod mac_say;

use crate::context::CallContext;
use crate::error::Result;
use crate::stream::AudioStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use catalog::VoiceCatalog;

/// Represents a text-to-speech voice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceDescriptor {
    /// The backend's canonical identifier, used in synthesis requests.
    pub internal_name: String,
    /// Short human name, what users pass to `--voice`.
    pub display_name: String,
    /// BCP-47 style tag with hyphens, e.g. `zh-CN`.
    pub language: String,
    pub detail: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl VoiceDescriptor {
    /// Directory name used for this voice under the cache root.
    pub fn cache_segment(&self) -> String {
        self.display_name.replace(['/', '\\'], "_")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VoiceFilter {
    #[default]
    All,
    /// Exact display or internal name; at most one match.
    Name(String),
    /// Exact language tag, no prefix or substring matching.
    Language(String),
}

/// Anything that can turn text into raw audio bytes for one voice.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn open_stream(
        &self,
        ctx: &CallContext,
        voice: &VoiceDescriptor,
        text: &str,
    ) -> Result<AudioStream>;
}

/// Trait that all speech synthesis backends must implement.
/// This allows us to plug in different engines (cloud endpoint, `say`, eSpeak, ...)
#[async_trait]
pub trait SpeechBackend: AudioSource {
    /// Returns the unique ID of the backend (e.g., "bing"); also the cache directory name.
    fn id(&self) -> &'static str;

    /// Returns the memoized voice list, narrowed by `filter`. A first call
    /// enumerates under `ctx`.
    async fn list_voices(
        &self,
        ctx: &CallContext,
        filter: &VoiceFilter,
    ) -> Result<Vec<VoiceDescriptor>>;
}
