//! Cached text-to-speech.
//!
//! A [`registry::VoiceRegistry`] resolves a voice name against an ordered list
//! of backends. The resulting [`voice::Voice`] synthesizes each distinct phrase
//! once, keeps the audio under the cache directory, and replays it from disk.

pub mod backends;
pub mod cache;
pub mod config_loader;
pub mod context;
pub mod engine;
pub mod error;
pub mod exec;
pub mod protocol;
pub mod registry;
pub mod stream;
pub mod transcode;
pub mod voice;

pub use context::CallContext;
pub use error::{Result, VoiceError};
