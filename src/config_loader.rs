use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backends::bing::{DEFAULT_OUTPUT_FORMAT, SYNTHESIS_URL, VOICE_LIST_URL};

pub const KNOWN_BACKENDS: &[&str] = &["bing", "say", "espeak"];
pub const TRANSCODERS: &[&str] = &["ffmpeg", "none"];
pub const PLAYBACK_MODES: &[&str] = &["rodio", "command"];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub audio_extension: String,
    /// Lookup order when finding a voice by name.
    pub backends: Vec<String>,
    // Cloud backend
    pub bing_voice_list_url: String,
    pub bing_synthesis_url: String,
    pub bing_output_format: String,
    pub connect_timeout_secs: u64,
    pub frame_timeout_secs: u64, // 0 disables
    pub request_timeout_secs: u64, // 0 disables
    pub stream_buffer_chunks: usize,
    // External tools
    pub transcoder: String, // "ffmpeg" or "none"
    pub ffmpeg_binary: String,
    pub audio_codec: String,
    pub playback: String, // "rodio" or "command"
    pub player_binary: String,
    pub say_binary: String,
    pub espeak_binary: String,
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".voices"))
        .unwrap_or_else(|| PathBuf::from(".voices"))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            audio_extension: "mp3".to_string(),
            backends: KNOWN_BACKENDS.iter().map(|b| b.to_string()).collect(),
            bing_voice_list_url: VOICE_LIST_URL.to_string(),
            bing_synthesis_url: SYNTHESIS_URL.to_string(),
            bing_output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            connect_timeout_secs: 10,
            frame_timeout_secs: 30,
            request_timeout_secs: 0,
            stream_buffer_chunks: 16,
            transcoder: "ffmpeg".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            audio_codec: "libmp3lame".to_string(),
            playback: "rodio".to_string(),
            player_binary: "ffplay".to_string(),
            say_binary: "say".to_string(),
            espeak_binary: "espeak-ng".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then `./Voices.*`, then `~/.config/speechd-voices/Voices.*`,
    /// then `VOICES_*` environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Like [`Settings::new`], with `extra` merged (and required) just before the environment.
    pub fn load(extra: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("cache_dir", defaults.cache_dir.to_string_lossy().into_owned())?
            .set_default("audio_extension", defaults.audio_extension)?
            .set_default("backends", defaults.backends)?
            .set_default("bing_voice_list_url", defaults.bing_voice_list_url)?
            .set_default("bing_synthesis_url", defaults.bing_synthesis_url)?
            .set_default("bing_output_format", defaults.bing_output_format)?
            .set_default("connect_timeout_secs", defaults.connect_timeout_secs)?
            .set_default("frame_timeout_secs", defaults.frame_timeout_secs)?
            .set_default("request_timeout_secs", defaults.request_timeout_secs)?
            .set_default("stream_buffer_chunks", defaults.stream_buffer_chunks as u64)?
            .set_default("transcoder", defaults.transcoder)?
            .set_default("ffmpeg_binary", defaults.ffmpeg_binary)?
            .set_default("audio_codec", defaults.audio_codec)?
            .set_default("playback", defaults.playback)?
            .set_default("player_binary", defaults.player_binary)?
            .set_default("say_binary", defaults.say_binary)?
            .set_default("espeak_binary", defaults.espeak_binary)?
            .add_source(File::with_name("Voices").required(false));

        if let Some(home) = dirs::home_dir() {
            let user_file = home.join(".config").join("speechd-voices").join("Voices");
            builder =
                builder.add_source(File::with_name(&user_file.to_string_lossy()).required(false));
        }
        if let Some(extra) = extra {
            builder = builder.add_source(File::from(extra).required(true));
        }

        // e.g. VOICES_CACHE_DIR=/tmp/voices, VOICES_BACKENDS=bing,espeak
        let builder = builder.add_source(
            Environment::with_prefix("VOICES")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("backends"),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio_extension.trim().is_empty() {
            return Err(ConfigError::Message(
                "audio_extension must not be empty".to_string(),
            ));
        }
        if self.backends.is_empty() {
            return Err(ConfigError::Message(
                "at least one backend must be enabled".to_string(),
            ));
        }
        if let Some(unknown) = self
            .backends
            .iter()
            .find(|b| !KNOWN_BACKENDS.contains(&b.as_str()))
        {
            return Err(ConfigError::Message(format!(
                "Unknown backend: {unknown}. Expected one of {KNOWN_BACKENDS:?}"
            )));
        }
        if self.stream_buffer_chunks == 0 {
            return Err(ConfigError::Message(
                "stream_buffer_chunks must be greater than 0".to_string(),
            ));
        }
        if !TRANSCODERS.contains(&self.transcoder.as_str()) {
            return Err(ConfigError::Message(format!(
                "Invalid transcoder: {}. Must be one of {TRANSCODERS:?}",
                self.transcoder
            )));
        }
        if !PLAYBACK_MODES.contains(&self.playback.as_str()) {
            return Err(ConfigError::Message(format!(
                "Invalid playback: {}. Must be one of {PLAYBACK_MODES:?}",
                self.playback
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        (self.frame_timeout_secs > 0).then(|| Duration::from_secs(self.frame_timeout_secs))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}
