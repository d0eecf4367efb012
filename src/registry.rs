use crate::backends::bing::{BingBackend, BingConfig};
use crate::backends::espeak::EspeakBackend;
use crate::backends::mac_say::MacSayBackend;
use crate::backends::{SpeechBackend, VoiceDescriptor, VoiceFilter};
use crate::cache::CacheStore;
use crate::config_loader::Settings;
use crate::context::CallContext;
use crate::engine::{AudioOutput, CommandOutput, RodioOutput};
use crate::error::{Result, VoiceError};
use crate::transcode::{CopyTranscoder, FfmpegTranscoder, Transcoder};
use crate::voice::Voice;
use std::sync::Arc;
use tracing::{debug, warn};

/// Ordered set of backends sharing one cache and one audio output.
pub struct VoiceRegistry {
    backends: Vec<Arc<dyn SpeechBackend>>,
    cache: Arc<CacheStore>,
    output: Arc<dyn AudioOutput>,
}

impl VoiceRegistry {
    pub fn new(cache: Arc<CacheStore>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            backends: Vec::new(),
            cache,
            output,
        }
    }

    /// Appends `backend`; earlier backends win name lookups.
    pub fn with_backend(mut self, backend: Arc<dyn SpeechBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let transcoder: Arc<dyn Transcoder> = match settings.transcoder.as_str() {
            "none" => Arc::new(CopyTranscoder),
            _ => Arc::new(FfmpegTranscoder::new(
                settings.ffmpeg_binary.clone(),
                settings.audio_codec.clone(),
            )),
        };
        let output: Arc<dyn AudioOutput> = match settings.playback.as_str() {
            "command" => Arc::new(CommandOutput::new(settings.player_binary.clone())),
            _ => Arc::new(RodioOutput),
        };
        let cache = Arc::new(CacheStore::new(
            settings.cache_dir.clone(),
            settings.audio_extension.clone(),
            transcoder,
        ));

        let mut registry = Self::new(cache, output);
        for id in &settings.backends {
            let backend: Arc<dyn SpeechBackend> = match id.as_str() {
                "bing" => Arc::new(BingBackend::new(BingConfig {
                    voice_list_url: settings.bing_voice_list_url.clone(),
                    synthesis_url: settings.bing_synthesis_url.clone(),
                    output_format: settings.bing_output_format.clone(),
                    connect_timeout: settings.connect_timeout(),
                    frame_timeout: settings.frame_timeout(),
                    stream_buffer_chunks: settings.stream_buffer_chunks,
                })?),
                "say" => Arc::new(MacSayBackend::new(
                    settings.say_binary.clone(),
                    settings.stream_buffer_chunks,
                )),
                "espeak" => Arc::new(EspeakBackend::new(
                    settings.espeak_binary.clone(),
                    settings.stream_buffer_chunks,
                )),
                other => {
                    warn!(backend = other, "ignoring unknown backend");
                    continue;
                }
            };
            registry = registry.with_backend(backend);
        }
        Ok(registry)
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn backends(&self) -> &[Arc<dyn SpeechBackend>] {
        &self.backends
    }

    /// First backend, in order, that knows `name`. Backends after the match
    /// are never asked, so their catalogs stay unloaded.
    pub async fn find(&self, ctx: &CallContext, name: &str) -> Result<Voice> {
        let filter = VoiceFilter::Name(name.to_string());
        for backend in &self.backends {
            match backend.list_voices(ctx, &filter).await {
                Ok(mut found) => {
                    if let Some(descriptor) = found.pop() {
                        debug!(backend = backend.id(), voice = name, "voice found");
                        return Ok(self.bind(backend, descriptor));
                    }
                }
                Err(VoiceError::NotFound(_)) => {}
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => warn!(backend = backend.id(), error = %err, "voice lookup failed"),
            }
        }
        Err(VoiceError::NotFound(name.to_string()))
    }

    /// Voices of every backend matching `filter`. A backend that cannot
    /// enumerate is logged and left out.
    pub async fn list(&self, ctx: &CallContext, filter: &VoiceFilter) -> Result<Vec<Voice>> {
        let mut voices = Vec::new();
        for backend in &self.backends {
            match backend.list_voices(ctx, filter).await {
                Ok(found) => voices.extend(found.into_iter().map(|d| self.bind(backend, d))),
                Err(VoiceError::NotFound(_)) => {}
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => warn!(backend = backend.id(), error = %err, "voice listing failed"),
            }
        }
        Ok(voices)
    }

    fn bind(&self, backend: &Arc<dyn SpeechBackend>, descriptor: VoiceDescriptor) -> Voice {
        Voice::new(
            backend.clone(),
            descriptor,
            self.cache.clone(),
            self.output.clone(),
        )
    }
}
