use super::{AudioSource, SpeechBackend, VoiceCatalog, VoiceDescriptor, VoiceFilter};
use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use crate::exec::run_tool;
use crate::stream::AudioStream;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::process::Command;

/// macOS `say`. Voices come from `say -v ?`, audio is rendered to a temporary
/// AIFF file and then streamed from disk.
pub struct MacSayBackend {
    binary: String,
    stream_buffer_chunks: usize,
    catalog: VoiceCatalog,
}

impl MacSayBackend {
    pub fn new(binary: impl Into<String>, stream_buffer_chunks: usize) -> Self {
        Self {
            binary: binary.into(),
            stream_buffer_chunks,
            catalog: VoiceCatalog::new("say"),
        }
    }

    async fn enumerate(&self, ctx: &CallContext) -> Result<Vec<VoiceDescriptor>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-v", "?"]);
        let output = run_tool(ctx, cmd, |reason| VoiceError::EnumerationFailed {
            backend: "say",
            reason,
        })
        .await?;
        Ok(parse_voice_table(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses lines like `Alex                en_US    # Most people recognize me by my voice.`
/// Names may contain spaces (`Bad News`, `Eddy (English (US))`); the locale is
/// the last token before the `#`.
pub fn parse_voice_table(table: &str) -> Vec<VoiceDescriptor> {
    table
        .lines()
        .filter_map(|line| {
            let (head, sample) = match line.split_once('#') {
                Some((head, sample)) => (head, sample.trim()),
                None => (line, ""),
            };
            let head = head.trim();
            let (name, locale) = head.rsplit_once(char::is_whitespace)?;
            let name = name.trim();
            if name.is_empty() || locale.is_empty() {
                return None;
            }
            let mut metadata = BTreeMap::new();
            metadata.insert("Locale".to_string(), locale.to_string());
            Some(VoiceDescriptor {
                internal_name: name.to_string(),
                display_name: name.to_string(),
                language: locale.replace('_', "-"),
                detail: sample.to_string(),
                metadata,
            })
        })
        .collect()
}

#[async_trait]
impl AudioSource for MacSayBackend {
    async fn open_stream(
        &self,
        ctx: &CallContext,
        voice: &VoiceDescriptor,
        text: &str,
    ) -> Result<AudioStream> {
        let text_file = tempfile::Builder::new()
            .prefix("speechd-voices-")
            .suffix(".txt")
            .tempfile()?
            .into_temp_path();
        tokio::fs::write(&text_file, text).await?;

        let audio_file = tempfile::Builder::new()
            .prefix("speechd-voices-")
            .suffix(".aiff")
            .tempfile()?
            .into_temp_path();

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-v")
            .arg(&voice.internal_name)
            .arg("-o")
            .arg(&*audio_file)
            .arg("-f")
            .arg(&*text_file);
        run_tool(ctx, cmd, VoiceError::StreamFailed).await?;

        let file = tokio::fs::File::open(&audio_file).await?;
        Ok(AudioStream::from_reader(
            ctx,
            file,
            audio_file,
            self.stream_buffer_chunks,
        ))
    }
}

#[async_trait]
impl SpeechBackend for MacSayBackend {
    fn id(&self) -> &'static str {
        "say"
    }

    async fn list_voices(
        &self,
        ctx: &CallContext,
        filter: &VoiceFilter,
    ) -> Result<Vec<VoiceDescriptor>> {
        self.catalog.list(ctx, filter, || self.enumerate(ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
Alex                en_US    # Most people recognize me by my voice.
Bad News            en_US    # The light you see at the end of the tunnel is the headlamp.
Eddy (English (US)) en_US    # Hello! My name is Eddy.
Ting-Ting           zh_CN    # 你好，我叫婷婷。

";

    #[test]
    fn test_parse_voice_table() {
        let voices = parse_voice_table(TABLE);
        assert_eq!(voices.len(), 4);
        assert_eq!(voices[0].display_name, "Alex");
        assert_eq!(voices[0].language, "en-US");
        assert_eq!(voices[1].display_name, "Bad News");
        assert_eq!(voices[2].display_name, "Eddy (English (US))");
        assert_eq!(voices[3].language, "zh-CN");
        assert_eq!(voices[3].detail, "你好，我叫婷婷。");
    }

    #[test]
    fn test_garbage_lines_are_ignored() {
        assert!(parse_voice_table("\n   \nlonely\n").is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_enumeration() {
        let backend = MacSayBackend::new("no-such-say-binary-4711", 4);
        let err = backend
            .list_voices(&CallContext::new(), &VoiceFilter::All)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::EnumerationFailed { backend: "say", .. }));
    }

    #[tokio::test]
    async fn test_cancelled_listing_runs_nothing() {
        let backend = MacSayBackend::new("no-such-say-binary-4711", 4);
        let ctx = CallContext::new();
        ctx.cancel();
        let err = backend
            .list_voices(&ctx, &VoiceFilter::All)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Cancelled));
        assert!(!backend.catalog.is_loaded());
    }
}
