use super::{AudioSource, SpeechBackend, VoiceCatalog, VoiceDescriptor, VoiceFilter};
use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use crate::exec::run_tool;
use crate::stream::{audio_channel, pump_reader, AudioStream};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::warn;

pub struct EspeakBackend {
    binary: String,
    stream_buffer_chunks: usize,
    catalog: VoiceCatalog,
}

impl EspeakBackend {
    pub fn new(binary: impl Into<String>, stream_buffer_chunks: usize) -> Self {
        Self {
            binary: binary.into(),
            stream_buffer_chunks,
            catalog: VoiceCatalog::new("espeak"),
        }
    }

    async fn enumerate(&self, ctx: &CallContext) -> Result<Vec<VoiceDescriptor>> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--voices");
        let output = run_tool(ctx, cmd, |reason| VoiceError::EnumerationFailed {
            backend: "espeak",
            reason,
        })
        .await?;
        Ok(parse_voice_table(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses `espeak-ng --voices`:
///
/// ```text
/// Pty Language       Age/Gender VoiceName          File                 Other Languages
///  5  en-us           --/M      English_(America)  gmw/en-US            (en 3)
/// ```
pub fn parse_voice_table(table: &str) -> Vec<VoiceDescriptor> {
    table
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Pty"))
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let priority = cols.next()?;
            let language = cols.next()?;
            let age_gender = cols.next()?;
            let name = cols.next()?;
            let file = cols.next().unwrap_or_default();
            let others: Vec<&str> = cols.collect();

            let gender = age_gender.rsplit('/').next().unwrap_or_default();
            let mut metadata = BTreeMap::new();
            metadata.insert("Priority".to_string(), priority.to_string());
            metadata.insert("Gender".to_string(), gender.to_string());
            metadata.insert("File".to_string(), file.to_string());
            if !others.is_empty() {
                metadata.insert("OtherLanguages".to_string(), others.join(" "));
            }

            Some(VoiceDescriptor {
                internal_name: language.to_string(),
                display_name: name.to_string(),
                language: language.to_string(),
                detail: name.replace('_', " "),
                metadata,
            })
        })
        .collect()
}

#[async_trait]
impl AudioSource for EspeakBackend {
    async fn open_stream(
        &self,
        ctx: &CallContext,
        voice: &VoiceDescriptor,
        text: &str,
    ) -> Result<AudioStream> {
        ctx.check()?;
        let mut child = Command::new(&self.binary)
            .arg("--stdout")
            .arg("-v")
            .arg(&voice.internal_name)
            .arg("--stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::StreamFailed(format!("{}: {e}", self.binary)))?;

        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(VoiceError::StreamFailed("espeak-ng pipes unavailable".into()));
        };
        // drained alongside stdout so a chatty voice cannot fill the pipe
        let diagnostics = tokio::spawn(async move {
            let mut message = String::new();
            stderr.read_to_string(&mut message).await.map(|_| message)
        });

        let payload = text.to_owned();
        ctx.run(async move {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            // closing stdin tells espeak-ng the input is complete
            stdin.shutdown().await?;
            Ok(())
        })
        .await?;

        let (sink, stream) = audio_channel(self.stream_buffer_chunks);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            pump_reader(&ctx, stdout, sink.clone()).await;
            if sink.is_closed() || ctx.is_cancelled() {
                return;
            }
            match ctx.run(async { Ok(child.wait().await?) }).await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let message = match diagnostics.await {
                        Ok(Ok(message)) => message,
                        Ok(Err(err)) => {
                            warn!(error = %err, "could not read espeak-ng stderr");
                            String::new()
                        }
                        Err(err) => {
                            warn!(error = %err, "espeak-ng stderr reader died");
                            String::new()
                        }
                    };
                    warn!(%status, "espeak-ng failed");
                    sink.fail(VoiceError::StreamFailed(format!(
                        "espeak-ng exited with {status}: {}",
                        message.trim()
                    )))
                    .await;
                }
                Err(err) => sink.fail(err).await,
            }
        });
        Ok(stream)
    }
}

#[async_trait]
impl SpeechBackend for EspeakBackend {
    fn id(&self) -> &'static str {
        "espeak"
    }

    async fn list_voices(
        &self,
        ctx: &CallContext,
        filter: &VoiceFilter,
    ) -> Result<Vec<VoiceDescriptor>> {
        self.catalog.list(ctx, filter, || self.enumerate(ctx)).await
    }
}
