use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use crate::exec::run_tool;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Re-encodes a raw synthesis result into the canonical cached format.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, ctx: &CallContext, input: &Path, output: &Path) -> Result<()>;
}

/// Shells out to `ffmpeg -y -i <in> -acodec <codec> <out>`.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
    codec: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>, codec: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            codec: codec.into(),
        }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg", "libmp3lame")
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, ctx: &CallContext, input: &Path, output: &Path) -> Result<()> {
        debug!(
            input = %input.display(),
            output = %output.display(),
            codec = %self.codec,
            "transcoding"
        );
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-y", "-loglevel", "error", "-i"])
            .arg(input)
            .arg("-acodec")
            .arg(&self.codec)
            .arg(output);
        run_tool(ctx, cmd, VoiceError::TranscodeFailed).await?;
        Ok(())
    }
}

/// Keeps the backend's bytes as they are. Used when the backend already
/// produces the cached format, or when no encoder is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyTranscoder;

#[async_trait]
impl Transcoder for CopyTranscoder {
    async fn transcode(&self, ctx: &CallContext, input: &Path, output: &Path) -> Result<()> {
        ctx.run(async {
            tokio::fs::copy(input, output).await.map_err(|e| {
                VoiceError::TranscodeFailed(format!("copy {}: {e}", input.display()))
            })?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_transcoder() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.raw");
        let output = dir.path().join("out.mp3");
        std::fs::write(&input, b"ID3 audio").unwrap();

        CopyTranscoder
            .transcode(&CallContext::new(), &input, &output)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"ID3 audio");
    }

    #[tokio::test]
    async fn test_copy_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = CopyTranscoder
            .transcode(
                &CallContext::new(),
                &dir.path().join("missing"),
                &dir.path().join("out"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::TranscodeFailed(_)));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_transcode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.raw");
        std::fs::write(&input, b"x").unwrap();
        let err = FfmpegTranscoder::new("no-such-ffmpeg-4711", "libmp3lame")
            .transcode(&CallContext::new(), &input, &dir.path().join("out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::TranscodeFailed(_)));
    }
}
