use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use crate::exec::run_tool;
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, Sink};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Plays a finished audio file, returning once playback has ended.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play_file(&self, ctx: &CallContext, path: &Path) -> Result<()>;
}

/// In-process playback on the default output device.
///
/// The device stream is not `Send`, so each file is played on a blocking
/// worker that owns the stream for the duration of the clip.
#[derive(Debug, Clone, Copy, Default)]
pub struct RodioOutput;

#[async_trait]
impl AudioOutput for RodioOutput {
    async fn play_file(&self, ctx: &CallContext, path: &Path) -> Result<()> {
        ctx.check()?;
        let path = path.to_path_buf();
        let token = ctx.token().clone();
        let deadline = ctx.deadline();
        debug!(path = %path.display(), "playing");

        let played = tokio::task::spawn_blocking(move || -> Result<bool> {
            let (_stream, handle) = OutputStream::try_default()
                .map_err(|e| VoiceError::PlaybackFailed(format!("no audio output device: {e}")))?;
            let sink =
                Sink::try_new(&handle).map_err(|e| VoiceError::PlaybackFailed(e.to_string()))?;
            let source = Decoder::new(BufReader::new(File::open(&path)?))
                .map_err(|e| VoiceError::PlaybackFailed(format!("{}: {e}", path.display())))?;
            sink.append(source);

            while !sink.empty() {
                let expired = deadline.is_some_and(|d| tokio::time::Instant::now() >= d);
                if token.is_cancelled() || expired {
                    sink.stop();
                    return Ok(false);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Ok(true)
        })
        .await
        .map_err(|e| VoiceError::PlaybackFailed(e.to_string()))??;

        if played {
            Ok(())
        } else {
            // stopped early; report which signal did it
            ctx.check()?;
            Err(VoiceError::Cancelled)
        }
    }
}

/// Hands the file to an external player such as `ffplay`.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    binary: PathBuf,
}

impl CommandOutput {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        if self.binary.file_stem().is_some_and(|stem| stem == "ffplay") {
            cmd.args(["-nodisp", "-autoexit", "-loglevel", "error"]);
        }
        cmd.arg(path);
        cmd
    }
}

#[async_trait]
impl AudioOutput for CommandOutput {
    async fn play_file(&self, ctx: &CallContext, path: &Path) -> Result<()> {
        debug!(path = %path.display(), player = %self.binary.display(), "playing");
        run_tool(ctx, self.command(path), VoiceError::PlaybackFailed).await?;
        Ok(())
    }
}
