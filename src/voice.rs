use crate::backends::{SpeechBackend, VoiceDescriptor};
use crate::cache::CacheStore;
use crate::context::CallContext;
use crate::engine::AudioOutput;
use crate::error::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of [`Voice::speak_lines`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub spoken: usize,
    pub failed: usize,
    /// Blank lines, passed through without synthesis.
    pub skipped: usize,
}

/// A selected voice of one backend, bound to the shared cache and player.
#[derive(Clone)]
pub struct Voice {
    backend: Arc<dyn SpeechBackend>,
    descriptor: VoiceDescriptor,
    cache: Arc<CacheStore>,
    output: Arc<dyn AudioOutput>,
}

impl Voice {
    pub fn new(
        backend: Arc<dyn SpeechBackend>,
        descriptor: VoiceDescriptor,
        cache: Arc<CacheStore>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            backend,
            descriptor,
            cache,
            output,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.display_name
    }

    pub fn language(&self) -> &str {
        &self.descriptor.language
    }

    pub fn detail(&self) -> &str {
        &self.descriptor.detail
    }

    pub fn backend_id(&self) -> &'static str {
        self.backend.id()
    }

    pub fn descriptor(&self) -> &VoiceDescriptor {
        &self.descriptor
    }

    /// Path of the cached audio for `text`, synthesizing it on first use.
    pub async fn materialize(&self, ctx: &CallContext, text: &str) -> Result<PathBuf> {
        self.cache
            .resolve(
                ctx,
                self.backend.id(),
                self.backend.as_ref(),
                &self.descriptor,
                text,
            )
            .await
    }

    pub async fn speak(&self, ctx: &CallContext, text: &str) -> Result<()> {
        let path = self.materialize(ctx, text).await?;
        self.output.play_file(ctx, &path).await
    }

    /// Speaks `input` line by line. The next line is synthesized while the
    /// current one plays. Synthesis and playback of each line get their own
    /// `per_line` deadline; a line that fails or runs out of time is logged
    /// and the batch moves on. Only `ctx` itself ending stops the batch.
    pub async fn speak_lines<R>(
        &self,
        ctx: &CallContext,
        input: R,
        per_line: Option<Duration>,
    ) -> Result<BatchReport>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<(String, Option<Result<PathBuf>>)>(1);
        let prefetch = {
            let voice = self.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut lines = input.lines();
                loop {
                    let line = match ctx.run(async { Ok(lines.next_line().await?) }).await {
                        Ok(Some(line)) => line.trim().to_string(),
                        Ok(None) => return Ok(()),
                        Err(err) => return Err(err),
                    };
                    let resolved = if line.is_empty() {
                        None
                    } else {
                        let line_ctx = line_context(&ctx, per_line);
                        Some(voice.materialize(&line_ctx, &line).await)
                    };
                    if tx.send((line, resolved)).await.is_err() {
                        return Ok(());
                    }
                }
            })
        };

        let mut report = BatchReport::default();
        let mut index = 0;
        while let Some((text, resolved)) = rx.recv().await {
            index += 1;
            info!("{index}. {text}");
            let Some(resolved) = resolved else {
                report.skipped += 1;
                continue;
            };
            let played = match resolved {
                Ok(path) => {
                    let line_ctx = line_context(ctx, per_line);
                    self.output.play_file(&line_ctx, &path).await
                }
                Err(err) => Err(err),
            };
            match played {
                Ok(()) => report.spoken += 1,
                Err(err) => {
                    ctx.check()?;
                    warn!(line = index, error = %err, "failed to speak line");
                    report.failed += 1;
                }
            }
        }

        prefetch
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;
        Ok(report)
    }

    /// Exports the cached audio for `text` to `dest`.
    pub async fn save_to(&self, ctx: &CallContext, text: &str, dest: &Path) -> Result<()> {
        let path = self.materialize(ctx, text).await?;
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(dest).await? {
            tokio::fs::remove_file(dest).await?;
        }
        match tokio::fs::hard_link(&path, dest).await {
            Ok(()) => debug!(dest = %dest.display(), "linked"),
            Err(err) => {
                debug!(error = %err, "hard link failed, copying");
                ctx.run(async { Ok(tokio::fs::copy(&path, dest).await?) })
                    .await?;
            }
        }
        info!(dest = %dest.display(), "saved");
        Ok(())
    }
}

/// A fresh context for one line, bounded by `per_line` and by `ctx`.
fn line_context(ctx: &CallContext, per_line: Option<Duration>) -> CallContext {
    match per_line {
        Some(limit) => ctx.child().with_timeout(limit),
        None => ctx.child(),
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}): {}", self.name(), self.language(), self.detail())
    }
}

impl fmt::Debug for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Voice")
            .field("backend", &self.backend.id())
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
