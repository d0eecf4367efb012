use super::{VoiceDescriptor, VoiceFilter};
use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Lazily enumerated, process-lifetime voice list for one backend.
///
/// The first successful enumeration is kept forever. Concurrent first callers
/// share a single enumeration; a failed enumeration is not kept, so the next
/// call tries again.
#[derive(Debug)]
pub struct VoiceCatalog {
    backend: &'static str,
    voices: OnceCell<Arc<[VoiceDescriptor]>>,
}

impl VoiceCatalog {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            voices: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.voices.initialized()
    }

    /// Returns the filtered list, running `enumerate` under `ctx` only if
    /// nothing is memoized yet. An interrupted enumeration is not kept.
    pub async fn list<F, Fut>(
        &self,
        ctx: &CallContext,
        filter: &VoiceFilter,
        enumerate: F,
    ) -> Result<Vec<VoiceDescriptor>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<VoiceDescriptor>>>,
    {
        ctx.check()?;
        let backend = self.backend;
        let voices = self
            .voices
            .get_or_try_init(|| async move {
                debug!(backend, "enumerating voices");
                let voices = ctx.run(enumerate()).await?;
                info!(backend, count = voices.len(), "voice catalog loaded");
                Ok::<_, VoiceError>(Arc::from(voices))
            })
            .await?;
        apply_filter(voices, filter)
    }
}

pub fn apply_filter(
    voices: &[VoiceDescriptor],
    filter: &VoiceFilter,
) -> Result<Vec<VoiceDescriptor>> {
    match filter {
        VoiceFilter::All => Ok(voices.to_vec()),
        VoiceFilter::Name(name) => voices
            .iter()
            .find(|v| &v.display_name == name)
            .or_else(|| voices.iter().find(|v| &v.internal_name == name))
            .map(|v| vec![v.clone()])
            .ok_or_else(|| VoiceError::NotFound(name.clone())),
        VoiceFilter::Language(language) => Ok(voices
            .iter()
            .filter(|v| &v.language == language)
            .cloned()
            .collect()),
    }
}
