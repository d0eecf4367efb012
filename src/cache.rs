//! On-disk audio cache.
//!
//! Entries live at `{root}/{backend}/{voice}/{md5(normalized text)}.{ext}`. An
//! entry counts only when the file exists and is non-empty. Writes go through
//! a raw temp file and a transcoded `.part` file; the final name appears only
//! once the transcoded file is complete.

use crate::backends::{AudioSource, VoiceDescriptor};
use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use crate::transcode::Transcoder;
use lazy_static::lazy_static;
use md5::{Digest, Md5};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("whitespace pattern");
}

/// Trims and collapses every whitespace run to a single space.
pub fn normalize(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Hex md5 of the normalized text.
pub fn cache_key(text: &str) -> String {
    hex::encode(Md5::digest(normalize(text).as_bytes()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Streams actually opened against a backend.
    pub syntheses: u64,
}

pub struct CacheStore {
    root: PathBuf,
    extension: String,
    transcoder: Arc<dyn Transcoder>,
    in_flight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    syntheses: AtomicU64,
}

impl CacheStore {
    pub fn new(
        root: impl Into<PathBuf>,
        extension: impl Into<String>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            transcoder,
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            syntheses: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Where `text` spoken by `voice` is (or would be) cached.
    pub fn entry_path(&self, backend_id: &str, voice: &VoiceDescriptor, text: &str) -> PathBuf {
        self.root
            .join(backend_id)
            .join(voice.cache_segment())
            .join(format!("{}.{}", cache_key(text), self.extension))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            syntheses: self.syntheses.load(Ordering::Relaxed),
        }
    }

    /// Returns the cached file for `text`, synthesizing it through `source` on a miss.
    ///
    /// A hit never touches `source`. Callers racing on the same entry share one
    /// synthesis. Any failure leaves nothing behind at the final path.
    pub async fn resolve<S>(
        &self,
        ctx: &CallContext,
        backend_id: &str,
        source: &S,
        voice: &VoiceDescriptor,
        text: &str,
    ) -> Result<PathBuf>
    where
        S: AudioSource + ?Sized,
    {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Err(VoiceError::EmptyResult);
        }
        ctx.check()?;

        let path = self.entry_path(backend_id, voice, &normalized);
        if is_valid(&path).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(path = %path.display(), "cache hit");
            return Ok(path);
        }

        let lock = self.key_lock(&path);
        let result = async {
            let _guard = ctx.run(async { Ok(lock.lock().await) }).await?;
            // whoever held the lock before us may have produced the entry
            if is_valid(&path).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), "cache hit after wait");
                return Ok(());
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(path = %path.display(), "cache miss");
            self.fill(ctx, source, voice, &normalized, &path).await
        }
        .await;
        self.release(&path, lock);

        match result {
            Ok(()) => Ok(path),
            Err(err) => {
                warn!(voice = %voice.display_name, error = %err, "synthesis failed");
                Err(err)
            }
        }
    }

    async fn fill<S>(
        &self,
        ctx: &CallContext,
        source: &S,
        voice: &VoiceDescriptor,
        text: &str,
        path: &Path,
    ) -> Result<()>
    where
        S: AudioSource + ?Sized,
    {
        let dir = path
            .parent()
            .ok_or_else(|| VoiceError::Io(std::io::Error::other("cache entry has no parent")))?;
        tokio::fs::create_dir_all(dir).await?;

        let key = cache_key(text);
        // both are unlinked on drop unless persisted
        let raw = TempPath::from_path(dir.join(format!("{key}.{}.tmp", self.extension)));
        let part = TempPath::from_path(dir.join(format!("{key}.part.{}", self.extension)));

        self.syntheses.fetch_add(1, Ordering::Relaxed);
        let mut stream = source.open_stream(ctx, voice, text).await?;

        let mut file = tokio::fs::File::create(&raw).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next_chunk().await? {
            ctx.run(async { Ok(file.write_all(&chunk).await?) }).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if written == 0 {
            return Err(VoiceError::EmptyResult);
        }
        debug!(bytes = written, "raw audio written");

        self.transcoder.transcode(ctx, &raw, &part).await?;
        if !is_valid(&part).await {
            return Err(VoiceError::TranscodeFailed(
                "transcoder produced no output".to_string(),
            ));
        }
        part.persist(path).map_err(|e| VoiceError::Io(e.error))?;
        info!(path = %path.display(), bytes = written, "cached");
        Ok(())
    }

    fn key_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.entry(path.to_path_buf()).or_default().clone()
    }

    fn release(&self, path: &Path, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one here: nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(path);
        }
    }
}

async fn is_valid(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::CopyTranscoder;
    use proptest::prelude::*;

    fn xiaoxiao() -> VoiceDescriptor {
        VoiceDescriptor {
            internal_name: "zh-CN-XiaoxiaoNeural".to_string(),
            display_name: "Xiaoxiao".to_string(),
            language: "zh-CN".to_string(),
            detail: String::new(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  hello \t\n world  "), "hello world");
        assert_eq!(normalize("Hello, (World)!"), "Hello, (World)!");
        assert_eq!(normalize(" \t "), "");
    }

    #[test]
    fn test_cache_key_is_md5_hex() {
        assert_eq!(cache_key("Hello world"), "3e25960a79dbc69b674cd4ec67a72c62");
        assert_eq!(cache_key("hello\tworld"), cache_key("hello world"));
        assert_ne!(cache_key("hello world"), cache_key("Hello world"));
    }

    #[test]
    fn test_entry_path_layout() {
        let store = CacheStore::new("/cache", "mp3", Arc::new(CopyTranscoder));
        let path = store.entry_path("bing", &xiaoxiao(), "Hello world");
        assert_eq!(
            path,
            PathBuf::from("/cache/bing/Xiaoxiao/3e25960a79dbc69b674cd4ec67a72c62.mp3")
        );
    }

    #[test]
    fn test_entry_path_is_voice_scoped() {
        let store = CacheStore::new("/cache", "mp3", Arc::new(CopyTranscoder));
        let mut other = xiaoxiao();
        other.display_name = "Yunxi".to_string();
        assert_ne!(
            store.entry_path("bing", &xiaoxiao(), "hi"),
            store.entry_path("bing", &other, "hi")
        );
    }

    #[tokio::test]
    async fn test_blank_text_is_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path(), "mp3", Arc::new(CopyTranscoder));
        struct Unreachable;
        #[async_trait::async_trait]
        impl AudioSource for Unreachable {
            async fn open_stream(
                &self,
                _ctx: &CallContext,
                _voice: &VoiceDescriptor,
                _text: &str,
            ) -> Result<crate::stream::AudioStream> {
                panic!("blank text must not reach the backend");
            }
        }
        let err = store
            .resolve(&CallContext::new(), "bing", &Unreachable, &xiaoxiao(), " \n\t ")
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::EmptyResult));
        assert_eq!(store.stats().syntheses, 0);
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(text in "[ \\ta-zA-Z0-9,.()\\n]{0,64}") {
            let once = normalize(&text);
            prop_assert_eq!(normalize(&once), once.clone());
            prop_assert_eq!(cache_key(&text), cache_key(&once));
        }

        #[test]
        fn prop_whitespace_runs_share_a_key(
            words in proptest::collection::vec("[a-z]{1,8}", 1..6),
            sep in "[ \\t\\n]{1,4}",
        ) {
            prop_assert_eq!(cache_key(&words.join(&sep)), cache_key(&words.join(" ")));
        }
    }
}
