pub(crate) mod edge;
pub(crate) mod google;
mod hybrid;
pub(crate) mod monster;
pub(crate) mod polly;

pub use hybrid::HybridProvider;

use crate::errors::DispatchError;
use crate::models::{AudioFormat, ProviderTag, TtsJob};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Result of a successful synthesis: the file written to `audio_dir` and, if the
/// provider can report it cheaply, the audio duration.
pub struct SynthResult {
    pub file_path: PathBuf,
    pub duration_secs: Option<f32>,
}

/// One enabled voice as listed by a provider's voice catalogue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderVoice {
    pub provider_voice_ref: String,
    pub display_name: String,
}

/// Common capability set every concrete TTS backend implements. The Hybrid
/// coordinator composes these rather than being a subtype of any of them.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn tag(&self) -> ProviderTag;

    async fn list_voices(&self, use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError>;

    async fn synth(&self, job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError>;
}

/// Per-provider pacing + voice-list cache state, shared by every concrete provider
/// that enforces a minimum interval between requests (MonsterTTS today).
pub struct RateGate {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Checks and, if allowed, immediately records the attempt under the same lock
    /// so pacing is enforced against wall-clock *send* time, not response time.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_request.lock().unwrap();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// (provider, credentialsHash) -> cached voice list. A cache entry is valid only
/// while the hash of the current credentials matches the hash stored with it.
pub struct VoiceListCache {
    inner: Mutex<Option<(String, Vec<ProviderVoice>)>>,
}

impl VoiceListCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn get(&self, credentials_hash: &str) -> Option<Vec<ProviderVoice>> {
        let guard = self.inner.lock().unwrap();
        match &*guard {
            Some((hash, list)) if hash == credentials_hash => Some(list.clone()),
            _ => None,
        }
    }

    pub fn store(&self, credentials_hash: String, list: Vec<ProviderVoice>) {
        *self.inner.lock().unwrap() = Some((credentials_hash, list));
    }
}

impl Default for VoiceListCache {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hash_credentials(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(":").as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn fresh_audio_path(audio_dir: &std::path::Path, format: AudioFormat) -> PathBuf {
    audio_dir.join(format!("{}.{}", uuid::Uuid::new_v4(), format.extension()))
}

/// Schedules deletion of `path` 30s from now; errors are logged, not propagated,
/// since a missed cleanup is not fatal to dispatch.
pub fn schedule_cleanup(path: PathBuf) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            log::debug!("cleanup of {} failed (already gone?): {}", path.display(), e);
        }
    });
}
