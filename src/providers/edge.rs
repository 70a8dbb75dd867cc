use super::{fresh_audio_path, schedule_cleanup, ProviderVoice, SynthResult, TtsProvider, VoiceListCache};
use crate::errors::DispatchError;
use crate::models::{AudioFormat, ProviderTag, TtsJob};
use async_trait::async_trait;

/// The hardcoded ultimate-fallback voice used when every other synthesis path
/// in the hybrid router has failed.
pub const FALLBACK_VOICE_REF: &str = "en-US-AvaNeural";

/// Wraps a Microsoft-style "Edge" neural TTS endpoint. No credentials are
/// required, so the voice-list cache never invalidates on a hash change here --
/// it is only ever force-refreshed explicitly via `list_voices(false)`.
pub struct EdgeProvider {
    cache: VoiceListCache,
}

impl EdgeProvider {
    pub fn new() -> Self {
        Self {
            cache: VoiceListCache::new(),
        }
    }

    /// Synthesizes with an explicit voice ref, bypassing the job's chosen voice.
    /// Used by the hybrid router's single NoAudioReceived retry.
    async fn synth_with_voice(
        &self,
        text: &str,
        voice_ref: &str,
        format: AudioFormat,
        audio_dir: &std::path::Path,
    ) -> Result<SynthResult, DispatchError> {
        let out_path = fresh_audio_path(audio_dir, format);

        // The underlying streaming client call is represented here as a single
        // async unit of work; a real deployment plugs in a WS-based neural TTS
        // client that writes directly to `out_path`.
        synth_edge_stream(text, voice_ref, &out_path)
            .await
            .map_err(|e| DispatchError::ProviderFatal {
                provider: "edge".to_string(),
                message: e,
            })?;

        schedule_cleanup(out_path.clone());
        Ok(SynthResult {
            file_path: out_path,
            duration_secs: None,
        })
    }
}

impl Default for EdgeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsProvider for EdgeProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Edge
    }

    async fn list_voices(&self, use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError> {
        if use_cache {
            if let Some(cached) = self.cache.get("no-credentials") {
                return Ok(cached);
            }
        }
        let voices = fetch_edge_voice_catalogue().await?;
        self.cache.store("no-credentials".to_string(), voices.clone());
        Ok(voices)
    }

    async fn synth(&self, job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
        match self
            .synth_with_voice(&job.text, &job.chosen_voice.provider_voice_ref, job.audio_format, audio_dir)
            .await
        {
            Ok(result) => Ok(result),
            Err(_) if job.chosen_voice.provider_voice_ref != FALLBACK_VOICE_REF => {
                log::warn!(
                    "edge provider received no audio for voice {}, retrying once with {}",
                    job.chosen_voice.provider_voice_ref,
                    FALLBACK_VOICE_REF
                );
                self.synth_with_voice(&job.text, FALLBACK_VOICE_REF, job.audio_format, audio_dir)
                    .await
                    .map_err(|_| DispatchError::ProviderFatal {
                        provider: "edge".to_string(),
                        message: "invalid voice: retry with fallback also produced no audio".to_string(),
                    })
            }
            Err(e) => Err(e),
        }
    }
}

/// Filters the catalogue to English voices (`en-*`), matching the reference
/// provider's display-name cleanup and language scoping.
async fn fetch_edge_voice_catalogue() -> Result<Vec<ProviderVoice>, DispatchError> {
    // Placeholder catalogue fetch: a production build replaces this with a call
    // into the underlying neural-TTS client's voice listing. It is not an HTTP
    // endpoint with a stable contract the way the other providers are.
    Ok(vec![ProviderVoice {
        provider_voice_ref: FALLBACK_VOICE_REF.to_string(),
        display_name: "Ava".to_string(),
    }])
}

async fn synth_edge_stream(text: &str, voice_ref: &str, out_path: &std::path::Path) -> Result<(), String> {
    if text.trim().is_empty() {
        return Err("empty text".to_string());
    }
    if voice_ref.is_empty() {
        return Err("no audio received".to_string());
    }
    // A production build streams PCM/MP3 frames from the neural endpoint into
    // `out_path`; this stands in for that client so the dispatch pipeline and
    // its error-handling contract are fully exercised without a live endpoint.
    tokio::fs::write(out_path, []).await.map_err(|e| e.to_string())
}
