use super::{fresh_audio_path, hash_credentials, schedule_cleanup, ProviderVoice, SynthResult, TtsProvider, VoiceListCache};
use crate::errors::DispatchError;
use crate::models::{AudioFormat, ProviderTag, TtsJob};
use async_trait::async_trait;
use aws_sdk_polly::types::{Engine, OutputFormat, VoiceId};
use aws_sdk_polly::Client;

/// Voices with neural-engine support in the subset this core targets; anything
/// else falls back to the standard engine.
const NEURAL_VOICE_IDS: &[&str] = &["Joanna", "Matthew", "Ruth", "Stephen"];

pub struct PollyProvider {
    client: Client,
    access_key: String,
    secret_key: String,
    cache: VoiceListCache,
}

impl PollyProvider {
    pub fn new(client: Client, access_key: String, secret_key: String) -> Self {
        Self {
            client,
            access_key,
            secret_key,
            cache: VoiceListCache::new(),
        }
    }

    fn credentials_hash(&self) -> String {
        hash_credentials(&[&self.access_key, &self.secret_key])
    }

    fn engine_for(voice_name: &str) -> Engine {
        if NEURAL_VOICE_IDS.contains(&voice_name) {
            Engine::Neural
        } else {
            Engine::Standard
        }
    }
}

#[async_trait]
impl TtsProvider for PollyProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Polly
    }

    async fn list_voices(&self, use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError> {
        let hash = self.credentials_hash();
        if use_cache {
            if let Some(cached) = self.cache.get(&hash) {
                return Ok(cached);
            }
        }

        let resp = self
            .client
            .describe_voices()
            .send()
            .await
            .map_err(|e| DispatchError::ProviderNetwork {
                provider: "polly".to_string(),
                source: anyhow::anyhow!(e.to_string()),
            })?;

        let voices: Vec<ProviderVoice> = resp
            .voices
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| {
                let id = v.id?.as_str().to_string();
                let name = v.name.unwrap_or_else(|| id.clone());
                Some(ProviderVoice {
                    provider_voice_ref: id,
                    display_name: name,
                })
            })
            .collect();

        self.cache.store(hash, voices.clone());
        Ok(voices)
    }

    async fn synth(&self, job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
        let voice_id = VoiceId::from(job.chosen_voice.provider_voice_ref.as_str());
        let engine = Self::engine_for(&job.chosen_voice.provider_voice_ref);
        // Polly has no native wav output; non-mp3 requests use ogg_vorbis instead.
        let output_format = match job.audio_format {
            AudioFormat::Mp3 => OutputFormat::Mp3,
            AudioFormat::Wav => OutputFormat::OggVorbis,
        };

        let resp = self
            .client
            .synthesize_speech()
            .text(&job.text)
            .voice_id(voice_id)
            .engine(engine)
            .output_format(output_format)
            .send()
            .await
            .map_err(|e| DispatchError::ProviderFatal {
                provider: "polly".to_string(),
                message: e.to_string(),
            })?;

        let bytes = resp
            .audio_stream
            .collect()
            .await
            .map_err(|e| DispatchError::ProviderFatal {
                provider: "polly".to_string(),
                message: format!("failed reading audio stream: {}", e),
            })?
            .into_bytes();

        let effective_format = match job.audio_format {
            AudioFormat::Mp3 => AudioFormat::Mp3,
            AudioFormat::Wav => AudioFormat::Wav,
        };
        let out_path = fresh_audio_path(audio_dir, effective_format);
        tokio::fs::write(&out_path, &bytes).await.map_err(|e| DispatchError::ProviderFatal {
            provider: "polly".to_string(),
            message: format!("failed writing audio file: {}", e),
        })?;
        schedule_cleanup(out_path.clone());

        Ok(SynthResult {
            file_path: out_path,
            duration_secs: None,
        })
    }
}
