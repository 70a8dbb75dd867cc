use super::{fresh_audio_path, hash_credentials, schedule_cleanup, ProviderVoice, RateGate, SynthResult, TtsProvider, VoiceListCache};
use crate::errors::DispatchError;
use crate::models::{ProviderTag, TtsJob};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const GENERATE_URL: &str = "https://api.console.tts.monster/generate";
const VOICES_URL: &str = "https://api.console.tts.monster/voices";
const MIN_INTERVAL: Duration = Duration::from_secs(2);
const MIN_VALID_BYTES: usize = 100;

pub struct MonsterProvider {
    api_key: String,
    client: reqwest::Client,
    gate: RateGate,
    cache: VoiceListCache,
}

#[derive(Deserialize)]
struct GenerateResponse {
    url: String,
}

#[derive(Deserialize)]
struct VoicesResponse {
    voices: Vec<MonsterVoiceEntry>,
}

#[derive(Deserialize)]
struct MonsterVoiceEntry {
    voice_id: String,
    name: String,
}

impl MonsterProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            gate: RateGate::new(MIN_INTERVAL),
            cache: VoiceListCache::new(),
        }
    }

    fn credentials_hash(&self) -> String {
        hash_credentials(&[&self.api_key])
    }
}

#[async_trait]
impl TtsProvider for MonsterProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Monster
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
            .post(VOICES_URL)
            .header("Authorization", &self.api_key)
            .send()
            .await
            .map_err(|e| DispatchError::ProviderNetwork {
                provider: "monster".to_string(),
                source: e.into(),
            })?;

        if !resp.status().is_success() {
            return Err(DispatchError::ProviderFatal {
                provider: "monster".to_string(),
                message: format!("voice list returned status {}", resp.status()),
            });
        }

        let body: VoicesResponse = resp.json().await.map_err(|e| DispatchError::ProviderFatal {
            provider: "monster".to_string(),
            message: format!("malformed voice list response: {}", e),
        })?;

        let voices: Vec<ProviderVoice> = body
            .voices
            .into_iter()
            .map(|v| ProviderVoice {
                provider_voice_ref: v.voice_id,
                display_name: v.name,
            })
            .collect();

        self.cache.store(hash, voices.clone());
        Ok(voices)
    }

    async fn synth(&self, job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
        if !self.gate.try_acquire() {
            return Err(DispatchError::RateLimited {
                provider: "monster".to_string(),
            });
        }

        let resp = self
            .client
            .post(GENERATE_URL)
            .header("Authorization", &self.api_key)
            .json(&serde_json::json!({
                "voice_id": job.chosen_voice.provider_voice_ref,
                "message": job.text,
            }))
            .send()
            .await
            .map_err(|e| DispatchError::ProviderNetwork {
                provider: "monster".to_string(),
                source: e.into(),
            })?;

        if !resp.status().is_success() {
            return Err(DispatchError::ProviderFatal {
                provider: "monster".to_string(),
                message: format!("generate returned status {}", resp.status()),
            });
        }

        let body: GenerateResponse = resp.json().await.map_err(|e| DispatchError::ProviderFatal {
            provider: "monster".to_string(),
            message: format!("malformed generate response: {}", e),
        })?;

        let audio_bytes = self
            .client
            .get(&body.url)
            .send()
            .await
            .map_err(|e| DispatchError::ProviderNetwork {
                provider: "monster".to_string(),
                source: e.into(),
            })?
            .bytes()
            .await
            .map_err(|e| DispatchError::ProviderNetwork {
                provider: "monster".to_string(),
                source: e.into(),
            })?;

        if audio_bytes.len() < MIN_VALID_BYTES {
            return Err(DispatchError::ProviderFatal {
                provider: "monster".to_string(),
                message: format!("downloaded audio too small ({} bytes)", audio_bytes.len()),
            });
        }

        let out_path = fresh_audio_path(audio_dir, job.audio_format);
        tokio::fs::write(&out_path, &audio_bytes).await.map_err(|e| DispatchError::ProviderFatal {
            provider: "monster".to_string(),
            message: format!("failed writing audio file: {}", e),
        })?;
        schedule_cleanup(out_path.clone());

        Ok(SynthResult {
            file_path: out_path,
            duration_secs: None,
        })
    }
}
