use super::{fresh_audio_path, hash_credentials, schedule_cleanup, ProviderVoice, SynthResult, TtsProvider, VoiceListCache};
use crate::errors::DispatchError;
use crate::models::{ProviderTag, TtsJob};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;

const SYNTHESIZE_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";
const VOICES_URL: &str = "https://texttospeech.googleapis.com/v1/voices";

/// Preview/limited-availability voice families excluded from the usable catalogue,
/// matched as a case-insensitive substring of the voice name.
const EXCLUDED_NAME_TOKENS: &[&str] = &[
    "journey", "chirp", "alnilam", "vega", "altair", "bellatrix", "rigel", "sirius", "procyon",
    "capella", "arcturus", "aldebaran", "iapetus", "titan", "rhea", "dione", "tethys", "enceladus",
    "mimas", "hyperion", "phoebe",
];

pub struct GoogleProvider {
    api_key: String,
    client: reqwest::Client,
    cache: VoiceListCache,
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    #[serde(rename = "audioContent")]
    audio_content: String,
}

#[derive(Deserialize)]
struct VoicesResponse {
    voices: Vec<GoogleVoiceEntry>,
}

#[derive(Deserialize)]
struct GoogleVoiceEntry {
    name: String,
    #[serde(rename = "languageCodes")]
    language_codes: Vec<String>,
}

impl GoogleProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            cache: VoiceListCache::new(),
        }
    }

    fn credentials_hash(&self) -> String {
        hash_credentials(&[&self.api_key])
    }
}

#[async_trait]
impl TtsProvider for GoogleProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Google
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
            .get(VOICES_URL)
            .header("X-Goog-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| DispatchError::ProviderNetwork {
                provider: "google".to_string(),
                source: e.into(),
            })?;

        if !resp.status().is_success() {
            return Err(DispatchError::ProviderFatal {
                provider: "google".to_string(),
                message: format!("voice list returned status {}", resp.status()),
            });
        }

        let body: VoicesResponse = resp.json().await.map_err(|e| DispatchError::ProviderFatal {
            provider: "google".to_string(),
            message: format!("malformed voice list response: {}", e),
        })?;

        let voices: Vec<ProviderVoice> = body
            .voices
            .into_iter()
            .filter(|v| v.name.starts_with("en-") && v.language_codes.iter().any(|c| c.starts_with("en-")))
            .filter(|v| {
                let lower = v.name.to_lowercase();
                !EXCLUDED_NAME_TOKENS.iter().any(|token| lower.contains(token))
            })
            .map(|v| ProviderVoice {
                provider_voice_ref: v.name.clone(),
                display_name: v.name,
            })
            .collect();

        self.cache.store(hash, voices.clone());
        Ok(voices)
    }

    async fn synth(&self, job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
        let language_code = job
            .chosen_voice
            .provider_voice_ref
            .split('-')
            .take(2)
            .collect::<Vec<_>>()
            .join("-");

        let resp = self
            .client
            .post(SYNTHESIZE_URL)
            .header("X-Goog-Api-Key", &self.api_key)
            .json(&serde_json::json!({
                "input": { "text": job.text },
                "voice": { "languageCode": language_code, "name": job.chosen_voice.provider_voice_ref },
                "audioConfig": { "audioEncoding": audio_encoding(job.audio_format) },
            }))
            .send()
            .await
            .map_err(|e| DispatchError::ProviderNetwork {
                provider: "google".to_string(),
                source: e.into(),
            })?;

        if !resp.status().is_success() {
            return Err(DispatchError::ProviderFatal {
                provider: "google".to_string(),
                message: format!("synthesize returned status {}", resp.status()),
            });
        }

        let body: SynthesizeResponse = resp.json().await.map_err(|e| DispatchError::ProviderFatal {
            provider: "google".to_string(),
            message: format!("malformed synthesize response: {}", e),
        })?;

        let audio_bytes = base64::engine::general_purpose::STANDARD
            .decode(body.audio_content)
            .map_err(|e| DispatchError::ProviderFatal {
                provider: "google".to_string(),
                message: format!("invalid base64 audio content: {}", e),
            })?;

        let out_path = fresh_audio_path(audio_dir, job.audio_format);
        tokio::fs::write(&out_path, &audio_bytes).await.map_err(|e| DispatchError::ProviderFatal {
            provider: "google".to_string(),
            message: format!("failed writing audio file: {}", e),
        })?;
        schedule_cleanup(out_path.clone());

        Ok(SynthResult {
            file_path: out_path,
            duration_secs: None,
        })
    }
}

fn audio_encoding(format: crate::models::AudioFormat) -> &'static str {
    match format {
        crate::models::AudioFormat::Mp3 => "MP3",
        crate::models::AudioFormat::Wav => "LINEAR16",
    }
}
