use super::edge::FALLBACK_VOICE_REF;
use super::{ProviderVoice, SynthResult, TtsProvider};
use crate::errors::DispatchError;
use crate::models::{AudioFormat, ProviderTag, TtsJob, Voice};
use crate::voice_registry::VoiceRegistry;
use std::collections::HashMap;
use std::sync::Arc;

/// Picks a concrete provider based on the chosen voice's `providerTag`. On
/// `RateLimited`/`ProviderNetworkError`/`ProviderFatalError`, retries once on a
/// newly-picked random voice's provider; the ultimate fallback is Edge with a
/// hardcoded voice. This is a coordinator over the provider sum type, not a
/// subtype of any one of them.
pub struct HybridProvider {
    providers: HashMap<ProviderTag, Arc<dyn TtsProvider>>,
    registry: Arc<VoiceRegistry>,
}

impl HybridProvider {
    pub fn new(providers: HashMap<ProviderTag, Arc<dyn TtsProvider>>, registry: Arc<VoiceRegistry>) -> Self {
        Self { providers, registry }
    }

    pub async fn list_voices(&self, tag: ProviderTag, use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError> {
        let provider = self
            .providers
            .get(&tag)
            .ok_or_else(|| DispatchError::Config(format!("no provider configured for {}", tag)))?;
        provider.list_voices(use_cache).await
    }

    pub async fn synth(&self, job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
        match self.try_provider(job.chosen_voice.provider_tag, job, audio_dir).await {
            Ok(result) => Ok(result),
            Err(e) if e.triggers_fallback() => {
                log::warn!(
                    "primary synth for voice {} via {} failed ({}), falling back",
                    job.chosen_voice.id,
                    job.chosen_voice.provider_tag,
                    e
                );
                self.fallback(job, audio_dir).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_provider(
        &self,
        tag: ProviderTag,
        job: &TtsJob,
        audio_dir: &std::path::Path,
    ) -> Result<SynthResult, DispatchError> {
        let provider = self
            .providers
            .get(&tag)
            .ok_or_else(|| DispatchError::Config(format!("no provider configured for {}", tag)))?;
        provider.synth(job, audio_dir).await
    }

    async fn fallback(&self, job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
        if let Some(fallback_voice) = self.registry.pick_random_excluding(&job.chosen_voice.id) {
            let fallback_job = TtsJob {
                chosen_voice: fallback_voice.clone(),
                ..job.clone()
            };
            match self.try_provider(fallback_voice.provider_tag, &fallback_job, audio_dir).await {
                Ok(result) => {
                    self.registry.record_fallback(&fallback_voice.display_name, fallback_voice.provider_tag);
                    return Ok(result);
                }
                Err(e) => {
                    log::warn!("fallback voice {} also failed ({}), trying ultimate fallback", fallback_voice.id, e);
                }
            }
        }

        self.ultimate_fallback(job, audio_dir).await
    }

    async fn ultimate_fallback(&self, job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
        let edge = self
            .providers
            .get(&ProviderTag::Edge)
            .ok_or_else(|| DispatchError::Config("no edge provider configured for ultimate fallback".to_string()))?;

        let ultimate_voice = Voice {
            id: "ultimate-fallback".to_string(),
            display_name: "Ava (fallback)".to_string(),
            provider_tag: ProviderTag::Edge,
            provider_voice_ref: FALLBACK_VOICE_REF.to_string(),
            enabled: true,
            avatar_refs: vec![],
        };
        let ultimate_job = TtsJob {
            chosen_voice: ultimate_voice.clone(),
            audio_format: AudioFormat::Mp3,
            ..job.clone()
        };

        let result = edge.synth(&ultimate_job, audio_dir).await?;
        self.registry.record_fallback(&ultimate_voice.display_name, ProviderTag::Edge);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysFails(ProviderTag);

    #[async_trait]
    impl TtsProvider for AlwaysFails {
        fn tag(&self) -> ProviderTag {
            self.0
        }
        async fn list_voices(&self, _use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError> {
            Ok(vec![])
        }
        async fn synth(&self, _job: &TtsJob, _audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
            Err(DispatchError::RateLimited { provider: "monster".to_string() })
        }
    }

    struct CountingSucceeds(ProviderTag, Arc<AtomicUsize>);

    #[async_trait]
    impl TtsProvider for CountingSucceeds {
        fn tag(&self) -> ProviderTag {
            self.0
        }
        async fn list_voices(&self, _use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError> {
            Ok(vec![])
        }
        async fn synth(&self, _job: &TtsJob, audio_dir: &std::path::Path) -> Result<SynthResult, DispatchError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(SynthResult {
                file_path: audio_dir.join("test.mp3"),
                duration_secs: Some(1.0),
            })
        }
    }

    fn voice(id: &str, tag: ProviderTag) -> Voice {
        Voice {
            id: id.to_string(),
            display_name: id.to_string(),
            provider_tag: tag,
            provider_voice_ref: format!("ref-{id}"),
            enabled: true,
            avatar_refs: vec![],
        }
    }

    #[tokio::test]
    async fn falls_back_to_random_voice_on_rate_limit() {
        let monster_voice = voice("m1", ProviderTag::Monster);
        let edge_voice = voice("e1", ProviderTag::Edge);
        let registry = Arc::new(VoiceRegistry::new(
            vec![monster_voice.clone(), edge_voice.clone()],
            HashMap::new(),
        ));

        let succeed_count = Arc::new(AtomicUsize::new(0));
        let mut providers: HashMap<ProviderTag, Arc<dyn TtsProvider>> = HashMap::new();
        providers.insert(ProviderTag::Monster, Arc::new(AlwaysFails(ProviderTag::Monster)));
        providers.insert(
            ProviderTag::Edge,
            Arc::new(CountingSucceeds(ProviderTag::Edge, succeed_count.clone())),
        );

        let hybrid = HybridProvider::new(providers, registry);
        let job = TtsJob {
            job_id: uuid::Uuid::new_v4(),
            user: "alice".to_string(),
            text: "hi".to_string(),
            event_type: "chat".to_string(),
            chosen_voice: monster_voice,
            audio_format: AudioFormat::Mp3,
        };

        let result = hybrid.synth(&job, std::path::Path::new("/tmp")).await;
        assert!(result.is_ok());
        assert_eq!(succeed_count.load(Ordering::SeqCst), 1);
    }
}
