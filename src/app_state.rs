use std::collections::HashMap;
use std::sync::Arc;

use crate::audio_filters::AudioFilterProcessor;
use crate::avatar_slots::AvatarSlotManager;
use crate::broadcast_hub::BroadcastHub;
use crate::config::AppSettings;
use crate::models::ProviderTag;
use crate::orchestrator::{DispatchOrchestrator, OrchestratorConfig};
use crate::providers::{HybridProvider, TtsProvider};
use crate::providers::edge::EdgeProvider;
use crate::providers::google::GoogleProvider;
use crate::providers::monster::MonsterProvider;
use crate::providers::polly::PollyProvider;
use crate::queue_manager::QueueManager;
use crate::rate_limiter::RateLimiter;
use crate::voice_registry::VoiceRegistry;

/// Everything the REST/WS surface and the chat ingress loop need a handle to.
/// Built once at startup from `AppSettings` and shared behind an `Arc`.
pub struct AppState {
    pub orchestrator: Arc<DispatchOrchestrator>,
    pub broadcast: Arc<BroadcastHub>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wires up every dispatch component from loaded settings. The Edge provider
    /// is always registered since it is the hybrid router's ultimate fallback;
    /// the other three are only registered when their credentials are present.
    pub async fn build(settings: &AppSettings) -> anyhow::Result<Arc<AppState>> {
        tokio::fs::create_dir_all(&settings.audio_dir).await?;

        let rate_limiter = Arc::new(RateLimiter::default());
        let voices = Arc::new(VoiceRegistry::new(settings.voices.clone(), settings.special_voices.clone()));
        let slots = Arc::new(AvatarSlotManager::new(settings.avatar_slots.clone()));
        let queues = Arc::new(QueueManager::new());
        let broadcast = Arc::new(BroadcastHub::new());

        let mut providers: HashMap<ProviderTag, Arc<dyn TtsProvider>> = HashMap::new();
        providers.insert(ProviderTag::Edge, Arc::new(EdgeProvider::new()));

        if let Some(api_key) = settings.tts.monster_api_key.clone() {
            providers.insert(ProviderTag::Monster, Arc::new(MonsterProvider::new(api_key)));
        }
        if let Some(api_key) = settings.tts.google_api_key.clone() {
            providers.insert(ProviderTag::Google, Arc::new(GoogleProvider::new(api_key)));
        }
        if let (Some(access_key), Some(secret_key)) =
            (settings.tts.polly_access_key.clone(), settings.tts.polly_secret_key.clone())
        {
            let region = settings.tts.polly_region.clone().unwrap_or_else(|| "us-east-1".to_string());
            let aws_config = aws_config::from_env()
                .region(aws_config::Region::new(region))
                .credentials_provider(aws_sdk_polly::config::Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    None,
                    None,
                    "chat-yapper-core",
                ))
                .load()
                .await;
            providers.insert(
                ProviderTag::Polly,
                Arc::new(PollyProvider::new(aws_sdk_polly::Client::new(&aws_config), access_key, secret_key)),
            );
        }

        let provider = Arc::new(HybridProvider::new(providers, Arc::clone(&voices)));
        let audio_filters = Arc::new(AudioFilterProcessor::detect().await);

        let orchestrator_config = OrchestratorConfig {
            parallel_message_limit: settings.parallel_message_limit,
            queue_overflow_messages: settings.queue_overflow_messages,
            ignore_if_user_speaking: settings.ignore_if_user_speaking,
            audio_dir: settings.audio_dir.clone(),
            audio_format: settings.audio_format,
            random_filters: settings.random_filters,
        };

        let orchestrator = Arc::new(DispatchOrchestrator::new(
            orchestrator_config,
            settings.message_filtering.clone(),
            Arc::clone(&rate_limiter),
            voices,
            slots,
            queues,
            provider,
            audio_filters,
            settings.audio_filters.clone(),
            Arc::clone(&broadcast),
        ));
        orchestrator.set_tts_enabled(settings.tts_enabled);

        Ok(Arc::new(AppState {
            orchestrator,
            broadcast,
            rate_limiter,
        }))
    }
}
