//! Integration tests driving `DispatchOrchestrator` end to end through an
//! in-memory `BroadcastHub` (no real WebSocket clients, no real providers).

use async_trait::async_trait;
use chat_yapper_core::audio_filters::{AudioFilterConfig, AudioFilterProcessor};
use chat_yapper_core::avatar_slots::AvatarSlotManager;
use chat_yapper_core::broadcast_hub::BroadcastHub;
use chat_yapper_core::errors::DispatchError;
use chat_yapper_core::message_filter::MessageFilterConfig;
use chat_yapper_core::models::{AudioFormat, AvatarSlot, ChatEvent, ProviderTag, SourceTags, Voice};
use chat_yapper_core::orchestrator::{DispatchOrchestrator, OrchestratorConfig};
use chat_yapper_core::providers::{HybridProvider, ProviderVoice, SynthResult, TtsProvider};
use chat_yapper_core::queue_manager::QueueManager;
use chat_yapper_core::rate_limiter::RateLimiter;
use chat_yapper_core::voice_registry::VoiceRegistry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Always synthesizes successfully and immediately.
struct AlwaysSucceeds(ProviderTag);

#[async_trait]
impl TtsProvider for AlwaysSucceeds {
    fn tag(&self) -> ProviderTag {
        self.0
    }
    async fn list_voices(&self, _use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError> {
        Ok(vec![])
    }
    async fn synth(&self, _job: &chat_yapper_core::models::TtsJob, audio_dir: &Path) -> Result<SynthResult, DispatchError> {
        Ok(SynthResult {
            file_path: audio_dir.join("out.mp3"),
            duration_secs: Some(1.0),
        })
    }
}

/// Synthesizes successfully after an artificial delay, so a job can be
/// observed "in flight" by a concurrently fired moderation event.
struct SlowSucceeds(ProviderTag, Duration);

#[async_trait]
impl TtsProvider for SlowSucceeds {
    fn tag(&self) -> ProviderTag {
        self.0
    }
    async fn list_voices(&self, _use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError> {
        Ok(vec![])
    }
    async fn synth(&self, _job: &chat_yapper_core::models::TtsJob, audio_dir: &Path) -> Result<SynthResult, DispatchError> {
        tokio::time::sleep(self.1).await;
        Ok(SynthResult {
            file_path: audio_dir.join("out.mp3"),
            duration_secs: Some(1.0),
        })
    }
}

/// Succeeds on its first `fail_after` calls, then returns `RateLimited` forever.
struct FlakyAfter {
    tag: ProviderTag,
    calls: AtomicUsize,
    fail_after: usize,
}

#[async_trait]
impl TtsProvider for FlakyAfter {
    fn tag(&self) -> ProviderTag {
        self.tag
    }
    async fn list_voices(&self, _use_cache: bool) -> Result<Vec<ProviderVoice>, DispatchError> {
        Ok(vec![])
    }
    async fn synth(&self, _job: &chat_yapper_core::models::TtsJob, audio_dir: &Path) -> Result<SynthResult, DispatchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_after {
            Ok(SynthResult {
                file_path: audio_dir.join("out.mp3"),
                duration_secs: Some(1.0),
            })
        } else {
            Err(DispatchError::RateLimited {
                provider: self.tag.to_string(),
            })
        }
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

fn slot(id: u64) -> AvatarSlot {
    AvatarSlot {
        slot_id: id,
        ordinal_index: id as usize,
        x_position: 0.0,
        y_position: 0.0,
        size: 1.0,
        bound_voice_id: None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn build(
    voices: Vec<Voice>,
    providers: HashMap<ProviderTag, Arc<dyn TtsProvider>>,
    slots: Vec<AvatarSlot>,
    filter_config: MessageFilterConfig,
    parallel_message_limit: i64,
    queue_overflow_messages: bool,
    ignore_if_user_speaking: bool,
) -> (Arc<DispatchOrchestrator>, Arc<BroadcastHub>, Arc<VoiceRegistry>) {
    let registry = Arc::new(VoiceRegistry::new(voices, HashMap::new()));
    let broadcast = Arc::new(BroadcastHub::new());
    let hybrid = Arc::new(HybridProvider::new(providers, Arc::clone(&registry)));

    let config = OrchestratorConfig {
        parallel_message_limit,
        queue_overflow_messages,
        ignore_if_user_speaking,
        audio_dir: std::env::temp_dir(),
        audio_format: AudioFormat::Mp3,
        random_filters: false,
    };

    let orchestrator = Arc::new(DispatchOrchestrator::new(
        config,
        filter_config,
        Arc::new(RateLimiter::new(Duration::from_secs(300))),
        Arc::clone(&registry),
        Arc::new(AvatarSlotManager::new(slots)),
        Arc::new(QueueManager::new()),
        hybrid,
        Arc::new(AudioFilterProcessor::detect().await),
        AudioFilterConfig::default(),
        Arc::clone(&broadcast),
    ));

    (orchestrator, broadcast, registry)
}

fn chat(user: &str, text: &str, event_type: &str) -> ChatEvent {
    ChatEvent::Chat {
        user: user.to_string(),
        text: text.to_string(),
        event_type: event_type.to_string(),
        source_tags: SourceTags::default(),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn single_chat_default_voice_broadcasts_exactly_one_play() {
    let mut providers: HashMap<ProviderTag, Arc<dyn TtsProvider>> = HashMap::new();
    providers.insert(ProviderTag::Edge, Arc::new(AlwaysSucceeds(ProviderTag::Edge)));

    let (orchestrator, broadcast, _registry) = build(
        vec![voice("v1", ProviderTag::Edge)],
        providers,
        vec![slot(1)],
        MessageFilterConfig::default(),
        0,
        false,
        false,
    )
    .await;

    orchestrator.handle_event(chat("alice", "hello", "chat")).await;
    settle().await;

    let sent = broadcast.sent_payloads();
    let plays: Vec<&String> = sent.iter().filter(|p| p.contains("\"type\":\"play\"")).collect();
    assert_eq!(plays.len(), 1);
    assert!(plays[0].contains("\"id\":\"v1\""));
    assert!(plays[0].contains(".mp3"));
}

#[tokio::test]
async fn rate_limited_user_caps_broadcasts_at_five_of_six() {
    let mut providers: HashMap<ProviderTag, Arc<dyn TtsProvider>> = HashMap::new();
    providers.insert(ProviderTag::Edge, Arc::new(AlwaysSucceeds(ProviderTag::Edge)));

    let mut slots = Vec::new();
    for i in 1..=6 {
        slots.push(slot(i));
    }

    let mut filter_config = MessageFilterConfig::default();
    filter_config.rate_max_messages = 5;
    filter_config.rate_window_secs = 10;

    let (orchestrator, broadcast, _registry) = build(
        vec![voice("v1", ProviderTag::Edge)],
        providers,
        slots,
        filter_config,
        0,
        false,
        false,
    )
    .await;

    for i in 0..6 {
        orchestrator.handle_event(chat("spam", &format!("message {i}"), "chat")).await;
    }
    settle().await;

    let sent = broadcast.sent_payloads();
    let plays = sent.iter().filter(|p| p.contains("\"type\":\"play\"")).count();
    assert!(plays <= 5, "expected at most 5 broadcasts, got {plays}");
}

#[tokio::test]
async fn ignore_while_speaking_drops_the_second_of_two_near_simultaneous_events() {
    let mut providers: HashMap<ProviderTag, Arc<dyn TtsProvider>> = HashMap::new();
    providers.insert(ProviderTag::Edge, Arc::new(SlowSucceeds(ProviderTag::Edge, Duration::from_millis(200))));

    let (orchestrator, broadcast, _registry) = build(
        vec![voice("v1", ProviderTag::Edge)],
        providers,
        vec![slot(1), slot(2)],
        MessageFilterConfig::default(),
        0,
        false,
        true,
    )
    .await;

    orchestrator.handle_event(chat("bob", "first", "chat")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.handle_event(chat("bob", "second", "chat")).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    let sent = broadcast.sent_payloads();
    let plays = sent.iter().filter(|p| p.contains("\"type\":\"play\"")).count();
    assert_eq!(plays, 1);
}

#[tokio::test]
async fn parallel_cap_queues_the_third_event_until_a_release() {
    let mut providers: HashMap<ProviderTag, Arc<dyn TtsProvider>> = HashMap::new();
    providers.insert(ProviderTag::Edge, Arc::new(SlowSucceeds(ProviderTag::Edge, Duration::from_millis(150))));

    let (orchestrator, broadcast, _registry) = build(
        vec![voice("v1", ProviderTag::Edge)],
        providers,
        vec![slot(1), slot(2), slot(3)],
        MessageFilterConfig::default(),
        2,
        true,
        false,
    )
    .await;

    orchestrator.handle_event(chat("u1", "hi", "chat")).await;
    orchestrator.handle_event(chat("u2", "hi", "chat")).await;
    orchestrator.handle_event(chat("u3", "hi", "chat")).await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(orchestrator.queue_snapshot().parallel_queue_len, 1);
    let plays_before = broadcast.sent_payloads().iter().filter(|p| p.contains("\"type\":\"play\"")).count();
    assert_eq!(plays_before, 2);

    // Simulate the overlay client's `audio_ended` frame for u1's slot (slot 1,
    // deterministically the first free slot at admission time) instead of
    // waiting out the multi-second release timer.
    orchestrator.release_slot_by_id(1).await;
    tokio::time::sleep(Duration::from_millis(350)).await;

    let plays_after = broadcast.sent_payloads().iter().filter(|p| p.contains("\"type\":\"play\"")).count();
    assert_eq!(plays_after, 3);
    assert_eq!(orchestrator.queue_snapshot().parallel_queue_len, 0);
}

#[tokio::test]
async fn provider_rate_limit_falls_back_and_is_tracked_in_fallback_stats() {
    let monster_provider: Arc<dyn TtsProvider> = Arc::new(FlakyAfter {
        tag: ProviderTag::Monster,
        calls: AtomicUsize::new(0),
        fail_after: 1,
    });
    let mut providers: HashMap<ProviderTag, Arc<dyn TtsProvider>> = HashMap::new();
    providers.insert(ProviderTag::Monster, monster_provider);
    providers.insert(ProviderTag::Edge, Arc::new(AlwaysSucceeds(ProviderTag::Edge)));

    let voices = vec![
        voice("m1", ProviderTag::Monster),
        voice("m2", ProviderTag::Monster),
        voice("e1", ProviderTag::Edge),
    ];

    // Forces both events onto the monster voice m1 via the special-event override.
    let registry = Arc::new(VoiceRegistry::new(voices.clone(), {
        let mut overrides = HashMap::new();
        overrides.insert("chat".to_string(), "m1".to_string());
        overrides
    }));
    let broadcast = Arc::new(BroadcastHub::new());
    let hybrid = Arc::new(HybridProvider::new(providers, Arc::clone(&registry)));

    let config = OrchestratorConfig {
        parallel_message_limit: 0,
        queue_overflow_messages: false,
        ignore_if_user_speaking: false,
        audio_dir: std::env::temp_dir(),
        audio_format: AudioFormat::Mp3,
        random_filters: false,
    };
    let orchestrator = Arc::new(DispatchOrchestrator::new(
        config,
        MessageFilterConfig::default(),
        Arc::new(RateLimiter::new(Duration::from_secs(300))),
        Arc::clone(&registry),
        Arc::new(AvatarSlotManager::new(vec![slot(1), slot(2)])),
        Arc::new(QueueManager::new()),
        hybrid,
        Arc::new(AudioFilterProcessor::detect().await),
        AudioFilterConfig::default(),
        Arc::clone(&broadcast),
    ));

    orchestrator.handle_event(chat("carl", "first", "chat")).await;
    settle().await;
    orchestrator.handle_event(chat("dana", "second", "chat")).await;
    settle().await;

    let sent = broadcast.sent_payloads();
    let plays = sent.iter().filter(|p| p.contains("\"type\":\"play\"")).count();
    assert_eq!(plays, 2);
    assert_eq!(registry.usage_snapshot().total_fallback(), 1);
}

#[tokio::test]
async fn ban_cancels_in_flight_job_and_broadcasts_stop_without_a_play() {
    let mut providers: HashMap<ProviderTag, Arc<dyn TtsProvider>> = HashMap::new();
    providers.insert(ProviderTag::Edge, Arc::new(SlowSucceeds(ProviderTag::Edge, Duration::from_millis(500))));

    let (orchestrator, broadcast, _registry) = build(
        vec![voice("v1", ProviderTag::Edge)],
        providers,
        vec![slot(1), slot(2)],
        MessageFilterConfig::default(),
        1,
        true,
        false,
    )
    .await;

    orchestrator.handle_event(chat("mallory", "in flight", "chat")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    // Queued behind the still-running job above; should be scrubbed by the ban.
    orchestrator.handle_event(chat("mallory", "queued too", "chat")).await;

    assert_eq!(orchestrator.queue_snapshot().parallel_queue_len, 1);

    orchestrator
        .handle_event(ChatEvent::Moderation {
            target_user: "mallory".to_string(),
            duration_secs: None,
        })
        .await;
    settle().await;

    assert_eq!(orchestrator.queue_snapshot().parallel_queue_len, 0);

    // Give the aborted job's sleep well past the point it would have completed
    // had it not been cancelled, to confirm no late play slips through.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let sent = broadcast.sent_payloads();
    let plays_for_mallory = sent
        .iter()
        .filter(|p| p.contains("\"type\":\"play\"") && p.contains("\"user\":\"mallory\""))
        .count();
    assert_eq!(plays_for_mallory, 0);

    let stops_for_mallory = sent
        .iter()
        .filter(|p| p.contains("\"type\":\"stop\"") && p.contains("\"user\":\"mallory\""))
        .count();
    assert_eq!(stops_for_mallory, 1);
}
