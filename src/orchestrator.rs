use crate::avatar_slots::AvatarSlotManager;
use crate::broadcast_hub::{BroadcastHub, PlaybackEvent, PlaybackVoice, TargetSlot};
use crate::errors::DispatchError;
use crate::message_filter::{self, MessageFilterConfig};
use crate::models::{AudioFormat, AvatarSlot, ChatEvent, TtsJob};
use crate::providers::HybridProvider;
use crate::queue_manager::{queue_entry, QueueManager};
use crate::rate_limiter::RateLimiter;
use crate::voice_registry::VoiceRegistry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// `parallelMessageLimit` of `<= 0` means unlimited (step 4 of the pipeline is skipped).
pub struct OrchestratorConfig {
    pub parallel_message_limit: i64,
    pub queue_overflow_messages: bool,
    pub ignore_if_user_speaking: bool,
    pub audio_dir: PathBuf,
    pub audio_format: AudioFormat,
    pub random_filters: bool,
}

/// A user charged against `active_job_count`. `handle` is `None` while the
/// entry is still sitting in the slot queue waiting for a slot to free up
/// (SPEC_FULL §4.8 step 5 charges the count at voice-pick time, before the
/// reservation attempt); `slot_id` is `None` for the same reason.
struct ActiveJob {
    handle: Option<JoinHandle<()>>,
    slot_id: Option<u64>,
}

/// The pipeline stitching the rate limiter, message filter, voice registry, avatar
/// slots, provider synthesis, audio filters, queues, and broadcast hub together.
/// `handle_event` is the single entry point; everything else is called from it.
pub struct DispatchOrchestrator {
    config: Mutex<OrchestratorConfig>,
    filter_config: Mutex<MessageFilterConfig>,
    rate_limiter: Arc<RateLimiter>,
    voices: Arc<VoiceRegistry>,
    slots: Arc<AvatarSlotManager>,
    queues: Arc<QueueManager>,
    provider: Arc<HybridProvider>,
    audio_filters: Arc<crate::audio_filters::AudioFilterProcessor>,
    audio_filter_config: Mutex<crate::audio_filters::AudioFilterConfig>,
    broadcast: Arc<BroadcastHub>,
    active_jobs: Mutex<HashMap<String, ActiveJob>>,
    active_job_count: AtomicI64,
    tts_enabled: std::sync::atomic::AtomicBool,
    enabled_voice_ids_cache: Mutex<Vec<String>>,
}

impl DispatchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        filter_config: MessageFilterConfig,
        rate_limiter: Arc<RateLimiter>,
        voices: Arc<VoiceRegistry>,
        slots: Arc<AvatarSlotManager>,
        queues: Arc<QueueManager>,
        provider: Arc<HybridProvider>,
        audio_filters: Arc<crate::audio_filters::AudioFilterProcessor>,
        audio_filter_config: crate::audio_filters::AudioFilterConfig,
        broadcast: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            filter_config: Mutex::new(filter_config),
            rate_limiter,
            voices,
            slots,
            queues,
            provider,
            audio_filters,
            audio_filter_config: Mutex::new(audio_filter_config),
            broadcast,
            active_jobs: Mutex::new(HashMap::new()),
            active_job_count: AtomicI64::new(0),
            tts_enabled: std::sync::atomic::AtomicBool::new(true),
            enabled_voice_ids_cache: Mutex::new(Vec::new()),
        }
    }

    pub fn set_tts_enabled(&self, enabled: bool) {
        self.tts_enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn handle_event(self: &Arc<Self>, event: ChatEvent) {
        match event {
            ChatEvent::Chat {
                user,
                text,
                event_type,
                source_tags,
            } => self.handle_chat(user, text, event_type, source_tags).await,
            ChatEvent::Moderation { target_user, duration_secs } => {
                self.handle_moderation(target_user, duration_secs).await
            }
        }
    }

    async fn handle_chat(
        self: &Arc<Self>,
        user: String,
        text: String,
        event_type: String,
        source_tags: crate::models::SourceTags,
    ) {
        if !self.tts_enabled.load(Ordering::SeqCst) {
            return;
        }

        let filter_config = self.filter_config.lock().unwrap().clone();
        let outcome = message_filter::apply_filters(&user, &text, &source_tags, &filter_config, &self.rate_limiter);
        if !outcome.accept {
            log::debug!("message from {} filtered out", user);
            return;
        }
        let text = outcome.filtered_text;

        let user_lower = user.to_lowercase();
        let config = self.config.lock().unwrap();
        if config.ignore_if_user_speaking && self.active_jobs.lock().unwrap().contains_key(&user_lower) {
            return;
        }

        let limit = config.parallel_message_limit;
        let queue_overflow = config.queue_overflow_messages;
        drop(config);

        if limit > 0 && self.active_job_count.load(Ordering::SeqCst) >= limit {
            if queue_overflow {
                self.queues.push_parallel(queue_entry(&user, &text, &event_type, None));
            }
            return;
        }

        self.admit(user, text, event_type).await;
    }

    /// Step 5 onward of the pipeline: pick a voice, try to reserve a slot, and
    /// either dispatch synthesis or park the (now-admitted) message in the slot
    /// queue. Re-entered by the queue drain path once a prior job frees capacity.
    async fn admit(self: &Arc<Self>, user: String, text: String, event_type: String) {
        let voice = match self.voices.pick(&event_type) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("no voice available for event from {}: {}", user, e);
                return;
            }
        };

        let user_lower = user.to_lowercase();
        self.active_job_count.fetch_add(1, Ordering::SeqCst);
        // Charge the user against active_job_count as soon as they're admitted,
        // before we know whether a slot is actually free. If find_and_reserve
        // below fails, this placeholder is what lets the TTL-drain and
        // moderation-scrub paths find and reverse the charge later.
        self.active_jobs.lock().unwrap().insert(
            user_lower.clone(),
            ActiveJob {
                handle: None,
                slot_id: None,
            },
        );

        let enabled_ids = self.voices.enabled_voices().into_iter().map(|v| v.id).collect::<Vec<_>>();
        *self.enabled_voice_ids_cache.lock().unwrap() = enabled_ids.clone();

        let reserved = self.slots.find_and_reserve(Some(&voice.id), &enabled_ids, &user, "", None);
        let Some(reserved) = reserved else {
            self.queues.push_slot(queue_entry(&user, &text, &event_type, Some(voice)));
            return;
        };

        let slot = reserved.slot;
        let slot_id = slot.slot_id;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_job(user.clone(), text, event_type, voice, slot).await;
        });

        self.active_jobs.lock().unwrap().insert(
            user_lower,
            ActiveJob {
                handle: Some(handle),
                slot_id: Some(slot_id),
            },
        );
    }

    async fn run_job(
        self: Arc<Self>,
        user: String,
        text: String,
        event_type: String,
        voice: crate::models::Voice,
        slot: AvatarSlot,
    ) {
        let slot_id = slot.slot_id;
        let (audio_dir, audio_format, random_filters) = {
            let config = self.config.lock().unwrap();
            (config.audio_dir.clone(), config.audio_format, config.random_filters)
        };

        let job = TtsJob {
            job_id: uuid::Uuid::new_v4(),
            user: user.clone(),
            text: text.clone(),
            event_type: event_type.clone(),
            chosen_voice: voice.clone(),
            audio_format,
        };

        let result = self.synth_and_filter(&job, &audio_dir, random_filters).await;

        match result {
            Ok((audio_path, duration)) => {
                let generation_id = self.slots.generation_id();
                let audio_url = audio_path.display().to_string();
                self.broadcast
                    .broadcast(&PlaybackEvent::Play {
                        user: &user,
                        message: &text,
                        event_type: &event_type,
                        voice: PlaybackVoice {
                            id: &voice.id,
                            name: &voice.display_name,
                            provider: voice.provider_tag.to_string(),
                            avatar: voice.avatar_refs.first().map(|s| s.as_str()),
                        },
                        audio_url: &audio_url,
                        target_slot: TargetSlot::from(&slot),
                        avatar_data: serde_json::json!({ "avatarRefs": voice.avatar_refs }),
                        generation_id,
                    })
                    .await;
                self.arm_release_timer(slot_id, duration);
            }
            Err(e) => {
                log::error!("synthesis failed for {}: {}", user, e);
                self.release_and_drain(&user, slot_id).await;
            }
        }
    }

    async fn synth_and_filter(
        &self,
        job: &TtsJob,
        audio_dir: &std::path::Path,
        random_filters: bool,
    ) -> Result<(PathBuf, Option<f32>), DispatchError> {
        let synth = self.provider.synth(job, audio_dir).await?;
        let filter_config = self.audio_filter_config.lock().unwrap().clone();
        let (path, probed_duration) = self
            .audio_filters
            .apply_filters(&synth.file_path, &filter_config, random_filters)
            .await;
        Ok((path, probed_duration.or(synth.duration_secs)))
    }

    fn arm_release_timer(self: &Arc<Self>, slot_id: u64, duration_secs: Option<f32>) {
        let this = Arc::clone(self);
        let duration = duration_secs.unwrap_or(crate::models::DEFAULT_AUDIO_DURATION_SECS);
        let delay = duration + crate::models::SLOT_RELEASE_SAFETY_BUFFER_SECS;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs_f32(delay.max(0.0))).await;
            this.release_slot_by_id(slot_id).await;
        });
    }

    /// Invoked either by the release timer or by a client's `audio_ended` frame.
    pub async fn release_slot_by_id(self: &Arc<Self>, slot_id: u64) {
        self.slots.release(slot_id);
        let user = {
            let mut jobs = self.active_jobs.lock().unwrap();
            let user = jobs
                .iter()
                .find(|(_, j)| j.slot_id == Some(slot_id))
                .map(|(u, _)| u.clone());
            if let Some(ref u) = user {
                jobs.remove(u);
            }
            user
        };
        self.active_job_count.fetch_sub(1, Ordering::SeqCst);
        self.drain_queues().await;
        let _ = user;
    }

    async fn release_and_drain(self: &Arc<Self>, user: &str, slot_id: u64) {
        self.slots.release(slot_id);
        self.active_jobs.lock().unwrap().remove(&user.to_lowercase());
        self.active_job_count.fetch_sub(1, Ordering::SeqCst);
        self.drain_queues().await;
    }

    /// Reverses the active_job_count charge and active_jobs entry for a
    /// slot-queue entry that was dropped (TTL expiry) without ever running.
    /// Parallel-queue entries need no equivalent, since those are only charged
    /// against active_job_count once they're admitted (at which point they stop
    /// being parallel-queue entries).
    fn discharge_abandoned_slot_entry(&self, entry: &crate::models::QueueEntry) {
        let removed = self.active_jobs.lock().unwrap().remove(&entry.user.to_lowercase());
        if removed.is_some() {
            self.active_job_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Re-runs admission for queued entries now that capacity may have freed up.
    async fn drain_queues(self: &Arc<Self>) {
        let slot_drain = self.queues.pop_slot_ready();
        for expired in &slot_drain.expired {
            self.discharge_abandoned_slot_entry(expired);
        }

        if let Some(entry) = slot_drain.ready {
            if let Some(voice) = entry.chosen_voice {
                let enabled_ids = self.enabled_voice_ids_cache.lock().unwrap().clone();
                if let Some(reserved) = self.slots.find_and_reserve(Some(&voice.id), &enabled_ids, &entry.user, "", None) {
                    let slot = reserved.slot;
                    let slot_id = slot.slot_id;
                    let this = Arc::clone(self);
                    let user = entry.user.clone();
                    let text = entry.text.clone();
                    let event_type = entry.event_type.clone();
                    let handle = tokio::spawn(async move {
                        this.run_job(user.clone(), text, event_type, voice, slot).await;
                    });
                    self.active_jobs.lock().unwrap().insert(
                        entry.user.to_lowercase(),
                        ActiveJob {
                            handle: Some(handle),
                            slot_id: Some(slot_id),
                        },
                    );
                } else {
                    self.queues.push_slot(entry);
                }
            }
            return;
        }

        let limit = self.config.lock().unwrap().parallel_message_limit;
        if limit <= 0 || self.active_job_count.load(Ordering::SeqCst) < limit {
            if let Some(entry) = self.queues.pop_parallel_ready().ready {
                self.admit(entry.user, entry.text, entry.event_type).await;
            }
        }
    }

    async fn handle_moderation(self: &Arc<Self>, target_user: String, _duration_secs: Option<u64>) {
        let target_lower = target_user.to_lowercase();
        self.queues.scrub_user(&target_lower);

        let cancelled = self.active_jobs.lock().unwrap().remove(&target_lower);
        if let Some(job) = cancelled {
            // `handle` is None for a user still parked in the slot queue (never
            // spawned yet); nothing to abort there, just reverse the charge below.
            if let Some(handle) = job.handle {
                handle.abort();
            }
            if let Some(slot_id) = job.slot_id {
                self.slots.release(slot_id);
            }
            self.active_job_count.fetch_sub(1, Ordering::SeqCst);
        }

        self.broadcast.broadcast(&PlaybackEvent::Stop { user: &target_user }).await;
        self.drain_queues().await;
    }

    pub fn active_job_count(&self) -> i64 {
        self.active_job_count.load(Ordering::SeqCst)
    }

    pub fn queue_snapshot(&self) -> crate::queue_manager::QueueSnapshot {
        self.queues.snapshot()
    }

    pub fn generation_id(&self) -> u64 {
        self.slots.generation_id()
    }

    pub fn occupied_slot_count(&self) -> usize {
        self.slots.occupied_count()
    }

    pub fn slots_snapshot(&self) -> Vec<crate::models::AvatarSlot> {
        self.slots.slots_snapshot()
    }

    pub fn voices(&self) -> Arc<VoiceRegistry> {
        Arc::clone(&self.voices)
    }

    /// Synthesizes a short test phrase on `voice_id` without going through chat
    /// ingress, rate limiting, or avatar slot reservation. Operator smoke-test
    /// path only; never touches the active-jobs bookkeeping.
    pub async fn synth_test_phrase(&self, voice_id: &str, text: &str) -> Result<PathBuf, DispatchError> {
        let voice = self
            .voices
            .enabled_voices()
            .into_iter()
            .find(|v| v.id == voice_id)
            .ok_or_else(|| DispatchError::Config(format!("no enabled voice with id {}", voice_id)))?;

        let (audio_dir, audio_format, random_filters) = {
            let config = self.config.lock().unwrap();
            (config.audio_dir.clone(), config.audio_format, config.random_filters)
        };

        let job = TtsJob {
            job_id: uuid::Uuid::new_v4(),
            user: "operator".to_string(),
            text: text.to_string(),
            event_type: "test".to_string(),
            chosen_voice: voice,
            audio_format,
        };

        let (path, _duration) = self.synth_and_filter(&job, &audio_dir, random_filters).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_filters::AudioFilterConfig;
    use crate::models::{ProviderTag, Voice};
    use crate::providers::HybridProvider;
    use std::collections::HashMap as StdHashMap;

    fn voice(id: &str) -> Voice {
        Voice {
            id: id.to_string(),
            display_name: id.to_string(),
            provider_tag: ProviderTag::Edge,
            provider_voice_ref: format!("ref-{id}"),
            enabled: true,
            avatar_refs: vec![],
        }
    }

    #[tokio::test]
    async fn parallel_limit_of_zero_means_unlimited() {
        let config = OrchestratorConfig {
            parallel_message_limit: 0,
            queue_overflow_messages: false,
            ignore_if_user_speaking: false,
            audio_dir: PathBuf::from("/tmp"),
            audio_format: AudioFormat::Mp3,
            random_filters: false,
        };
        let voices = Arc::new(VoiceRegistry::new(vec![voice("v1")], StdHashMap::new()));
        let orchestrator = Arc::new(DispatchOrchestrator::new(
            config,
            MessageFilterConfig::default(),
            Arc::new(RateLimiter::default()),
            voices,
            Arc::new(AvatarSlotManager::new(vec![])),
            Arc::new(QueueManager::new()),
            Arc::new(HybridProvider::new(StdHashMap::new(), Arc::new(VoiceRegistry::new(vec![], StdHashMap::new())))),
            Arc::new(crate::audio_filters::AudioFilterProcessor::detect().await),
            AudioFilterConfig::default(),
            Arc::new(BroadcastHub::new()),
        ));
        assert_eq!(orchestrator.active_job_count(), 0);
    }

    async fn build_orchestrator_with_no_slots() -> Arc<DispatchOrchestrator> {
        let config = OrchestratorConfig {
            parallel_message_limit: 0,
            queue_overflow_messages: false,
            ignore_if_user_speaking: false,
            audio_dir: PathBuf::from("/tmp"),
            audio_format: AudioFormat::Mp3,
            random_filters: false,
        };
        let voices = Arc::new(VoiceRegistry::new(vec![voice("v1")], StdHashMap::new()));
        Arc::new(DispatchOrchestrator::new(
            config,
            MessageFilterConfig::default(),
            Arc::new(RateLimiter::default()),
            voices,
            Arc::new(AvatarSlotManager::new(vec![])),
            Arc::new(QueueManager::new()),
            Arc::new(HybridProvider::new(StdHashMap::new(), Arc::new(VoiceRegistry::new(vec![], StdHashMap::new())))),
            Arc::new(crate::audio_filters::AudioFilterProcessor::detect().await),
            AudioFilterConfig::default(),
            Arc::new(BroadcastHub::new()),
        ))
    }

    #[tokio::test]
    async fn active_job_count_is_released_when_a_slot_queued_user_is_moderated() {
        let orchestrator = build_orchestrator_with_no_slots().await;

        // No avatar slots exist, so admit() always parks the entry in the slot
        // queue while still charging active_job_count at voice-pick time.
        orchestrator.admit("alice".to_string(), "hi".to_string(), "chat".to_string()).await;
        assert_eq!(orchestrator.active_job_count(), 1);
        assert_eq!(orchestrator.queue_snapshot().slot_queue_len, 1);

        orchestrator.handle_moderation("alice".to_string(), None).await;

        assert_eq!(orchestrator.active_job_count(), 0);
        assert_eq!(orchestrator.queue_snapshot().slot_queue_len, 0);
    }
}
