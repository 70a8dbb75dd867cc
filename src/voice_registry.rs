use crate::models::{ProviderTag, UsageStats, Voice};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Mutex;

const SELECTION_LOG_INTERVAL: u64 = 10;

/// Holds the current set of enabled voices plus special-event voice overrides,
/// and the running selection/fallback usage counters.
pub struct VoiceRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    voices: Vec<Voice>,
    special_voices: HashMap<String, String>,
    stats: UsageStats,
    selection_count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum VoiceSelectionError {
    #[error("no enabled voices configured")]
    NoVoiceAvailable,
}

impl VoiceRegistry {
    pub fn new(voices: Vec<Voice>, special_voices: HashMap<String, String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                voices,
                special_voices,
                stats: UsageStats::default(),
                selection_count: 0,
            }),
        }
    }

    pub fn replace_voices(&self, voices: Vec<Voice>) {
        self.inner.lock().unwrap().voices = voices;
    }

    pub fn enabled_voices(&self) -> Vec<Voice> {
        self.inner
            .lock()
            .unwrap()
            .voices
            .iter()
            .filter(|v| v.enabled)
            .cloned()
            .collect()
    }

    /// Picks a voice for `event_type`: a registered override if it still resolves
    /// to an enabled voice, otherwise a uniform-random enabled voice.
    pub fn pick(&self, event_type: &str) -> Result<Voice, VoiceSelectionError> {
        let mut inner = self.inner.lock().unwrap();
        let enabled: Vec<&Voice> = inner.voices.iter().filter(|v| v.enabled).collect();
        if enabled.is_empty() {
            return Err(VoiceSelectionError::NoVoiceAvailable);
        }

        let chosen = if let Some(override_id) = inner.special_voices.get(event_type) {
            enabled.iter().find(|v| &v.id == override_id).copied()
        } else {
            None
        };

        let chosen = chosen
            .or_else(|| enabled.choose(&mut rand::thread_rng()).copied())
            .expect("enabled is non-empty")
            .clone();

        inner.stats.record_selected(&chosen.display_name, chosen.provider_tag);
        inner.selection_count += 1;
        if inner.selection_count % SELECTION_LOG_INTERVAL == 0 {
            log::info!(
                "voice selection summary: {} selections so far, {} distinct voices tracked",
                inner.selection_count,
                inner.stats.selected.len()
            );
        }

        Ok(chosen)
    }

    /// Picks a uniform-random enabled voice other than `exclude`, used by the hybrid
    /// provider's fallback path. Falls back to any enabled voice if only one exists.
    pub fn pick_random_excluding(&self, exclude: &str) -> Option<Voice> {
        let inner = self.inner.lock().unwrap();
        let enabled: Vec<&Voice> = inner.voices.iter().filter(|v| v.enabled).collect();
        if enabled.is_empty() {
            return None;
        }
        let candidates: Vec<&&Voice> = enabled.iter().filter(|v| v.id != exclude).collect();
        if let Some(v) = candidates.choose(&mut rand::thread_rng()) {
            Some((**v).clone())
        } else {
            enabled.choose(&mut rand::thread_rng()).map(|v| (*v).clone())
        }
    }

    pub fn record_fallback(&self, voice_name: &str, provider: ProviderTag) {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.stats.record_fallback(voice_name, provider);
        if count % 5 == 0 {
            log::info!(
                "fallback usage summary: voice={} provider={} fallback_count={}",
                voice_name,
                provider,
                count
            );
        }
    }

    pub fn usage_snapshot(&self) -> UsageStats {
        self.inner.lock().unwrap().stats.clone()
    }
}
