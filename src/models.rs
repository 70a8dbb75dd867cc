use serde::{Deserialize, Serialize};
use std::time::Instant;

/// One configured synthesis voice. Read-only on the dispatch path; created/edited
/// by whatever owns configuration, outside this core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Voice {
    pub id: String,
    pub display_name: String,
    pub provider_tag: ProviderTag,
    pub provider_voice_ref: String,
    pub enabled: bool,
    #[serde(default)]
    pub avatar_refs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    Monster,
    Edge,
    Google,
    Polly,
}

impl std::fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderTag::Monster => "monster",
            ProviderTag::Edge => "edge",
            ProviderTag::Google => "google",
            ProviderTag::Polly => "polly",
        };
        write!(f, "{}", s)
    }
}

/// A screen position capable of hosting one playing utterance at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, utoipa::ToSchema)]
pub struct AvatarSlot {
    pub slot_id: u64,
    pub ordinal_index: usize,
    pub x_position: f32,
    pub y_position: f32,
    pub size: f32,
    /// None = accepts any voice.
    pub bound_voice_id: Option<String>,
}

/// The temporary binding of a slot to a playing utterance.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub slot_id: u64,
    pub user: String,
    pub start_wall_time: Instant,
    pub audio_duration_secs: f32,
    pub audio_url: String,
}

pub const DEFAULT_AUDIO_DURATION_SECS: f32 = 30.0;
pub const SLOT_RELEASE_SAFETY_BUFFER_SECS: f32 = 5.0;

/// One (user, text) synthesis attempt tracked by the orchestrator.
#[derive(Debug, Clone)]
pub struct TtsJob {
    pub job_id: uuid::Uuid,
    pub user: String,
    pub text: String,
    pub event_type: String,
    pub chosen_voice: Voice,
    pub audio_format: AudioFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }
}

/// A unified chat/moderation event as produced by a chat source adapter.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Chat {
        user: String,
        text: String,
        event_type: String,
        source_tags: SourceTags,
    },
    Moderation {
        target_user: String,
        /// None = permanent ban, Some(secs) = timeout.
        duration_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SourceTags {
    /// (start, end) byte offsets of emotes within the raw text, as reported by the source.
    pub emote_offsets: Vec<(usize, usize)>,
}

/// A message waiting in one of the two queues.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub user: String,
    pub text: String,
    pub event_type: String,
    /// Present once a voice has already been picked (slot-queue entries); absent
    /// for entries still waiting on the parallel cap.
    pub chosen_voice: Option<Voice>,
    pub enqueue_wall_time: Instant,
}

/// Per-provider rate-limit and credential-cache bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct UsageStats {
    pub selected: std::collections::HashMap<(String, ProviderTag), u64>,
    pub fallback_chosen: std::collections::HashMap<(String, ProviderTag), u64>,
}

/// Flattened, JSON-friendly view of a `UsageStats` snapshot (map keys with tuples
/// don't round-trip through `serde_json` as object keys).
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct UsageCounter {
    pub voice_name: String,
    pub provider: ProviderTag,
    pub selected: u64,
    pub fallback_chosen: u64,
}

impl UsageStats {
    pub fn record_selected(&mut self, voice_name: &str, provider: ProviderTag) -> u64 {
        let counter = self
            .selected
            .entry((voice_name.to_string(), provider))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn record_fallback(&mut self, voice_name: &str, provider: ProviderTag) -> u64 {
        let counter = self
            .fallback_chosen
            .entry((voice_name.to_string(), provider))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn total_selected(&self) -> u64 {
        self.selected.values().sum()
    }

    pub fn total_fallback(&self) -> u64 {
        self.fallback_chosen.values().sum()
    }

    /// Flattens both counters into one row per (voice, provider) pair seen by either map.
    pub fn to_counters(&self) -> Vec<UsageCounter> {
        let mut keys: std::collections::HashSet<(String, ProviderTag)> = self.selected.keys().cloned().collect();
        keys.extend(self.fallback_chosen.keys().cloned());
        keys.into_iter()
            .map(|key| UsageCounter {
                voice_name: key.0.clone(),
                provider: key.1,
                selected: *self.selected.get(&key).unwrap_or(&0),
                fallback_chosen: *self.fallback_chosen.get(&key).unwrap_or(&0),
            })
            .collect()
    }
}
