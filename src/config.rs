use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::audio_filters::AudioFilterConfig;
use crate::message_filter::MessageFilterConfig;
use crate::models::{AudioFormat, AvatarSlot, Voice};

/// Credentials and options for each TTS backend. Any field left `None` means
/// that provider is not configured and the hybrid router never picks it.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ProviderSettings {
    pub monster_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub polly_access_key: Option<String>,
    pub polly_secret_key: Option<String>,
    pub polly_region: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TwitchSettings {
    pub oauth_token: String,
    pub nickname: String,
    pub channel: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct YouTubeSettings {
    pub api_key: String,
    /// If unset, the adapter discovers the caller's active broadcast.
    pub video_id: Option<String>,
}

/// Settings saved to disk. Mirrors the recognized config surface: dispatch
/// knobs, ingress filtering, voices, avatar slots, provider credentials, and
/// chat source credentials.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppSettings {
    pub tts_enabled: bool,
    pub audio_dir: PathBuf,
    pub audio_format: AudioFormat,
    /// <= 0 means unlimited.
    pub parallel_message_limit: i64,
    pub queue_overflow_messages: bool,
    pub ignore_if_user_speaking: bool,
    pub random_filters: bool,
    pub log_level: String,
    pub ws_port: u16,
    pub rest_port: u16,

    pub message_filtering: MessageFilterConfig,
    #[serde(default)]
    pub special_voices: HashMap<String, String>,
    pub audio_filters: AudioFilterConfig,

    pub voices: Vec<Voice>,
    pub avatar_slots: Vec<AvatarSlot>,

    #[serde(default)]
    pub tts: ProviderSettings,
    pub twitch: Option<TwitchSettings>,
    pub youtube: Option<YouTubeSettings>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            tts_enabled: true,
            audio_dir: default_audio_dir(),
            audio_format: AudioFormat::Mp3,
            parallel_message_limit: 3,
            queue_overflow_messages: true,
            ignore_if_user_speaking: true,
            random_filters: false,
            log_level: "info".to_string(),
            ws_port: 9001,
            rest_port: 9000,
            message_filtering: MessageFilterConfig::default(),
            special_voices: HashMap::new(),
            audio_filters: AudioFilterConfig::default(),
            voices: vec![Voice {
                id: "default-edge".to_string(),
                display_name: "Ava".to_string(),
                provider_tag: crate::models::ProviderTag::Edge,
                provider_voice_ref: "en-US-AvaNeural".to_string(),
                enabled: true,
                avatar_refs: vec![],
            }],
            avatar_slots: vec![AvatarSlot {
                slot_id: 1,
                ordinal_index: 0,
                x_position: 0.5,
                y_position: 0.5,
                size: 1.0,
                bound_voice_id: None,
            }],
            tts: ProviderSettings::default(),
            twitch: None,
            youtube: None,
        }
    }
}

fn default_audio_dir() -> PathBuf {
    std::env::temp_dir().join("chat-yapper-core").join("audio")
}

/// Loads settings from the OS config directory, falling back to defaults on
/// first run.
pub fn load_settings() -> Result<AppSettings> {
    let settings: AppSettings = confy::load("chat-yapper-core", "settings")?;
    Ok(settings)
}

pub fn save_settings(settings: &AppSettings) -> Result<()> {
    confy::store("chat-yapper-core", "settings", settings)?;
    Ok(())
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(confy::get_configuration_file_path("chat-yapper-core", "settings")?)
}
