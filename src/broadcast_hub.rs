use actix_ws::Session;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::models::AvatarSlot;

/// A frame sent by an overlay client back to the server. Today the only frame
/// the core acts on is an explicit end-of-playback signal; anything else
/// (plain ping text) is ignored by the caller.
#[derive(Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "audio_ended")]
    AudioEnded {
        #[serde(rename = "slotId")]
        slot_id: u64,
    },
}

/// Set of connected overlay WebSocket clients. `broadcast` is best-effort: no
/// reliability guarantees and no per-client buffering beyond what actix-ws gives
/// us. A client whose send fails is assumed dead and dropped from the set.
///
/// Every broadcast payload is also appended to an in-memory log regardless of
/// whether any real client is connected, so integration tests can drive the
/// orchestrator against a `BroadcastHub` with zero `actix_ws::Session`s attached
/// and still assert on what would have gone out over the wire.
#[derive(Default)]
pub struct BroadcastHub {
    clients: Mutex<Vec<Session>>,
    sent: Mutex<Vec<String>>,
}

/// The `voice` sub-object of a `play` frame.
#[derive(Serialize)]
pub struct PlaybackVoice<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<&'a str>,
}

/// The `targetSlot` sub-object of a `play` frame.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSlot {
    pub id: u64,
    pub x_position: f32,
    pub y_position: f32,
    pub size: f32,
}

impl From<&AvatarSlot> for TargetSlot {
    fn from(slot: &AvatarSlot) -> Self {
        Self {
            id: slot.slot_id,
            x_position: slot.x_position,
            y_position: slot.y_position,
            size: slot.size,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PlaybackEvent<'a> {
    #[serde(rename = "play")]
    Play {
        user: &'a str,
        message: &'a str,
        event_type: &'a str,
        voice: PlaybackVoice<'a>,
        audio_url: &'a str,
        target_slot: TargetSlot,
        avatar_data: serde_json::Value,
        generation_id: u64,
    },
    #[serde(rename = "stop")]
    Stop { user: &'a str },
    #[serde(rename = "avatar_slots_updated")]
    AvatarSlotsUpdated {
        slots: Vec<AvatarSlot>,
        generation_id: u64,
    },
    #[serde(rename = "settings_updated")]
    SettingsUpdated { settings: serde_json::Value },
    #[serde(rename = "avatar_updated")]
    AvatarUpdated { message: &'a str },
    #[serde(rename = "re_randomize_avatars")]
    ReRandomizeAvatars { message: &'a str },
    #[serde(rename = "twitch_auth_error")]
    TwitchAuthError { message: &'a str },
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, session: Session) {
        self.clients.lock().unwrap().push(session);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub async fn broadcast(&self, event: &PlaybackEvent<'_>) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to serialize broadcast payload: {}", e);
                return;
            }
        };

        self.sent.lock().unwrap().push(payload.clone());

        let sessions: Vec<Session> = self.clients.lock().unwrap().drain(..).collect();
        let mut survivors = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            if session.text(payload.clone()).await.is_ok() {
                survivors.push(session);
            } else {
                log::debug!("dropping dead overlay websocket client");
            }
        }
        self.clients.lock().unwrap().extend(survivors);
    }

    /// Returns every payload broadcast so far, oldest first. Used by tests that
    /// have no real WebSocket client attached.
    pub fn sent_payloads(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn play_event_serializes_with_expected_shape() {
        let event = PlaybackEvent::Play {
            user: "alice",
            message: "hello",
            event_type: "chat",
            voice: PlaybackVoice {
                id: "v1",
                name: "Ava",
                provider: "edge".to_string(),
                avatar: None,
            },
            audio_url: "/audio/x.mp3",
            target_slot: TargetSlot {
                id: 1,
                x_position: 0.5,
                y_position: 0.5,
                size: 1.0,
            },
            avatar_data: serde_json::json!({}),
            generation_id: 1,
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "play");
        assert_eq!(json["voice"]["id"], "v1");
        assert_eq!(json["targetSlot"]["xPosition"], 0.5);
    }

    #[test]
    fn client_audio_ended_frame_parses_slot_id() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"audio_ended","slotId":7}"#).unwrap();
        match frame {
            ClientFrame::AudioEnded { slot_id } => assert_eq!(slot_id, 7),
        }
    }

    #[tokio::test]
    async fn broadcast_with_no_clients_still_records_the_payload() {
        let hub = BroadcastHub::new();
        hub.broadcast(&PlaybackEvent::Stop { user: "alice" }).await;
        let sent = hub.sent_payloads();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"type\":\"stop\""));
    }
}
