use super::EventSender;
use crate::models::{ChatEvent, SourceTags};
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

const POLL_FLOOR_MILLIS: u64 = 15_000;
const POLL_CEILING_MILLIS: u64 = 30_000;
const EMPTY_POLL_BACKOFF_THRESHOLD: u32 = 3;
const FORBIDDEN_BACKOFF_SECS: u64 = 300;
const DEDUP_CAPACITY: usize = 1000;

pub struct YouTubeAdapter {
    api_key: String,
    video_id: Option<String>,
    client: reqwest::Client,
}

impl YouTubeAdapter {
    pub fn new(api_key: String, video_id: Option<String>) -> Self {
        Self {
            api_key,
            video_id,
            client: reqwest::Client::new(),
        }
    }

    /// Runs forever: discovers the live chat id, then polls it with adaptive backoff.
    /// Intended to be spawned as a detached task.
    pub async fn run(&self, events: EventSender) {
        let live_chat_id = match self.discover_live_chat_id().await {
            Ok(id) => id,
            Err(e) => {
                log::error!("failed to discover youtube live chat id: {}", e);
                return;
            }
        };

        let mut dedup_set: HashSet<String> = HashSet::new();
        let mut dedup_order: VecDeque<String> = VecDeque::new();
        let mut page_token: Option<String> = None;
        let mut consecutive_empty: u32 = 0;

        loop {
            match self.poll_once(&live_chat_id, page_token.as_deref()).await {
                Ok(page) => {
                    let had_items = !page.items.is_empty();
                    for item in page.items {
                        let id = item.id.clone();
                        if dedup_set.contains(&id) {
                            continue;
                        }
                        if dedup_order.len() >= DEDUP_CAPACITY {
                            if let Some(oldest) = dedup_order.pop_front() {
                                dedup_set.remove(&oldest);
                            }
                        }
                        dedup_set.insert(id.clone());
                        dedup_order.push_back(id);

                        if let Some(event) = to_chat_event(item) {
                            let _ = events.send(event);
                        }
                    }

                    page_token = page.next_page_token;
                    consecutive_empty = if had_items { 0 } else { consecutive_empty + 1 };
                    let delay = adaptive_delay(page.polling_interval_millis, consecutive_empty);
                    tokio::time::sleep(delay).await;
                }
                Err(PollError::Forbidden) => {
                    log::error!("youtube api returned 403, backing off {}s", FORBIDDEN_BACKOFF_SECS);
                    tokio::time::sleep(Duration::from_secs(FORBIDDEN_BACKOFF_SECS)).await;
                }
                Err(PollError::Other(e)) => {
                    log::warn!("youtube poll failed: {}, retrying at floor interval", e);
                    tokio::time::sleep(Duration::from_millis(POLL_FLOOR_MILLIS)).await;
                }
            }
        }
    }

    async fn discover_live_chat_id(&self) -> Result<String, String> {
        if let Some(video_id) = &self.video_id {
            let resp = self
                .client
                .get("https://www.googleapis.com/youtube/v3/videos")
                .query(&[("part", "liveStreamingDetails"), ("id", video_id.as_str()), ("key", self.api_key.as_str())])
                .send()
                .await
                .map_err(|e| e.to_string())?;
            let body: VideosResponse = resp.json().await.map_err(|e| e.to_string())?;
            return body
                .items
                .into_iter()
                .next()
                .and_then(|v| v.live_streaming_details.active_live_chat_id)
                .ok_or_else(|| "video has no active live chat".to_string());
        }

        let resp = self
            .client
            .get("https://www.googleapis.com/youtube/v3/liveBroadcasts")
            .query(&[("part", "snippet"), ("broadcastStatus", "active"), ("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let body: BroadcastsResponse = resp.json().await.map_err(|e| e.to_string())?;
        body.items
            .into_iter()
            .next()
            .and_then(|b| b.snippet.live_chat_id)
            .ok_or_else(|| "no active broadcast found".to_string())
    }

    async fn poll_once(&self, live_chat_id: &str, page_token: Option<&str>) -> Result<LiveChatMessagesPage, PollError> {
        let mut query = vec![
            ("liveChatId".to_string(), live_chat_id.to_string()),
            ("part".to_string(), "snippet,authorDetails".to_string()),
            ("key".to_string(), self.api_key.clone()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken".to_string(), token.to_string()));
        }

        let resp = self
            .client
            .get("https://www.googleapis.com/youtube/v3/liveChat/messages")
            .query(&query)
            .send()
            .await
            .map_err(|e| PollError::Other(e.to_string()))?;

        if resp.status().as_u16() == 403 {
            return Err(PollError::Forbidden);
        }
        if !resp.status().is_success() {
            return Err(PollError::Other(format!("status {}", resp.status())));
        }

        resp.json().await.map_err(|e| PollError::Other(e.to_string()))
    }
}

enum PollError {
    Forbidden,
    Other(String),
}

fn adaptive_delay(api_polling_interval_millis: u64, consecutive_empty: u32) -> Duration {
    let base = api_polling_interval_millis.max(POLL_FLOOR_MILLIS);
    if consecutive_empty <= EMPTY_POLL_BACKOFF_THRESHOLD {
        return Duration::from_millis(base);
    }
    let multiplier = (1.0 + 0.5 * (consecutive_empty - EMPTY_POLL_BACKOFF_THRESHOLD) as f64).min(3.0);
    let millis = ((base as f64) * multiplier) as u64;
    Duration::from_millis(millis.min(POLL_CEILING_MILLIS))
}

fn to_chat_event(item: LiveChatMessageItem) -> Option<ChatEvent> {
    let author = item.author_details?;
    let user = author.display_name.clone()?;
    let snippet = item.snippet?;
    let text = snippet
        .display_message
        .clone()
        .or_else(|| snippet.text_message_details.and_then(|d| d.message_text))?;

    let is_privileged = author.is_chat_moderator || author.is_chat_owner || author.is_chat_sponsor;
    let event_type = match snippet.message_type.as_deref() {
        Some("superChatEvent") | Some("superStickerEvent") => "bits",
        Some("newSponsorEvent") | Some("memberMilestoneChatEvent") | Some("membershipGiftingEvent") => "sub",
        Some("textMessageEvent") if is_privileged => "vip",
        _ if is_privileged => "vip",
        _ => "chat",
    };

    Some(ChatEvent::Chat {
        user,
        text,
        event_type: event_type.to_string(),
        source_tags: SourceTags::default(),
    })
}

#[derive(Deserialize)]
struct LiveChatMessagesPage {
    items: Vec<LiveChatMessageItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "pollingIntervalMillis", default = "default_polling_interval")]
    polling_interval_millis: u64,
}

fn default_polling_interval() -> u64 {
    POLL_FLOOR_MILLIS
}

#[derive(Deserialize)]
struct LiveChatMessageItem {
    id: String,
    snippet: Option<LiveChatMessageSnippet>,
    #[serde(rename = "authorDetails")]
    author_details: Option<AuthorDetails>,
}

#[derive(Deserialize)]
struct LiveChatMessageSnippet {
    #[serde(rename = "type")]
    message_type: Option<String>,
    #[serde(rename = "displayMessage")]
    display_message: Option<String>,
    #[serde(rename = "textMessageDetails")]
    text_message_details: Option<TextMessageDetails>,
}

#[derive(Deserialize)]
struct TextMessageDetails {
    #[serde(rename = "messageText")]
    message_text: Option<String>,
}

#[derive(Deserialize)]
struct AuthorDetails {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "isChatModerator", default)]
    is_chat_moderator: bool,
    #[serde(rename = "isChatOwner", default)]
    is_chat_owner: bool,
    #[serde(rename = "isChatSponsor", default)]
    is_chat_sponsor: bool,
}

#[derive(Deserialize)]
struct BroadcastsResponse {
    items: Vec<BroadcastItem>,
}

#[derive(Deserialize)]
struct BroadcastItem {
    snippet: BroadcastSnippet,
}

#[derive(Deserialize)]
struct BroadcastSnippet {
    #[serde(rename = "liveChatId")]
    live_chat_id: Option<String>,
}

#[derive(Deserialize)]
struct VideosResponse {
    items: Vec<VideoItem>,
}

#[derive(Deserialize)]
struct VideoItem {
    #[serde(rename = "liveStreamingDetails")]
    live_streaming_details: LiveStreamingDetails,
}

#[derive(Deserialize)]
struct LiveStreamingDetails {
    #[serde(rename = "activeLiveChatId")]
    active_live_chat_id: Option<String>,
}
