use super::EventSender;
use crate::broadcast_hub::{BroadcastHub, PlaybackEvent};
use crate::models::{ChatEvent, SourceTags};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";
const MAX_BACKOFF_SECS: u64 = 60;

/// Subtypes the reference UI never renders as TTS; dropped at the adapter so the
/// orchestrator never sees them.
const NOISY_USERNOTICE_SUBTYPES: &[&str] = &[
    "sub", "resub", "subgift", "submysterygift", "giftpaidupgrade", "rewardgift", "anongiftpaidupgrade",
    "raid", "unraid", "ritual", "bitsbadgetier",
];

pub struct TwitchAdapter {
    oauth_token: String,
    nickname: String,
    channel: String,
    broadcast: Arc<BroadcastHub>,
}

impl TwitchAdapter {
    pub fn new(oauth_token: String, nickname: String, channel: String, broadcast: Arc<BroadcastHub>) -> Self {
        Self {
            oauth_token,
            nickname,
            channel: channel.to_lowercase(),
            broadcast,
        }
    }

    /// Runs forever, reconnecting with exponential backoff on any connection loss.
    /// Intended to be spawned as a detached task.
    pub async fn run(&self, events: EventSender) {
        let mut backoff = 1u64;
        loop {
            match self.connect_and_read(&events).await {
                Ok(()) => {
                    log::info!("twitch connection closed cleanly, reconnecting");
                    backoff = 1;
                }
                Err(TwitchError::AuthRejected) => {
                    log::error!("twitch oauth token rejected");
                    self.broadcast
                        .broadcast(&PlaybackEvent::TwitchAuthError {
                            message: "oauth token rejected",
                        })
                        .await;
                    return;
                }
                Err(TwitchError::Connection(e)) => {
                    log::warn!("twitch connection error: {}, retrying in {}s", e, backoff);
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn connect_and_read(&self, events: &EventSender) -> Result<(), TwitchError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(IRC_WS_URL)
            .await
            .map_err(|e| TwitchError::Connection(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text("CAP REQ :twitch.tv/tags twitch.tv/commands".to_string()))
            .await
            .map_err(|e| TwitchError::Connection(e.to_string()))?;
        write
            .send(Message::Text(format!("PASS oauth:{}", self.oauth_token.trim_start_matches("oauth:"))))
            .await
            .map_err(|e| TwitchError::Connection(e.to_string()))?;
        write
            .send(Message::Text(format!("NICK {}", self.nickname)))
            .await
            .map_err(|e| TwitchError::Connection(e.to_string()))?;
        write
            .send(Message::Text(format!("JOIN #{}", self.channel)))
            .await
            .map_err(|e| TwitchError::Connection(e.to_string()))?;

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| TwitchError::Connection(e.to_string()))?;
            let Message::Text(line) = msg else { continue };
            for raw_line in line.split("\r\n").filter(|l| !l.is_empty()) {
                if raw_line.contains("Login authentication failed") || raw_line.contains("Improperly formatted auth") {
                    return Err(TwitchError::AuthRejected);
                }
                if raw_line.starts_with("PING") {
                    let reply = raw_line.replacen("PING", "PONG", 1);
                    let _ = write.send(Message::Text(reply)).await;
                    continue;
                }
                if let Some(event) = parse_irc_line(raw_line) {
                    let _ = events.send(event);
                }
            }
        }
        Ok(())
    }
}

enum TwitchError {
    AuthRejected,
    Connection(String),
}

struct IrcMessage<'a> {
    tags: HashMap<String, String>,
    command: &'a str,
    params: Vec<&'a str>,
    trailing: Option<&'a str>,
}

fn parse_irc_line(line: &str) -> Option<ChatEvent> {
    let message = parse_irc_message(line)?;
    match message.command {
        "PRIVMSG" => {
            let user = message
                .tags
                .get("display-name")
                .cloned()
                .unwrap_or_else(|| message.params.first().map(|s| s.to_string()).unwrap_or_default());
            let text = message.trailing?.to_string();
            let event_type = derive_privmsg_event_type(&message.tags);
            let emote_offsets = message
                .tags
                .get("emotes")
                .map(|raw| parse_emote_offsets(raw))
                .unwrap_or_default();
            Some(ChatEvent::Chat {
                user,
                text,
                event_type,
                source_tags: SourceTags { emote_offsets },
            })
        }
        "USERNOTICE" => {
            let msg_id = message.tags.get("msg-id")?;
            if NOISY_USERNOTICE_SUBTYPES.contains(&msg_id.as_str()) {
                return None;
            }
            let user = message.tags.get("display-name").cloned()?;
            let text = message.trailing.unwrap_or_default().to_string();
            Some(ChatEvent::Chat {
                user,
                text,
                event_type: msg_id.clone(),
                source_tags: SourceTags::default(),
            })
        }
        "CLEARCHAT" => {
            let target_user = message
                .trailing
                .map(|s| s.to_string())
                .or_else(|| message.tags.get("target-user-id").cloned())?;
            let duration_secs = message.tags.get("ban-duration").and_then(|d| d.parse().ok());
            Some(ChatEvent::Moderation {
                target_user,
                duration_secs,
            })
        }
        _ => None,
    }
}

/// Parses the `emotes` tag (`id:start-end,start-end/id2:start-end`) into the
/// flat list of (start, end-exclusive) spans the message filter strips.
fn parse_emote_offsets(raw: &str) -> Vec<(usize, usize)> {
    let mut offsets = Vec::new();
    for entry in raw.split('/') {
        let Some((_id, ranges)) = entry.split_once(':') else { continue };
        for range in ranges.split(',') {
            if let Some((start, end)) = range.split_once('-') {
                if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                    offsets.push((start, end + 1));
                }
            }
        }
    }
    offsets
}

fn derive_privmsg_event_type(tags: &HashMap<String, String>) -> String {
    if let Some(badges) = tags.get("badges") {
        if badges.split(',').any(|b| b.starts_with("vip/")) {
            return "vip".to_string();
        }
    }
    if tags.get("highlighted-message").map(|v| v == "1").unwrap_or(false) {
        return "highlight".to_string();
    }
    "chat".to_string()
}

fn parse_irc_message(line: &str) -> Option<IrcMessage<'_>> {
    let mut rest = line;
    let mut tags = HashMap::new();

    if let Some(stripped) = rest.strip_prefix('@') {
        let (tag_part, remainder) = stripped.split_once(' ')?;
        rest = remainder;
        for pair in tag_part.split(';') {
            if let Some((key, value)) = pair.split_once('=') {
                tags.insert(key.to_string(), unescape_tag_value(value));
            }
        }
    }

    if let Some(stripped) = rest.strip_prefix(':') {
        let (_prefix, remainder) = stripped.split_once(' ')?;
        rest = remainder;
    }

    let (before_trailing, trailing) = match rest.split_once(" :") {
        Some((before, after)) => (before, Some(after)),
        None => (rest, None),
    };

    let mut parts = before_trailing.split_whitespace();
    let command = parts.next()?;
    let params: Vec<&str> = parts.collect();

    Some(IrcMessage {
        tags,
        command,
        params,
        trailing,
    })
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('s') => out.push(' '),
                Some(':') => out.push(';'),
                Some('\\') => out.push('\\'),
                Some('r') => out.push('\r'),
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_privmsg_as_chat() {
        let line = ":foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hello world";
        let event = parse_irc_line(line).unwrap();
        match event {
            ChatEvent::Chat { user, text, event_type, .. } => {
                assert_eq!(user, "foo");
                assert_eq!(text, "hello world");
                assert_eq!(event_type, "chat");
            }
            _ => panic!("expected chat event"),
        }
    }

    #[test]
    fn vip_badge_derives_vip_event_type() {
        let line = "@badges=vip/1;display-name=Foo :foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hi";
        let event = parse_irc_line(line).unwrap();
        match event {
            ChatEvent::Chat { event_type, user, .. } => {
                assert_eq!(event_type, "vip");
                assert_eq!(user, "Foo");
            }
            _ => panic!("expected chat event"),
        }
    }

    #[test]
    fn clearchat_with_duration_is_timeout() {
        let line = "@ban-duration=600 :tmi.twitch.tv CLEARCHAT #bar :baduser";
        let event = parse_irc_line(line).unwrap();
        match event {
            ChatEvent::Moderation { target_user, duration_secs } => {
                assert_eq!(target_user, "baduser");
                assert_eq!(duration_secs, Some(600));
            }
            _ => panic!("expected moderation event"),
        }
    }

    #[test]
    fn clearchat_without_duration_is_permanent_ban() {
        let line = ":tmi.twitch.tv CLEARCHAT #bar :baduser";
        let event = parse_irc_line(line).unwrap();
        match event {
            ChatEvent::Moderation { duration_secs, .. } => assert_eq!(duration_secs, None),
            _ => panic!("expected moderation event"),
        }
    }

    #[test]
    fn noisy_usernotice_subtypes_are_dropped() {
        let line = "@msg-id=resub :tmi.twitch.tv USERNOTICE #bar :thanks for resubbing";
        assert!(parse_irc_line(line).is_none());
    }

    #[test]
    fn emotes_tag_parses_into_offsets() {
        let offsets = parse_emote_offsets("25:0-4,12-16/1902:6-10");
        assert_eq!(offsets, vec![(0, 5), (12, 17), (6, 11)]);
    }

    #[test]
    fn privmsg_carries_emote_offsets_through() {
        let line = "@emotes=25:0-4;display-name=Foo :foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :Kappa hello";
        let event = parse_irc_line(line).unwrap();
        match event {
            ChatEvent::Chat { source_tags, .. } => assert_eq!(source_tags.emote_offsets, vec![(0, 5)]),
            _ => panic!("expected chat event"),
        }
    }

    #[test]
    fn announcement_usernotice_passes_through() {
        let line = "@msg-id=announcement;display-name=Mod :tmi.twitch.tv USERNOTICE #bar :heads up";
        let event = parse_irc_line(line).unwrap();
        match event {
            ChatEvent::Chat { event_type, .. } => assert_eq!(event_type, "announcement"),
            _ => panic!("expected chat event"),
        }
    }
}
