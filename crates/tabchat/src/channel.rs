use std::fmt;

use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

const HOME_CHANNEL: &str = "home";
const HASHTAG_SEGMENT: &str = "hashtag";

/// Name of the broadcast scope shared by every tab on the same page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(raw: impl Into<String>) -> ChatResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ChatError::InvalidChannel(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Derive a channel from a page path: the homepage maps to `home`,
    /// `/hashtag/<tag>` maps to the tag, anything else to its last segment.
    pub fn from_page_path(path: &str) -> Self {
        let segments: Vec<&str> = path
            .split('/')
            .filter(|s| !s.trim().is_empty())
            .collect();
        let picked = match segments.iter().position(|s| *s == HASHTAG_SEGMENT) {
            Some(index) if index + 1 < segments.len() => segments.get(index + 1),
            _ => segments.last(),
        };
        picked
            .and_then(|segment| Self::new(*segment).ok())
            .unwrap_or_else(|| Self(HOME_CHANNEL.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn topic(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one participant, stamped as the origin of everything it
/// publishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
