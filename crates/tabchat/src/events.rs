use crate::election::ElectionState;

/// Who a chat line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOrigin {
    /// Typed in this tab.
    Local,
    Peer,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    pub origin: MessageOrigin,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>, origin: MessageOrigin) -> Self {
        Self {
            text: text.into(),
            origin,
        }
    }
}

/// What the UI collaborator gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message(ChatMessage),
    Status(ElectionState),
}

pub const NOTICE_STARTED: &str = "Chat initialized. Waiting for peers...";
pub const NOTICE_CONNECTED: &str = "Connected to peer!";
pub const NOTICE_ERROR: &str = "Connection error. Retrying...";
pub const NOTICE_CLOSED: &str = "Peer disconnected. Attempting to reconnect...";
pub const NOTICE_STALLED: &str = "Peer did not answer. Waiting for peers...";
pub const NOTICE_GAVE_UP: &str = "Giving up on reconnecting. Waiting for peers...";
