//! Wire format of the discovery protocol.
//!
//! Presence and signal envelopes travel as tagged JSON over the broadcast
//! channel. Chat text travels as `{"text": ...}` over the established peer
//! link and never touches the broadcast channel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ChatResult};

/// Opaque connection-setup data produced by the peer transport.
pub type SignalPayload = Value;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEnvelope {
    PresenceCheck,
    PresenceResponse,
    Signal(SignalPayload),
    ChatData(String),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum BroadcastFrame {
    PresenceCheck,
    PresenceResponse,
    Signal { data: Value },
}

#[derive(Serialize, Deserialize)]
struct ChatFrame {
    text: String,
}

impl SignalEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalEnvelope::PresenceCheck => "presence-check",
            SignalEnvelope::PresenceResponse => "presence-response",
            SignalEnvelope::Signal(_) => "signal",
            SignalEnvelope::ChatData(_) => "chat-data",
        }
    }

    pub fn is_broadcast(&self) -> bool {
        !matches!(self, SignalEnvelope::ChatData(_))
    }

    /// Encode for whichever medium the envelope belongs to.
    pub fn encode(&self) -> ChatResult<Bytes> {
        let bytes = match self {
            SignalEnvelope::PresenceCheck => serde_json::to_vec(&BroadcastFrame::PresenceCheck),
            SignalEnvelope::PresenceResponse => {
                serde_json::to_vec(&BroadcastFrame::PresenceResponse)
            }
            SignalEnvelope::Signal(data) => {
                serde_json::to_vec(&BroadcastFrame::Signal { data: data.clone() })
            }
            SignalEnvelope::ChatData(text) => {
                serde_json::to_vec(&ChatFrame { text: text.clone() })
            }
        }
        .map_err(|err| ChatError::MalformedPayload(err.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    pub fn decode_broadcast(bytes: &[u8]) -> ChatResult<Self> {
        let frame: BroadcastFrame = serde_json::from_slice(bytes)
            .map_err(|err| ChatError::MalformedPayload(err.to_string()))?;
        Ok(match frame {
            BroadcastFrame::PresenceCheck => SignalEnvelope::PresenceCheck,
            BroadcastFrame::PresenceResponse => SignalEnvelope::PresenceResponse,
            BroadcastFrame::Signal { data } => SignalEnvelope::Signal(data),
        })
    }

    pub fn decode_chat(bytes: &[u8]) -> ChatResult<Self> {
        let frame: ChatFrame = serde_json::from_slice(bytes)
            .map_err(|err| ChatError::MalformedPayload(err.to_string()))?;
        Ok(SignalEnvelope::ChatData(frame.text))
    }
}
