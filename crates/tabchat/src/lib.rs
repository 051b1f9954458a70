//! Tab-to-tab chat over a shared broadcast bus.
//!
//! Tabs showing the same page join the same broadcast channel, find each
//! other with presence checks, elect an initiator and a responder, and
//! exchange connection-setup signals until a direct peer link is up. Chat
//! text then flows over that link only.
//!
//! [`Participant::spawn`] runs the whole protocol on a tokio task; the
//! [`lifecycle::LifecycleManager`] underneath is a plain state machine that
//! can be driven by hand.

pub mod channel;
pub mod config;
pub mod election;
pub mod envelope;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod participant;
pub mod peer;
pub mod throttle;
pub mod transport;

pub use channel::{ChannelId, ParticipantId};
pub use config::ChatConfig;
pub use election::ElectionState;
pub use envelope::{SignalEnvelope, SignalPayload};
pub use error::{ChatError, ChatResult};
pub use events::{ChatEvent, ChatMessage, MessageOrigin};
pub use lifecycle::{ConnectionInfo, ConnectionStatus, LifecycleManager, ParticipantSnapshot};
pub use participant::{ChatEvents, Participant, ParticipantHandle};
pub use peer::memory::{MemoryConnector, MemoryNetwork};
pub use peer::{
    ConnectionId, PeerConnector, PeerError, PeerEvent, PeerEventSink, PeerLink, PeerNotice, Role,
};
