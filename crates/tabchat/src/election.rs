//! Role election among tabs sharing a channel.
//!
//! The first tab to observe another tab's PresenceCheck becomes the
//! responder and answers with a PresenceResponse; the tab that observes the
//! response becomes the initiator. Two tabs can observe each other's checks
//! before either response lands and both end up responding. Nothing here
//! breaks that tie: the stalled pair is abandoned by the lifecycle manager
//! and presence traffic runs the election again.

use crate::peer::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElectionState {
    Idle,
    AwaitingPeers,
    Initiator,
    Responder,
    Connected,
}

impl ElectionState {
    /// At most one connection may negotiate or be connected at a time.
    pub fn has_active_connection(self) -> bool {
        matches!(
            self,
            ElectionState::Initiator | ElectionState::Responder | ElectionState::Connected
        )
    }

    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Initiator => ElectionState::Initiator,
            Role::Responder => ElectionState::Responder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Check,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceDecision {
    Ignore,
    /// Open a responder connection and reply with a PresenceResponse.
    BecomeResponder,
    /// Open an initiator connection.
    BecomeInitiator,
}

pub fn decide(state: ElectionState, presence: Presence) -> PresenceDecision {
    match (state, presence) {
        (ElectionState::AwaitingPeers, Presence::Check) => PresenceDecision::BecomeResponder,
        (ElectionState::AwaitingPeers, Presence::Response) => PresenceDecision::BecomeInitiator,
        _ => PresenceDecision::Ignore,
    }
}

/// Whether the periodic presence tick should broadcast a PresenceCheck.
pub fn should_announce(state: ElectionState) -> bool {
    state == ElectionState::AwaitingPeers
}
