//! In-process stand-in for a real peer transport.
//!
//! A [`MemoryNetwork`] plays the part of the network between tabs. An
//! initiator link publishes an offer token as its signal; a responder fed
//! that offer answers with its own token; the initiator fed the answer
//! pairs the two links and both report `Connected`. Connection attempts are
//! recorded and faults can be injected, which is what the protocol tests
//! lean on.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::{ConnectionId, PeerConnector, PeerError, PeerEvent, PeerEventSink, PeerLink, Role};
use crate::envelope::SignalPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryLinkId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub owner: String,
    pub link: MemoryLinkId,
    pub connection: ConnectionId,
    pub role: Role,
    pub at: Instant,
}

struct LinkEnd {
    owner: String,
    sink: PeerEventSink,
    role: Role,
    peer: Option<MemoryLinkId>,
    offer: Option<u64>,
    answered: Option<u64>,
}

#[derive(Default)]
struct Switchboard {
    next_link: u64,
    next_token: u64,
    ends: HashMap<MemoryLinkId, LinkEnd>,
    // offer token -> initiator link
    offers: HashMap<u64, MemoryLinkId>,
    // answer token -> responder link
    answers: HashMap<u64, MemoryLinkId>,
    attempts: Vec<ConnectAttempt>,
    refuse: HashMap<String, String>,
}

impl Switchboard {
    fn emit(&self, link: MemoryLinkId, event: PeerEvent) -> bool {
        self.ends
            .get(&link)
            .map(|end| end.sink.emit(event))
            .unwrap_or(false)
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn forget_tokens(&mut self, link: MemoryLinkId) {
        self.offers.retain(|_, owner| *owner != link);
        self.answers.retain(|_, owner| *owner != link);
    }
}

/// Shared switchboard; hand one connector per participant.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    board: Arc<Mutex<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, owner: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            owner: owner.into(),
            board: self.board.clone(),
        }
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.board.lock().attempts.clone()
    }

    pub fn attempts_by(&self, owner: &str) -> Vec<ConnectAttempt> {
        self.board
            .lock()
            .attempts
            .iter()
            .filter(|attempt| attempt.owner == owner)
            .cloned()
            .collect()
    }

    /// Most recent link opened by `owner` that is still open.
    pub fn live_link(&self, owner: &str) -> Option<MemoryLinkId> {
        let board = self.board.lock();
        board
            .ends
            .iter()
            .filter(|(_, end)| end.owner == owner)
            .map(|(id, _)| *id)
            .max()
    }

    pub fn is_paired(&self, link: MemoryLinkId) -> bool {
        self.board
            .lock()
            .ends
            .get(&link)
            .is_some_and(|end| end.peer.is_some())
    }

    pub fn inject_error(&self, link: MemoryLinkId, message: impl Into<String>) -> bool {
        self.board.lock().emit(link, PeerEvent::Error(message.into()))
    }

    /// Deliver raw bytes to `link` as if its peer had sent them.
    pub fn inject_data(&self, link: MemoryLinkId, data: Bytes) -> bool {
        self.board.lock().emit(link, PeerEvent::Data(data))
    }

    /// Cut the wire under a pair: both ends report `Closed`.
    pub fn sever(&self, link: MemoryLinkId) {
        let mut board = self.board.lock();
        let peer = board.ends.get_mut(&link).and_then(|end| end.peer.take());
        board.emit(link, PeerEvent::Closed);
        if let Some(peer) = peer {
            if let Some(end) = board.ends.get_mut(&peer) {
                end.peer = None;
            }
            board.emit(peer, PeerEvent::Closed);
        }
    }

    /// Make the next connect by `owner` fail synchronously.
    pub fn refuse_next(&self, owner: impl Into<String>, reason: impl Into<String>) {
        self.board.lock().refuse.insert(owner.into(), reason.into());
    }
}

pub struct MemoryConnector {
    owner: String,
    board: Arc<Mutex<Switchboard>>,
}

impl PeerConnector for MemoryConnector {
    fn connect(&self, role: Role, sink: PeerEventSink) -> Result<Box<dyn PeerLink>, PeerError> {
        let mut board = self.board.lock();
        if let Some(reason) = board.refuse.remove(&self.owner) {
            return Err(PeerError::Setup(reason));
        }
        board.next_link += 1;
        let id = MemoryLinkId(board.next_link);
        let connection = sink.connection();
        board.attempts.push(ConnectAttempt {
            owner: self.owner.clone(),
            link: id,
            connection,
            role,
            at: Instant::now(),
        });
        let offer = role.is_initiator().then(|| board.token());
        board.ends.insert(
            id,
            LinkEnd {
                owner: self.owner.clone(),
                sink,
                role,
                peer: None,
                offer,
                answered: None,
            },
        );
        if let Some(token) = offer {
            board.offers.insert(token, id);
            board.emit(id, PeerEvent::Signal(json!({"type": "offer", "offer": token})));
        }
        Ok(Box::new(MemoryLink {
            id,
            board: self.board.clone(),
        }))
    }
}

pub struct MemoryLink {
    id: MemoryLinkId,
    board: Arc<Mutex<Switchboard>>,
}

fn token_field(payload: &Value, field: &str) -> Result<u64, PeerError> {
    payload
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| PeerError::UnexpectedSignal(format!("missing {field} token")))
}

impl PeerLink for MemoryLink {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), PeerError> {
        let mut board = self.board.lock();
        let (role, paired, own_offer, answered) = match board.ends.get(&self.id) {
            Some(end) => (end.role, end.peer.is_some(), end.offer, end.answered),
            None => return Err(PeerError::Closed),
        };
        if paired {
            return Ok(());
        }
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        match (role, kind) {
            (Role::Responder, "offer") => {
                let offer = token_field(&payload, "offer")?;
                if answered == Some(offer) {
                    return Ok(());
                }
                if !board.offers.contains_key(&offer) {
                    return Err(PeerError::UnexpectedSignal(format!("unknown offer {offer}")));
                }
                let answer = board.token();
                board.answers.insert(answer, self.id);
                if let Some(end) = board.ends.get_mut(&self.id) {
                    end.answered = Some(offer);
                }
                board.emit(
                    self.id,
                    PeerEvent::Signal(json!({"type": "answer", "offer": offer, "answer": answer})),
                );
                Ok(())
            }
            (Role::Initiator, "answer") => {
                let offer = token_field(&payload, "offer")?;
                let answer = token_field(&payload, "answer")?;
                if own_offer != Some(offer) {
                    return Err(PeerError::UnexpectedSignal(format!(
                        "answer for foreign offer {offer}"
                    )));
                }
                let responder = board
                    .answers
                    .get(&answer)
                    .copied()
                    .filter(|id| board.ends.get(id).is_some_and(|end| end.peer.is_none()))
                    .ok_or_else(|| PeerError::UnexpectedSignal(format!("stale answer {answer}")))?;
                board.offers.remove(&offer);
                board.answers.remove(&answer);
                if let Some(end) = board.ends.get_mut(&self.id) {
                    end.peer = Some(responder);
                }
                if let Some(end) = board.ends.get_mut(&responder) {
                    end.peer = Some(self.id);
                }
                board.emit(self.id, PeerEvent::Connected);
                board.emit(responder, PeerEvent::Connected);
                Ok(())
            }
            (role, kind) => Err(PeerError::UnexpectedSignal(format!(
                "{role} cannot handle {kind:?} signal"
            ))),
        }
    }

    fn send(&mut self, data: Bytes) -> Result<(), PeerError> {
        let board = self.board.lock();
        let peer = board
            .ends
            .get(&self.id)
            .and_then(|end| end.peer)
            .ok_or(PeerError::NotConnected)?;
        if board.emit(peer, PeerEvent::Data(data)) {
            Ok(())
        } else {
            Err(PeerError::Send("peer went away".into()))
        }
    }

    fn close(&mut self) {
        let mut board = self.board.lock();
        board.forget_tokens(self.id);
        let Some(end) = board.ends.remove(&self.id) else {
            return;
        };
        if let Some(peer) = end.peer {
            if let Some(other) = board.ends.get_mut(&peer) {
                other.peer = None;
            }
            board.emit(peer, PeerEvent::Closed);
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}
