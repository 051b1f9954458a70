//! Seam between the lifecycle manager and whatever actually carries bytes
//! between two tabs.
//!
//! A connector opens links in a given role. Links report progress by
//! pushing [`PeerEvent`]s into the sink they were created with; the
//! lifecycle manager consumes them from a single queue, so a link never
//! calls back into its owner.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::envelope::SignalPayload;

pub mod memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Identifies one connection attempt for the lifetime of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Setup data the other side must receive out of band.
    Signal(SignalPayload),
    Connected,
    Data(Bytes),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerNotice {
    pub connection: ConnectionId,
    pub event: PeerEvent,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer setup failed: {0}")]
    Setup(String),
    #[error("peer link is not connected")]
    NotConnected,
    #[error("unexpected signal: {0}")]
    UnexpectedSignal(String),
    #[error("peer send failed: {0}")]
    Send(String),
    #[error("peer link closed")]
    Closed,
}

/// Where a link reports its events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<PeerNotice>,
}

impl PeerEventSink {
    pub fn new(connection: ConnectionId, tx: mpsc::UnboundedSender<PeerNotice>) -> Self {
        Self { connection, tx }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns false once the owning participant has gone away.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerNotice {
                connection: self.connection,
                event,
            })
            .is_ok()
    }
}

pub trait PeerConnector: Send + Sync {
    fn connect(&self, role: Role, sink: PeerEventSink) -> Result<Box<dyn PeerLink>, PeerError>;
}

pub trait PeerLink: Send {
    /// Feed setup data received from the other side.
    fn signal(&mut self, payload: SignalPayload) -> Result<(), PeerError>;
    fn send(&mut self, data: Bytes) -> Result<(), PeerError>;
    /// Release the link. Anything it emits afterwards is treated as stale.
    fn close(&mut self);
}
