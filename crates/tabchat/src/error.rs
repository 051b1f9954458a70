use thiserror::Error;
use transport_bus::BusError;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The broadcast adapter was used after `close()`.
    #[error("broadcast channel is closed")]
    ClosedChannel,
    #[error("no connected peer")]
    NoActivePeer,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("peer connection setup failed: {0}")]
    ConnectionSetupFailure(String),
    /// A connection is already negotiating or connected.
    #[error("a peer connection is already active")]
    CreateConnectionRejected,
    #[error("invalid channel id: {0:?}")]
    InvalidChannel(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("broadcast transport unavailable: {0}")]
    TransportInit(#[source] BusError),
    #[error("broadcast publish failed: {0}")]
    Broadcast(#[source] BusError),
}

pub type ChatResult<T> = Result<T, ChatError>;
