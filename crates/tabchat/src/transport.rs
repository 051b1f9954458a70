use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use transport_bus::{Bus, BusError, BusMessage};

use crate::channel::{ChannelId, ParticipantId};
use crate::envelope::SignalEnvelope;
use crate::error::{ChatError, ChatResult};

/// Opens the channel-scoped adapter over a bus. The two halves share one
/// closed flag so the owner of either can shut both down.
pub fn open_channel(
    bus: Arc<dyn Bus>,
    channel: &ChannelId,
    prefix: &str,
    participant: ParticipantId,
) -> ChatResult<(ChannelPublisher, ChannelSubscription)> {
    let topic = channel.topic(prefix);
    let rx = bus.subscribe(&topic).map_err(ChatError::TransportInit)?;
    let closed = Arc::new(AtomicBool::new(false));
    debug!(
        target = "tabchat.transport",
        topic = %topic,
        participant = %participant,
        "subscribed to broadcast channel"
    );
    Ok((
        ChannelPublisher {
            bus,
            topic: topic.clone(),
            participant,
            closed: closed.clone(),
        },
        ChannelSubscription {
            topic,
            rx: Some(rx),
            closed,
        },
    ))
}

pub struct ChannelPublisher {
    bus: Arc<dyn Bus>,
    topic: String,
    participant: ParticipantId,
    closed: Arc<AtomicBool>,
}

impl ChannelPublisher {
    pub fn publish(&self, envelope: &SignalEnvelope) -> ChatResult<()> {
        if self.is_closed() {
            return Err(ChatError::ClosedChannel);
        }
        debug_assert!(envelope.is_broadcast(), "chat text never goes over broadcast");
        let payload = envelope.encode()?;
        trace!(
            target = "tabchat.transport",
            kind = envelope.kind(),
            topic = %self.topic,
            "publishing envelope"
        );
        self.bus
            .publish(&self.topic, self.participant.as_str(), payload)
            .map_err(|err| match err {
                BusError::Closed => ChatError::ClosedChannel,
                other => ChatError::Broadcast(other),
            })
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct ChannelSubscription {
    topic: String,
    rx: Option<broadcast::Receiver<BusMessage>>,
    closed: Arc<AtomicBool>,
}

impl ChannelSubscription {
    /// Next message on the channel, self-originated ones included.
    pub async fn recv(&mut self) -> ChatResult<BusMessage> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                self.rx = None;
                return Err(ChatError::ClosedChannel);
            }
            let rx = self.rx.as_mut().ok_or(ChatError::ClosedChannel)?;
            match rx.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        target = "tabchat.transport",
                        topic = %self.topic,
                        skipped,
                        "broadcast receiver lagged, oldest envelopes dropped"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.close();
                    return Err(ChatError::ClosedChannel);
                }
            }
        }
    }

    /// Non-blocking variant of [`ChannelSubscription::recv`]; `Ok(None)` when
    /// nothing is waiting.
    pub fn try_recv(&mut self) -> ChatResult<Option<BusMessage>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                self.rx = None;
                return Err(ChatError::ClosedChannel);
            }
            let rx = self.rx.as_mut().ok_or(ChatError::ClosedChannel)?;
            match rx.try_recv() {
                Ok(message) => return Ok(Some(message)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(
                        target = "tabchat.transport",
                        topic = %self.topic,
                        skipped,
                        "broadcast receiver lagged, oldest envelopes dropped"
                    );
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.close();
                    return Err(ChatError::ClosedChannel);
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rx = None;
    }
}
