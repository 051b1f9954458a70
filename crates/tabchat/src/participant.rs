use std::future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use transport_bus::Bus;

use crate::channel::{ChannelId, ParticipantId};
use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::events::ChatEvent;
use crate::lifecycle::{LifecycleManager, ParticipantSnapshot};
use crate::peer::{PeerConnector, PeerNotice};
use crate::transport::{ChannelSubscription, open_channel};

/// Stream of messages and status changes for the UI.
pub type ChatEvents = mpsc::UnboundedReceiver<ChatEvent>;

enum Command {
    SendText(String),
    Snapshot(oneshot::Sender<ParticipantSnapshot>),
    Teardown(oneshot::Sender<()>),
}

pub struct Participant;

impl Participant {
    /// Join `channel` on `bus` and start looking for a peer. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        bus: Arc<dyn Bus>,
        channel: ChannelId,
        connector: Arc<dyn PeerConnector>,
        config: ChatConfig,
    ) -> ChatResult<(ParticipantHandle, ChatEvents)> {
        config.validate()?;
        let id = ParticipantId::random();
        let (publisher, subscription) =
            open_channel(bus, &channel, &config.channel_prefix, id.clone())?;
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let manager =
            LifecycleManager::new(config.clone(), publisher, connector, peer_tx, events_tx);
        info!(
            target = "tabchat.participant",
            participant = %id,
            channel = %channel,
            "spawning participant"
        );
        let task = tokio::spawn(run(manager, subscription, commands_rx, peer_rx, config));

        Ok((
            ParticipantHandle {
                id,
                channel,
                commands: commands_tx,
                task: Some(task),
            },
            events_rx,
        ))
    }
}

/// Owner's side of a running participant. Dropping it tears the
/// participant down.
pub struct ParticipantHandle {
    id: ParticipantId,
    channel: ChannelId,
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl ParticipantHandle {
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Queue a chat line. Text sent while no peer is connected is echoed
    /// locally and otherwise dropped.
    pub fn send_text(&self, text: impl Into<String>) -> ChatResult<()> {
        self.commands
            .send(Command::SendText(text.into()))
            .map_err(|_| ChatError::ClosedChannel)
    }

    pub async fn snapshot(&self) -> ChatResult<ParticipantSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| ChatError::ClosedChannel)?;
        rx.await.map_err(|_| ChatError::ClosedChannel)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the participant and wait for its task to finish. Calling it
    /// again is a no-op.
    pub async fn teardown(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Teardown(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Err(err) = task.await {
            warn!(
                target = "tabchat.participant",
                participant = %self.id,
                error = %err,
                "participant task ended abnormally"
            );
        }
    }
}

async fn run(
    mut manager: LifecycleManager,
    mut subscription: ChannelSubscription,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut peer_rx: mpsc::UnboundedReceiver<PeerNotice>,
    config: ChatConfig,
) {
    let start = Instant::now();
    manager.start(start);

    let mut presence = time::interval_at(
        start + config.presence_interval,
        config.presence_interval,
    );
    presence.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drain = time::interval_at(start + config.drain_interval, config.drain_interval);
    drain.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = manager.next_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::SendText(text)) => {
                    if let Err(err) = manager.send_text(&text) {
                        debug!(target = "tabchat.participant", error = %err, "chat line not delivered");
                    }
                }
                Some(Command::Snapshot(reply)) => {
                    let _ = reply.send(manager.snapshot());
                }
                Some(Command::Teardown(done)) => {
                    manager.teardown();
                    let _ = done.send(());
                    break;
                }
                None => {
                    debug!(target = "tabchat.participant", "handle dropped, tearing down");
                    manager.teardown();
                    break;
                }
            },
            message = subscription.recv() => match message {
                Ok(message) => manager.on_broadcast(Instant::now(), message),
                Err(err) => {
                    warn!(target = "tabchat.participant", error = %err, "broadcast channel lost");
                    manager.teardown();
                    break;
                }
            },
            Some(notice) = peer_rx.recv() => manager.on_peer_notice(Instant::now(), notice),
            _ = presence.tick() => manager.on_presence_tick(Instant::now()),
            _ = drain.tick() => manager.on_drain_tick(Instant::now()),
            _ = sleep_until(deadline) => manager.on_deadline(Instant::now()),
        }
    }
    subscription.close();
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
