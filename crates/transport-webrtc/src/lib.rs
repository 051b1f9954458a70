//! WebRTC data-channel links for tabchat.
//!
//! Each link runs on its own task. Descriptions are exchanged whole once
//! ICE gathering completes, so a connection needs exactly one offer and one
//! answer on the broadcast channel.

mod config;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tabchat::{PeerConnector, PeerError, PeerEvent, PeerEventSink, PeerLink, Role, SignalPayload};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub use config::{DEFAULT_DATA_CHANNEL_LABEL, DEFAULT_ICE_SERVERS, WebRtcConfig};

#[derive(Debug, Error)]
pub enum WebRtcError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("ice gathering timed out")]
    GatherTimeout,
    #[error("no local description after ice gathering")]
    MissingDescription,
    #[error("no tokio runtime available")]
    NoRuntime,
}

impl From<WebRtcError> for PeerError {
    fn from(err: WebRtcError) -> Self {
        PeerError::Setup(err.to_string())
    }
}

/// Opens WebRTC links on the runtime it was created on.
pub struct WebRtcConnector {
    config: WebRtcConfig,
    runtime: Handle,
}

impl WebRtcConnector {
    pub fn new(config: WebRtcConfig) -> Result<Self, WebRtcError> {
        let runtime = Handle::try_current().map_err(|_| WebRtcError::NoRuntime)?;
        Ok(Self { config, runtime })
    }
}

impl PeerConnector for WebRtcConnector {
    fn connect(&self, role: Role, sink: PeerEventSink) -> Result<Box<dyn PeerLink>, PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let events = LinkEvents {
            sink,
            open: open.clone(),
            closed: closed.clone(),
        };
        debug!(
            target = "tabchat.webrtc",
            connection = %events.sink.connection(),
            %role,
            "spawning webrtc link"
        );
        self.runtime.spawn(drive_link(self.config.clone(), role, events, rx));
        Ok(Box::new(WebRtcLink {
            commands: tx,
            open,
            closed,
        }))
    }
}

enum LinkCommand {
    Signal(SignalPayload),
    Send(Bytes),
    Close,
}

pub struct WebRtcLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
    open: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl PeerLink for WebRtcLink {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), PeerError> {
        self.commands
            .send(LinkCommand::Signal(payload))
            .map_err(|_| PeerError::Closed)
    }

    fn send(&mut self, data: Bytes) -> Result<(), PeerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(PeerError::NotConnected);
        }
        self.commands
            .send(LinkCommand::Send(data))
            .map_err(|_| PeerError::Closed)
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(LinkCommand::Close);
        }
    }
}

impl Drop for WebRtcLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sink wrapper that goes quiet once the owner closed the link.
#[derive(Clone)]
struct LinkEvents {
    sink: PeerEventSink,
    open: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl LinkEvents {
    fn emit(&self, event: PeerEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            self.sink.emit(event);
        }
    }
}

fn build_api() -> Result<API, WebRtcError> {
    let mut media = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

async fn drive_link(
    config: WebRtcConfig,
    role: Role,
    events: LinkEvents,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let connection = events.sink.connection();
    let peer = match open_peer(&config, role, &events).await {
        Ok(peer) => peer,
        Err(err) => {
            warn!(
                target = "tabchat.webrtc",
                %connection,
                error = %err,
                "webrtc setup failed"
            );
            events.emit(PeerEvent::Error(err.to_string()));
            return;
        }
    };

    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Signal(payload) => {
                if let Err(err) = peer.apply_signal(&config, role, payload, &events).await {
                    warn!(
                        target = "tabchat.webrtc",
                        %connection,
                        error = %err,
                        "failed to apply remote signal"
                    );
                }
            }
            LinkCommand::Send(data) => {
                let channel = peer.channel.lock().await.clone();
                match channel {
                    Some(channel) => {
                        if let Err(err) = channel.send(&data).await {
                            warn!(
                                target = "tabchat.webrtc",
                                %connection,
                                error = %err,
                                "data channel send failed"
                            );
                        }
                    }
                    None => debug!(target = "tabchat.webrtc", %connection, "no data channel yet"),
                }
            }
            LinkCommand::Close => break,
        }
    }

    events.closed.store(true, Ordering::SeqCst);
    if let Err(err) = peer.pc.close().await {
        debug!(target = "tabchat.webrtc", %connection, error = %err, "close failed");
    }
    info!(target = "tabchat.webrtc", %connection, "webrtc link closed");
}

struct Peer {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

async fn open_peer(
    config: &WebRtcConfig,
    role: Role,
    events: &LinkEvents,
) -> Result<Peer, WebRtcError> {
    let api = build_api()?;
    let pc = Arc::new(api.new_peer_connection(config.rtc_configuration()).await?);
    let channel = Arc::new(Mutex::new(None));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            debug!(target = "tabchat.webrtc", ?state, "peer connection state changed");
            match state {
                RTCPeerConnectionState::Failed => {
                    events.emit(PeerEvent::Error("peer connection failed".into()))
                }
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                    events.emit(PeerEvent::Closed)
                }
                _ => {}
            }
        })
    }));

    match role {
        Role::Initiator => {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(&config.data_channel_label, Some(init))
                .await?;
            attach_channel(&dc, events);
            *channel.lock().await = Some(dc);

            let offer = pc.create_offer(None).await?;
            let local = gather_local_description(&pc, offer, config).await?;
            events.emit(PeerEvent::Signal(description_to_signal(&local)?));
        }
        Role::Responder => {
            let dc_events = events.clone();
            let slot = channel.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = dc_events.clone();
                let slot = slot.clone();
                Box::pin(async move {
                    debug!(target = "tabchat.webrtc", label = dc.label(), "data channel received");
                    attach_channel(&dc, &events);
                    *slot.lock().await = Some(dc);
                })
            }));
        }
    }

    Ok(Peer { pc, channel })
}

impl Peer {
    async fn apply_signal(
        &self,
        config: &WebRtcConfig,
        role: Role,
        payload: SignalPayload,
        events: &LinkEvents,
    ) -> Result<(), WebRtcError> {
        let remote = signal_to_description(payload)?;
        if self.pc.remote_description().await.is_some() {
            debug!(target = "tabchat.webrtc", "remote description already set, ignoring");
            return Ok(());
        }
        match (role, remote.sdp_type) {
            (Role::Responder, RTCSdpType::Offer) => {
                self.pc.set_remote_description(remote).await?;
                let answer = self.pc.create_answer(None).await?;
                let local = gather_local_description(&self.pc, answer, config).await?;
                events.emit(PeerEvent::Signal(description_to_signal(&local)?));
                Ok(())
            }
            (Role::Initiator, RTCSdpType::Answer) => {
                self.pc.set_remote_description(remote).await?;
                Ok(())
            }
            (role, sdp_type) => Err(WebRtcError::InvalidSignal(format!(
                "{role} cannot apply {sdp_type}"
            ))),
        }
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, events: &LinkEvents) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            events.open.store(true, Ordering::SeqCst);
            events.emit(PeerEvent::Connected);
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            events.open.store(false, Ordering::SeqCst);
            events.emit(PeerEvent::Closed);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            events.emit(PeerEvent::Data(msg.data));
        })
    }));
}

/// Sets `description` locally and waits for gathering so the returned
/// description carries every candidate.
async fn gather_local_description(
    pc: &Arc<RTCPeerConnection>,
    description: RTCSessionDescription,
    config: &WebRtcConfig,
) -> Result<RTCSessionDescription, WebRtcError> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description).await?;
    tokio::time::timeout(config.gather_timeout, gathered.recv())
        .await
        .map_err(|_| WebRtcError::GatherTimeout)?;
    pc.local_description()
        .await
        .ok_or(WebRtcError::MissingDescription)
}

fn description_to_signal(description: &RTCSessionDescription) -> Result<SignalPayload, WebRtcError> {
    serde_json::to_value(description).map_err(|err| WebRtcError::InvalidSignal(err.to_string()))
}

fn signal_to_description(payload: SignalPayload) -> Result<RTCSessionDescription, WebRtcError> {
    serde_json::from_value(payload).map_err(|err| WebRtcError::InvalidSignal(err.to_string()))
}
