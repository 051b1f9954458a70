mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tabchat::{
    ChannelId, ChatConfig, ChatEvent, ChatEvents, ElectionState, MemoryNetwork, MessageOrigin,
    Participant, ParticipantHandle, PeerConnector,
};
use tracing::info;
use transport_bus::{Bus, LocalBus};
use transport_webrtc::{WebRtcConfig, WebRtcConnector};

use crate::telemetry::{DEFAULT_LOG_FILTER, init_tracing};

/// Runs two chat tabs in one process and lets them find each other.
#[derive(Parser, Debug)]
#[command(name = "tabchat-loopback")]
struct Args {
    /// Page path both tabs are showing; the channel is derived from it.
    #[arg(long, env = "TABCHAT_PAGE", default_value = "/")]
    page: String,
    /// Connect over real WebRTC data channels instead of the in-memory network.
    #[arg(long)]
    webrtc: bool,
    /// Line the first tab sends once connected.
    #[arg(long, default_value = "hello from the other tab")]
    message: String,
    /// Delay before the second tab opens.
    #[arg(long, default_value_t = 100)]
    stagger_ms: u64,
    /// Give up if the tabs have not exchanged the message by then.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    #[arg(long, env = "TABCHAT_LOG", default_value = DEFAULT_LOG_FILTER)]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log);

    let config = ChatConfig::from_env();
    let channel = ChannelId::from_page_path(&args.page);
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let (first_connector, second_connector) = connectors(args.webrtc)?;

    info!(
        channel = %channel,
        webrtc = args.webrtc,
        presence_ms = config.presence_interval.as_millis() as u64,
        reconnect_ms = config.reconnect_delay.as_millis() as u64,
        "starting loopback tabs"
    );

    let (mut first, mut first_events) = Participant::spawn(
        bus.clone(),
        channel.clone(),
        first_connector,
        config.clone(),
    )
    .context("spawn first tab")?;
    tokio::time::sleep(Duration::from_millis(args.stagger_ms)).await;
    let (mut second, mut second_events) =
        Participant::spawn(bus, channel, second_connector, config).context("spawn second tab")?;

    let limit = Duration::from_secs(args.timeout_secs);
    let exchange = async {
        wait_until("first", &mut first_events, |event| {
            *event == ChatEvent::Status(ElectionState::Connected)
        })
        .await?;
        wait_until("second", &mut second_events, |event| {
            *event == ChatEvent::Status(ElectionState::Connected)
        })
        .await?;
        report_roles(&first, &second).await?;

        first.send_text(args.message.as_str())?;
        wait_until("second", &mut second_events, |event| {
            matches!(event, ChatEvent::Message(message) if message.origin == MessageOrigin::Peer)
        })
        .await?;
        Ok::<_, anyhow::Error>(())
    };
    let outcome = tokio::time::timeout(limit, exchange).await;

    first.teardown().await;
    second.teardown().await;

    match outcome {
        Ok(result) => result,
        Err(_) => bail!(
            "tabs did not exchange a message within {}s",
            args.timeout_secs
        ),
    }
}

type ConnectorPair = (Arc<dyn PeerConnector>, Arc<dyn PeerConnector>);

fn connectors(webrtc: bool) -> Result<ConnectorPair> {
    if webrtc {
        let config = WebRtcConfig::from_env();
        info!(ice_servers = ?config.ice_servers, "using webrtc connector");
        Ok((
            Arc::new(WebRtcConnector::new(config.clone())?),
            Arc::new(WebRtcConnector::new(config)?),
        ))
    } else {
        let network = MemoryNetwork::new();
        Ok((
            Arc::new(network.connector("first")),
            Arc::new(network.connector("second")),
        ))
    }
}

async fn wait_until(
    tab: &str,
    events: &mut ChatEvents,
    wanted: impl Fn(&ChatEvent) -> bool,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        match &event {
            ChatEvent::Message(message) => {
                info!(tab, origin = ?message.origin, text = %message.text, "chat")
            }
            ChatEvent::Status(state) => info!(tab, state = ?state, "status"),
        }
        if wanted(&event) {
            return Ok(());
        }
    }
    bail!("{tab} tab stopped before the expected event")
}

async fn report_roles(first: &ParticipantHandle, second: &ParticipantHandle) -> Result<()> {
    for (tab, handle) in [("first", first), ("second", second)] {
        let snapshot = handle.snapshot().await?;
        let role = snapshot.connection.map(|info| info.role.to_string());
        info!(
            tab,
            participant = %snapshot.participant,
            role = role.as_deref().unwrap_or("none"),
            connections = snapshot.connections_created,
            "peer linked"
        );
    }
    Ok(())
}
