use std::env;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "tabchat";
const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcConfig {
    /// STUN/TURN urls. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
    /// Upper bound on ICE gathering before a description is given up on.
    pub gather_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
        }
    }
}

impl WebRtcConfig {
    /// `TABCHAT_LOCALHOST_ONLY` drops every ICE server;
    /// `TABCHAT_ICE_SERVERS` (comma separated) replaces the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env::var("TABCHAT_LOCALHOST_ONLY").is_ok() {
            config.ice_servers.clear();
        } else if let Ok(raw) = env::var("TABCHAT_ICE_SERVERS") {
            let servers: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !servers.is_empty() {
                config.ice_servers = servers;
            }
        }
        config
    }

    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}
