use std::env;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::protocol::DATA_CHANNEL_LABEL;

const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One STUN or TURN entry handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN relay with a shared credential.
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub(crate) fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Settings shared by every attempt a session makes.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Signaling endpoint used when a call does not name one.
    pub signaling_url: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
    pub channel_label: String,
    /// Liveness probes sent after the channel opens; 0 disables them.
    pub probe_count: u32,
    pub probe_interval: Duration,
    /// Unset means negotiation may take as long as it takes.
    pub negotiation_timeout: Option<Duration>,
    pub include_loopback: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            signaling_url: None,
            ice_servers: DEFAULT_STUN_URLS.iter().map(|url| IceServer::stun(*url)).collect(),
            candidate_pool_size: 10,
            channel_label: DATA_CHANNEL_LABEL.to_string(),
            probe_count: 3,
            probe_interval: Duration::from_secs(1),
            negotiation_timeout: None,
            include_loopback: false,
        }
    }
}

impl LinkConfig {
    pub fn builder() -> LinkConfigBuilder {
        LinkConfigBuilder::default()
    }

    /// Localhost-only: no STUN/TURN, loopback candidates allowed.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback: true,
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        let localhost_only = env_flag("LIQUID_LOCALHOST_ONLY");
        let mut ice_servers = if localhost_only {
            Vec::new()
        } else {
            match env::var("LIQUID_STUN_URLS") {
                Ok(value) => value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(IceServer::stun)
                    .collect(),
                Err(_) => defaults.ice_servers.clone(),
            }
        };
        if !localhost_only {
            if let Ok(url) = env::var("LIQUID_TURN_URL") {
                let username = env::var("LIQUID_TURN_USERNAME").unwrap_or_default();
                let credential = env::var("LIQUID_TURN_CREDENTIAL").unwrap_or_default();
                ice_servers.push(IceServer::turn(url, username, credential));
            }
        }

        Self {
            signaling_url: env::var("LIQUID_SIGNALING_URL").ok(),
            ice_servers,
            candidate_pool_size: env_parse("LIQUID_ICE_CANDIDATE_POOL")
                .unwrap_or(defaults.candidate_pool_size),
            channel_label: defaults.channel_label,
            probe_count: env_parse("LIQUID_PROBE_COUNT").unwrap_or(defaults.probe_count),
            probe_interval: env_parse("LIQUID_PROBE_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_interval),
            negotiation_timeout: env_parse("LIQUID_NEGOTIATION_TIMEOUT_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis),
            include_loopback: localhost_only,
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

#[derive(Debug, Default)]
pub struct LinkConfigBuilder {
    signaling_url: Option<String>,
    ice_servers: Option<Vec<IceServer>>,
    candidate_pool_size: Option<u8>,
    channel_label: Option<String>,
    probe_count: Option<u32>,
    probe_interval: Option<Duration>,
    negotiation_timeout: Option<Duration>,
    include_loopback: Option<bool>,
}

impl LinkConfigBuilder {
    pub fn signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = Some(url.into());
        self
    }

    /// Adds a server; the first call replaces the default STUN list.
    pub fn ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.get_or_insert_with(Vec::new).push(server);
        self
    }

    pub fn no_ice_servers(mut self) -> Self {
        self.ice_servers = Some(Vec::new());
        self
    }

    pub fn candidate_pool_size(mut self, size: u8) -> Self {
        self.candidate_pool_size = Some(size);
        self
    }

    pub fn channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = Some(label.into());
        self
    }

    pub fn probe(mut self, count: u32, interval: Duration) -> Self {
        self.probe_count = Some(count);
        self.probe_interval = Some(interval);
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }

    pub fn include_loopback(mut self, include: bool) -> Self {
        self.include_loopback = Some(include);
        self
    }

    pub fn build(self) -> LinkConfig {
        let defaults = LinkConfig::default();
        LinkConfig {
            signaling_url: self.signaling_url.or(defaults.signaling_url),
            ice_servers: self.ice_servers.unwrap_or(defaults.ice_servers),
            candidate_pool_size: self
                .candidate_pool_size
                .unwrap_or(defaults.candidate_pool_size),
            channel_label: self.channel_label.unwrap_or(defaults.channel_label),
            probe_count: self.probe_count.unwrap_or(defaults.probe_count),
            probe_interval: self.probe_interval.unwrap_or(defaults.probe_interval),
            negotiation_timeout: self.negotiation_timeout.or(defaults.negotiation_timeout),
            include_loopback: self.include_loopback.unwrap_or(defaults.include_loopback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_public_stun_and_three_probes() {
        let config = LinkConfig::default();
        assert_eq!(config.ice_servers.len(), DEFAULT_STUN_URLS.len());
        assert_eq!(config.channel_label, "liquid");
        assert_eq!(config.probe_count, 3);
        assert_eq!(config.probe_interval, Duration::from_secs(1));
        assert!(config.negotiation_timeout.is_none());
    }

    #[test]
    fn builder_replaces_default_servers() {
        let config = LinkConfig::builder()
            .ice_server(IceServer::turn("turn:relay.example.com:3478", "user", "secret"))
            .probe(0, Duration::from_millis(10))
            .build();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("user"));
        assert_eq!(config.probe_count, 0);
    }

    #[test]
    fn turn_server_carries_credentials_to_rtc() {
        let rtc = IceServer::turn("turn:relay.example.com:3478", "user", "secret").to_rtc();
        assert_eq!(rtc.urls, vec!["turn:relay.example.com:3478".to_string()]);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "secret");

        let stun = IceServer::stun("stun:stun.example.com:3478").to_rtc();
        assert!(stun.username.is_empty());
    }

    #[test]
    fn localhost_config_has_no_servers() {
        let config = LinkConfig::localhost();
        assert!(config.ice_servers.is_empty());
        assert!(config.include_loopback);
    }
}
