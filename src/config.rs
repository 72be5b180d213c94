//! Engine configuration
//!
//! Static relay list, negotiation tuning and signaling endpoint.
//! Defaults match the public relays the app has always shipped with;
//! a deployment overrides them through `DUOCALL_*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default relay endpoint for the synchronized store
pub const DEFAULT_SIGNALING_URL: &str = "https://duocall-relay.example.net";

// ============================================================================
// ICE SERVERS
// ============================================================================

/// One STUN or TURN relay entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

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

    pub fn is_turn(&self) -> bool {
        self.urls.iter().any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Ordered fallback relays: public STUN first, then the open TURN relay on
/// UDP 80, 443 and TCP 443.
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
        IceServerConfig::turn(
            "turn:openrelay.metered.ca:80",
            "openrelayproject",
            "openrelayproject",
        ),
        IceServerConfig::turn(
            "turn:openrelay.metered.ca:443",
            "openrelayproject",
            "openrelayproject",
        ),
        IceServerConfig::turn(
            "turn:openrelay.metered.ca:443?transport=tcp",
            "openrelayproject",
            "openrelayproject",
        ),
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Relays in the order ICE should try them
    pub ice_servers: Vec<IceServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// Bundle all media on one transport (max-bundle)
    pub max_bundle: bool,
    /// Failed-connectivity reports tolerated before a call counts as dropped
    pub max_ice_restarts: u32,
    /// Attempts per signaling write before the write counts as failed
    pub publish_attempts: u32,
    #[serde(with = "millis")]
    pub publish_backoff: Duration,
    /// How long the relay store may take to acknowledge a write
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    pub signaling_url: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: 2,
            max_bundle: true,
            max_ice_restarts: 2,
            publish_attempts: 3,
            publish_backoff: Duration::from_millis(250),
            ack_timeout: Duration::from_secs(10),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
        }
    }
}

impl CallConfig {
    /// Defaults overlaid with `DUOCALL_SIGNALING_URL` and the
    /// `DUOCALL_TURN_URL` / `_USERNAME` / `_CREDENTIAL` triple.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DUOCALL_SIGNALING_URL") {
            config.signaling_url = url;
        }

        if let Ok(url) = std::env::var("DUOCALL_TURN_URL") {
            let username = std::env::var("DUOCALL_TURN_USERNAME").unwrap_or_default();
            let credential = std::env::var("DUOCALL_TURN_CREDENTIAL").unwrap_or_default();
            config = config.with_turn_server(url, username, credential);
        }

        config
    }

    /// Appends a TURN relay behind the built-in list
    pub fn with_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers
            .push(IceServerConfig::turn(url, username, credential));
        self
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relays_stun_before_turn() {
        let servers = default_ice_servers();
        assert_eq!(servers.len(), 5);
        assert!(!servers[0].is_turn());
        assert!(!servers[1].is_turn());
        assert!(servers[2..].iter().all(|s| s.is_turn()));
        assert_eq!(
            servers[4].urls[0],
            "turn:openrelay.metered.ca:443?transport=tcp"
        );
    }

    #[test]
    fn test_with_turn_server_appends_last() {
        let config = CallConfig::default().with_turn_server("turn:relay.local:3478", "u", "p");
        let last = config.ice_servers.last().unwrap();
        assert_eq!(last.urls, vec!["turn:relay.local:3478".to_string()]);
        assert_eq!(last.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_rtc_ice_servers_carry_credentials() {
        let rtc = CallConfig::default().rtc_ice_servers();
        assert_eq!(rtc[0].username, "");
        assert_eq!(rtc[2].username, "openrelayproject");
        assert_eq!(rtc[2].credential, "openrelayproject");
    }

    #[test]
    fn test_config_json_roundtrip_uses_millis() {
        let json = serde_json::to_value(CallConfig::default()).unwrap();
        assert_eq!(json["publish_backoff"], 250);
        assert_eq!(json["ice_candidate_pool_size"], 2);

        let parsed: CallConfig =
            serde_json::from_str(r#"{"max_ice_restarts": 5, "ack_timeout": 1500}"#).unwrap();
        assert_eq!(parsed.max_ice_restarts, 5);
        assert_eq!(parsed.ack_timeout, Duration::from_millis(1500));
        assert_eq!(parsed.publish_attempts, 3);
    }
}
