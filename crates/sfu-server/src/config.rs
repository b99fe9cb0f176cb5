//! Server settings
//!
//! Loaded once at startup: an optional file named by `SFU_CONFIG` (default
//! `config/sfu`), overridden by `SFU__SECTION__KEY` environment variables.

use crate::engine::{ListenIp, PlainTransportOptions, WebRtcTransportOptions, WorkerSettings};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use sfu_protocol::{MediaKind, RtpCodecCapability};
use std::time::Duration;

const UNSPECIFIED_IP: &str = "0.0.0.0";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub media: MediaSettings,
    /// Session created at startup and targeted by requests without an `id`
    pub default_session: Option<DefaultSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub ws_path: String,
    /// Directory served for every path no route claims
    pub static_dir: Option<String>,
    pub keepalive_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            ws_path: "/ws".to_string(),
            static_dir: None,
            keepalive_interval_secs: 30,
        }
    }
}

impl ServerSettings {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub worker: WorkerSettings,
    pub codecs: Vec<RtpCodecCapability>,
    pub webrtc_transport: WebRtcTransportOptions,
    pub plain_listen_ip: String,
    /// Public address advertised instead of the wildcard listen address
    pub announced_ip: Option<String>,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            codecs: default_media_codecs(),
            webrtc_transport: WebRtcTransportOptions::default(),
            plain_listen_ip: UNSPECIFIED_IP.to_string(),
            announced_ip: None,
        }
    }
}

impl MediaSettings {
    /// WebRTC transport options with the announced ip applied to wildcard listeners
    pub fn webrtc_options(&self, enable_sctp: Option<bool>) -> WebRtcTransportOptions {
        let mut options = self.webrtc_transport.clone();
        for listen in &mut options.listen_ips {
            self.announce(listen);
        }
        if let Some(enable_sctp) = enable_sctp {
            options.enable_sctp = enable_sctp;
        }
        options
    }

    pub fn plain_options(&self, rtcp_mux: Option<bool>, comedia: Option<bool>) -> PlainTransportOptions {
        let mut listen_ip = ListenIp::new(&self.plain_listen_ip);
        self.announce(&mut listen_ip);
        PlainTransportOptions {
            listen_ip,
            rtcp_mux: rtcp_mux.unwrap_or(true),
            comedia: comedia.unwrap_or(false),
        }
    }

    fn announce(&self, listen: &mut ListenIp) {
        if listen.ip == UNSPECIFIED_IP && listen.announced_ip.is_none() {
            listen.announced_ip = self.announced_ip.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultSession {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Opus, VP8 and H264, the codec set every router is created with by default
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = Map::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), json!(1000));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
            rtcp_feedback: vec![],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: vec![],
        },
    ]
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("SFU_CONFIG").unwrap_or_else(|_| "config/sfu".to_string());

        let mut settings: Settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("SFU")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        // Deployments that predate the settings file export MEDIASOUP_IP
        if settings.media.announced_ip.is_none() {
            if let Ok(ip) = std::env::var("MEDIASOUP_IP") {
                if !ip.is_empty() {
                    settings.media.announced_ip = Some(ip);
                }
            }
        }

        if settings.media.codecs.is_empty() {
            tracing::warn!("No media codecs configured, using defaults");
            settings.media.codecs = default_media_codecs();
        }

        Ok(settings)
    }
}
