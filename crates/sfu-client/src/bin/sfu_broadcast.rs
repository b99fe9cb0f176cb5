//! Announce an external RTP sender to the SFU
//!
//! Creates one plain transport per media kind (comedia, no rtcp-mux), registers
//! an Opus audio and a VP8 video producer on them and prints where the sender
//! should push its RTP. Pair it with any RTP source, for example:
//!
//! ```text
//! ffmpeg -re -i input.mp4 \
//!   -map 0:a:0 -c:a libopus -payload_type 100 -ssrc 1111 -f rtp rtp://IP:AUDIO_PORT?rtcpport=AUDIO_RTCP_PORT \
//!   -map 0:v:0 -c:v libvpx -payload_type 101 -ssrc 2222 -f rtp rtp://IP:VIDEO_PORT?rtcpport=VIDEO_RTCP_PORT
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value, json};
use sfu_client::{ClientOptions, SfuClient};
use sfu_protocol::{MediaKind, PlainTransportResponse, RtpCodecParameters, RtpParameters};
use std::time::Duration;

const AUDIO_PAYLOAD_TYPE: u8 = 100;
const AUDIO_SSRC: u32 = 1111;
const VIDEO_PAYLOAD_TYPE: u8 = 101;
const VIDEO_SSRC: u32 = 2222;

#[derive(Parser, Debug)]
#[command(
    name = "sfu-broadcast",
    about = "Register an external RTP sender as audio/video producers on the SFU",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "SFU_URL",
        default_value = "ws://127.0.0.1:8080/ws",
        help = "WebSocket URL of the signaling server"
    )]
    url: String,

    #[arg(long, help = "Produce into this existing session instead of the default one")]
    session: Option<String>,

    #[arg(
        long,
        value_name = "NAME",
        conflicts_with = "session",
        help = "Create a new session with this name and produce into it"
    )]
    create: Option<String>,

    #[arg(long, default_value_t = 15, help = "Per-request timeout in seconds")]
    timeout_secs: u64,
}

fn audio_parameters() -> RtpParameters {
    let mut parameters = Map::new();
    parameters.insert("sprop-stereo".to_string(), json!(1));

    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: AUDIO_PAYLOAD_TYPE,
            clock_rate: 48000,
            channels: Some(2),
            parameters,
            rtcp_feedback: vec![],
        }],
        encodings: vec![json!({ "ssrc": AUDIO_SSRC })],
        ..Default::default()
    }
}

fn video_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: VIDEO_PAYLOAD_TYPE,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![json!({ "ssrc": VIDEO_SSRC })],
        ..Default::default()
    }
}

fn describe(kind: MediaKind, transport: &PlainTransportResponse) -> String {
    match transport.rtcp_port {
        Some(rtcp_port) => format!(
            "{kind}: rtp://{}:{} (rtcp {})",
            transport.ip, transport.port, rtcp_port
        ),
        None => format!("{kind}: rtp://{}:{}", transport.ip, transport.port),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_client=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let client = SfuClient::connect_with(
        &cli.url,
        ClientOptions {
            request_timeout: Duration::from_secs(cli.timeout_secs),
        },
    )
    .await
    .with_context(|| format!("failed to connect to {}", cli.url))?;

    if let Some(name) = cli.create {
        let created = client.create_session(Some(name)).await?;
        println!("Created session {} ({})", created.id, created.name);
    } else if let Some(session) = cli.session {
        client.set_session(Some(session)).await;
    }

    let audio_transport = client
        .create_plain_transport(Some(false), Some(true))
        .await
        .context("failed to create audio transport")?;
    let video_transport = client
        .create_plain_transport(Some(false), Some(true))
        .await
        .context("failed to create video transport")?;

    let audio = client
        .produce(
            &audio_transport.id,
            MediaKind::Audio,
            audio_parameters(),
            Value::Null,
        )
        .await
        .context("failed to produce audio")?;
    let video = client
        .produce(
            &video_transport.id,
            MediaKind::Video,
            video_parameters(),
            Value::Null,
        )
        .await
        .context("failed to produce video")?;

    match client.session_id().await {
        Some(id) => println!("Session: {id}"),
        None => println!("Session: (server default)"),
    }
    println!("{}", describe(MediaKind::Audio, &audio_transport));
    println!("  producer {} pt={} ssrc={}", audio.id, AUDIO_PAYLOAD_TYPE, AUDIO_SSRC);
    println!("{}", describe(MediaKind::Video, &video_transport));
    println!("  producer {} pt={} ssrc={}", video.id, VIDEO_PAYLOAD_TYPE, VIDEO_SSRC);
    println!("Press Ctrl+C to stop");

    // Transports live as long as this connection
    tokio::signal::ctrl_c().await?;
    client.close();
    Ok(())
}
