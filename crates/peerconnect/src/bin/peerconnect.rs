//! peerconnect command-line client
//!
//! Signs in to a signaling server, optionally connects to another alias,
//! sends every stdin line to all connected peers and prints what they send
//! back.
//!
//! # Usage
//!
//! ```bash
//! # Sign in as alice and wait for peers
//! cargo run --bin peerconnect -- \
//!   --signal-url ws://localhost:8080 \
//!   --user alice --password secret --alias alice
//!
//! # Sign in as bob and connect to alice
//! cargo run --bin peerconnect -- \
//!   --user bob --password secret --alias bob --connect alice
//!
//! # Read url and credentials from a settings document
//! cargo run --bin peerconnect -- --settings ./settings.json --alias carol
//! ```

use anyhow::Context;
use clap::Parser;
use peerconnect::{
    ChannelObserver, Control, ControlEvent, Credentials, PeerConnectConfig, WebRtcEngineFactory,
    WebSocketConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long Ctrl-C waits for sign-out to complete
const SIGN_OUT_WAIT: Duration = Duration::from_secs(5);

/// Peer-to-peer data channel client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling server URL
    #[arg(long, default_value = "ws://localhost:8080", env = "PEERCONNECT_SIGNAL_URL")]
    signal_url: String,

    /// User id to sign in with
    #[arg(long, env = "PEERCONNECT_USER")]
    user: Option<String>,

    /// Password to sign in with
    #[arg(long, env = "PEERCONNECT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Channel name other peers connect to
    #[arg(long, env = "PEERCONNECT_ALIAS")]
    alias: String,

    /// Alias to connect to once signed in
    #[arg(long)]
    connect: Option<String>,

    /// Settings document with url, user_id and user_password
    #[arg(long, env = "PEERCONNECT_SETTINGS")]
    settings: Option<PathBuf>,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    stun_servers: Vec<String>,

    /// Log as JSON lines
    #[arg(long, default_value_t = false, env = "PEERCONNECT_LOG_JSON")]
    log_json: bool,
}

/// Build the configuration and credentials from CLI arguments
///
/// A settings document replaces `--signal-url`; explicit `--user` and
/// `--password` override its credentials.
fn build_config_from_args(args: &Args) -> anyhow::Result<(PeerConnectConfig, Credentials)> {
    let (config, mut credentials) = match &args.settings {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings {}", path.display()))?;
            PeerConnectConfig::from_settings_json(&json)?
        }
        None => (
            PeerConnectConfig::default().with_signal_url(&args.signal_url),
            Credentials::default(),
        ),
    };

    if let Some(user) = &args.user {
        credentials.user_id = user.clone();
    }
    if let Some(password) = &args.password {
        credentials.user_password = password.clone();
    }
    if credentials.user_id.is_empty() {
        anyhow::bail!("No user id: pass --user or a settings document with user_id");
    }

    let config = config.with_stun_servers(args.stun_servers.clone());
    config.validate()?;
    Ok((config, credentials))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let (config, credentials) = build_config_from_args(&args)?;

    info!(
        version = peerconnect::version(),
        signal_url = %config.signal.url,
        alias = %args.alias,
        "peerconnect starting"
    );

    let engines = Arc::new(WebRtcEngineFactory::new(config.engine.clone())?);
    let (observer, mut events) = ChannelObserver::new();
    let control = Control::spawn(
        config,
        Arc::new(WebSocketConnector::new()),
        engines,
        &observer,
    )?;

    control.sign_in_with(credentials, &args.alias);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, signing out");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Event stream ended");
                    break;
                };
                match event {
                    ControlEvent::SignedIn(channel) => {
                        info!(%channel, "Signed in");
                        if let Some(remote) = &args.connect {
                            control.connect(remote);
                        }
                    }
                    ControlEvent::PeerConnected(remote_id) => info!(peer_id = %remote_id, "Peer connected"),
                    ControlEvent::PeerDisconnected(remote_id) => info!(peer_id = %remote_id, "Peer disconnected"),
                    ControlEvent::PeerMessage { remote_id, data } => {
                        println!("[{}] {}", remote_id, String::from_utf8_lossy(&data));
                    }
                    ControlEvent::Error { id, reason } => error!(%id, "{}", reason),
                    _ => {}
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        match control.broadcast(line.into_bytes()).await {
                            Ok(0) => warn!("No connected peers"),
                            Ok(_) => {}
                            Err(e) => warn!("Broadcast failed: {}", e),
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    control.sign_out();
    let signed_out = tokio::time::timeout(SIGN_OUT_WAIT, async {
        while let Some(event) = events.recv().await {
            if let ControlEvent::SignedOut(alias) = event {
                return Some(alias);
            }
        }
        None
    })
    .await;
    match signed_out {
        Ok(Some(alias)) => info!(%alias, "Signed out"),
        _ => warn!("Sign-out did not complete within {:?}", SIGN_OUT_WAIT),
    }

    tokio::task::spawn_blocking(move || control.shutdown()).await?;
    info!("peerconnect stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("peerconnect=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
