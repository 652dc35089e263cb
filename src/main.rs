use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_mesh::config::{self, PreferenceStore, VoiceConfig};
use voice_mesh::events::VoiceEvent;
use voice_mesh::ice::IceCredentialProvider;
use voice_mesh::media::SyntheticDevices;
use voice_mesh::signaling::MemoryHub;
use voice_mesh::webrtc::WebRtcTransportFactory;
use voice_mesh::{Identity, VoiceClient, VoiceServices};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// voice-mesh diagnostics
#[derive(Parser, Debug)]
#[command(name = "voice-mesh")]
#[command(version, about = "Full-mesh WebRTC voice engine diagnostics", long_about = None)]
struct CliArgs {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data directory for stored preferences
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short = 'l', long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved ICE server list
    IceServers,

    /// Show or edit stored preferences
    Prefs {
        #[command(subcommand)]
        action: Option<PrefsAction>,
    },

    /// Join two in-process participants and report what happens
    Loopback {
        /// How long to stay in the call
        #[arg(short = 's', long, default_value_t = 10)]
        seconds: u64,

        /// Disable neural noise suppression on both participants
        #[arg(long)]
        no_denoise: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PrefsAction {
    /// Print preferences as JSON
    Show,
    /// Preferred microphone ("default" clears it)
    SetInput { device_id: String },
    /// Preferred output device ("default" clears it)
    SetOutput { device_id: String },
    /// Playback volume for a participant (0.0 - 1.0)
    SetVolume { uid: String, volume: f32 },
    /// Local speech detector threshold
    SetVadThreshold { threshold: f32 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("voice-mesh v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(args.config.as_deref()).await?;

    match args.command {
        Command::IceServers => print_ice_servers(&config).await?,
        Command::Prefs { action } => {
            let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
            let store = PreferenceStore::new(&data_dir.join("voice-mesh.db")).await?;
            run_prefs(&store, action.unwrap_or(PrefsAction::Show)).await?;
        }
        Command::Loopback {
            seconds,
            no_denoise,
        } => {
            let mut config = config;
            if no_denoise {
                config.audio.noise_suppression = false;
            }
            run_loopback(config, Duration::from_secs(seconds)).await?;
        }
    }

    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "voice_mesh=error,webrtc=error",
        LogLevel::Warn => "voice_mesh=warn,webrtc=warn",
        LogLevel::Info => "voice_mesh=info,webrtc=warn",
        LogLevel::Verbose => "voice_mesh=debug,webrtc=warn",
        LogLevel::Debug => "voice_mesh=debug,webrtc=info",
        LogLevel::Trace => "voice_mesh=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the preference data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("VOICE_MESH_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from(".voice-mesh")
}

async fn print_ice_servers(config: &VoiceConfig) -> anyhow::Result<()> {
    let provider = IceCredentialProvider::from_config(&config.ice)?;
    let servers = provider.get_ice_servers().await;
    if !servers.iter().any(|s| s.is_turn()) {
        tracing::info!("No TURN servers available, using STUN only");
    }
    println!("{}", serde_json::to_string_pretty(&servers)?);
    Ok(())
}

fn device_choice(device_id: String) -> Option<String> {
    (device_id != "default").then_some(device_id)
}

async fn run_prefs(store: &PreferenceStore, action: PrefsAction) -> anyhow::Result<()> {
    match action {
        PrefsAction::Show => {}
        PrefsAction::SetInput { device_id } => {
            store
                .update(|p| p.selected_input = device_choice(device_id))
                .await?
        }
        PrefsAction::SetOutput { device_id } => {
            store
                .update(|p| p.selected_output = device_choice(device_id))
                .await?
        }
        PrefsAction::SetVolume { uid, volume } => {
            store
                .update(|p| {
                    p.user_volumes.insert(uid, volume.clamp(0.0, 1.0));
                })
                .await?
        }
        PrefsAction::SetVadThreshold { threshold } => {
            store.update(|p| p.vad_threshold = threshold).await?
        }
    }
    println!("{}", serde_json::to_string_pretty(&*store.get())?);
    Ok(())
}

async fn loopback_participant(
    uid: &str,
    frequency: f32,
    hub: &MemoryHub,
    config: &VoiceConfig,
) -> anyhow::Result<Arc<VoiceClient>> {
    let services = VoiceServices {
        directory: Arc::new(hub.clone()),
        transports: Arc::new(WebRtcTransportFactory::new(&config.transport, &config.audio)),
        devices: Arc::new(SyntheticDevices::with_default_tone(frequency)),
        ice: Arc::new(IceCredentialProvider::from_config(&config.ice)?),
        prefs: PreferenceStore::in_memory().await?,
    };
    Ok(Arc::new(VoiceClient::new(
        Identity::new(uid, uid),
        config.clone(),
        services,
    )))
}

async fn run_loopback(config: VoiceConfig, duration: Duration) -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let alice = loopback_participant("alice", 440.0, &hub, &config).await?;
    let bob = loopback_participant("bob", 660.0, &hub, &config).await?;

    let mut events = alice.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                VoiceEvent::PeerStateChanged { peer_id, state } => {
                    println!("alice: peer {} {}", peer_id, state)
                }
                VoiceEvent::SpeakingChanged { uid, speaking } => {
                    println!("alice: {} speaking={}", uid, speaking)
                }
                VoiceEvent::VoiceError { message } => println!("alice: error: {}", message),
                _ => {}
            }
        }
    });

    let (joined_alice, joined_bob) = futures::join!(
        alice.join("loopback", "voice"),
        bob.join("loopback", "voice")
    );
    if !joined_alice || !joined_bob {
        let error = alice.state().error.or(bob.state().error);
        futures::join!(alice.leave(), bob.leave());
        anyhow::bail!(
            "failed to join: {}",
            error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    for client in [&alice, &bob] {
        let state = client.state();
        println!("{}:", client.uid());
        for (peer, connection) in &state.peers {
            println!("  {} {} speaking={}", peer, connection, state.is_speaking(peer));
        }
        println!("  self speaking={}", state.is_speaking(client.uid()));
    }

    futures::join!(alice.leave(), bob.leave());
    Ok(())
}
