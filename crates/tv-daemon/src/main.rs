mod core;
mod mpv;
mod player;
mod scheduler;
mod socket;

use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tv_proto::channels::{
    load_channels_from_toml, parse_channels_from_toml_str, ChannelRegistry, DEFAULT_CHANNELS_TOML,
};
use tv_proto::config::Config;
use tv_proto::progress::ProgressStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File logging under the data dir; the terminal stays clean for mpv.
    let data_dir = tv_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tv_daemon=debug")),
        )
        .init();

    info!("log file: {:?}", log_path);

    let config = Config::load()?;
    info!("config loaded from: {:?}", Config::config_path());

    let registry = ChannelRegistry::new(load_lineup(&config)?)?;
    info!("{} channels in the lineup", registry.count());

    let store = ProgressStore::open(config.daemon.state_file.clone());

    // Event channel — all external inputs funnel into the state machine.
    let (event_tx, event_rx) = mpsc::channel::<core::CoreEvent>(256);
    let (broadcast_tx, _) = broadcast::channel(64);

    let tv = core::TvCore::new(
        registry,
        store,
        mpv::MpvBackend::new(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.socket.enabled {
        let _socket_handle = socket::start_server(
            config.socket.bind_address.clone(),
            config.socket.port,
            tv.state_handle(),
            event_tx,
            broadcast_tx,
        );
    }

    info!("televizor initialised, running event loop");
    tv.run(event_rx).await?;

    Ok(())
}

/// Loads the channel lineup, writing the demo lineup on first run so the TV
/// works out of the box.
fn load_lineup(config: &Config) -> anyhow::Result<Vec<tv_proto::channels::Channel>> {
    let path = &config.channels.channels_toml;
    if path.exists() {
        let channels = load_channels_from_toml(path)?;
        info!("loaded {} channels from {:?}", channels.len(), path);
        return Ok(channels);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CHANNELS_TOML)?;
    info!("no channel lineup found, wrote demo lineup to {:?}", path);
    parse_channels_from_toml_str(DEFAULT_CHANNELS_TOML)
}
