use signage_daemon::core::TransmissionSupervisor;
use signage_daemon::encoder::FfmpegLauncher;
use signage_daemon::publisher::PlaylistPublisher;
use signage_daemon::{http, socket, BroadcastMessage};
use signage_proto::catalog::JsonCatalog;
use signage_proto::config::Config;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR go to socket clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = signage_proto::platform::data_dir();
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
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,signage_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    write_pid_file(&config.daemon.pid_file)?;

    let catalog = Arc::new(JsonCatalog::new(config.daemon.catalog_file.clone()));
    info!("Channel catalog: {:?}", catalog.path());
    let launcher = Arc::new(FfmpegLauncher::new(
        config.encoder.clone(),
        Some(config.daemon.log_dir.clone()),
    ));

    let (supervisor, handle) =
        TransmissionSupervisor::new(&config, catalog, launcher, broadcast_tx.clone());

    let publisher = PlaylistPublisher::new(&config.playlist);
    let playlist = publisher.view();
    let publisher_task = tokio::spawn(publisher.run(supervisor.live_receiver()));

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        signage_proto::platform::DAEMON_TCP_PORT,
        handle.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            handle.clone(),
            playlist,
        );
    }

    info!("Daemon initialised, running event loop");
    let core_task = tokio::spawn(supervisor.run());

    shutdown_signal().await;

    info!("Stopping all channels");
    if let Err(e) = handle.shutdown().await {
        error!("Shutdown incomplete: {}", e);
    }
    if let Err(e) = core_task.await {
        error!("Event loop task failed: {}", e);
    }
    // The loop dropped the live set sender; the publisher writes once more.
    if tokio::time::timeout(Duration::from_secs(5), publisher_task)
        .await
        .is_err()
    {
        warn!("Playlist publisher did not finish");
    }

    if let Err(e) = std::fs::remove_file(&config.daemon.pid_file) {
        warn!("Could not remove pid file: {}", e);
    }
    info!("Daemon stopped");
    Ok(())
}
