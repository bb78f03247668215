use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wsocket_server::{Server, Settings};

fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let config = Settings::new()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Configuration loaded successfully ({})", config.environment);

    let mut server = Server::from_settings(&config)?;

    server.on_connection(|conn| {
        info!("Client connected: {:?} (id: {})", conn.peer_addr(), conn.id());

        conn.on_message(|conn, payload| {
            let text = String::from_utf8_lossy(payload);
            info!("Received message from {}: {}", conn.id(), text);
            if let Err(e) = conn.send(&text) {
                warn!("Echo to {} failed: {}", conn.id(), e);
            }
        });
    });

    server.on_disconnect(|conn| {
        info!("Client disconnected: {}", conn.id());
    });

    server.on_error(|message| {
        error!("Server error: {}", message);
    });

    info!(
        "WebSocket server ready to accept connections at ws://{}",
        server.local_addr()
    );

    server.listen()?;
    Ok(())
}
