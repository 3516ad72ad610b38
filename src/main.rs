use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use topiclink::config::{default_config_path, ConnectionConfig};
use topiclink::{Handler, Multiplayer, SyncEvent};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Host tick; the inbound queue is drained once per tick
const TICK: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let player = args.next().unwrap_or_else(|| "player".to_string());

    info!("Loading connection config from {}", config_path.display());
    let config = ConnectionConfig::load_or_create(&config_path).await?;
    let issues = config.validate();
    if !issues.is_empty() {
        for issue in &issues {
            error!("Config: {}", issue);
        }
        return Err(eyre!("{} configuration issue(s), not connecting", issues.len()));
    }

    let mut client = Multiplayer::new(config).map_err(|e| eyre!("{}", e))?;
    client.add_handler(
        Handler::new("button_game").with_method("other_player_click", |who| {
            info!("Last clicked by: {}", who);
        }),
    );
    client
        .register_binding("button_game", "other_player_click", "buttonclick")
        .map_err(|e| eyre!("{}", e))?;

    if !client.test_connection().await {
        warn!("Primary broker did not answer the probe, relying on backup");
    }
    if let Err(e) = client.connect().await {
        return Err(eyre!("Could not connect: {}", e));
    }
    info!(
        "Joined '{}'. Type /click to send a click, anything else is sent as data.",
        client.topic()
    );

    run_host_loop(&mut client, &player).await;

    client.disconnect();
    for event in client.tick() {
        handle_event(event);
    }
    Ok(())
}

async fn run_host_loop(client: &mut Multiplayer, player: &str) {
    let mut ticker = tokio::time::interval(TICK);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = client.shutdown_token();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim() == "/click" => {
                    if let Err(e) = client.send_command("buttonclick", player) {
                        warn!("Click not sent: {}", e);
                    }
                }
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = client.send_data(line.trim()) {
                        warn!("Data not sent: {}", e);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                for event in client.tick() {
                    handle_event(event);
                }
            }
        }
    }
}

fn handle_event(event: SyncEvent) {
    match event {
        SyncEvent::Connected {
            broker,
            used_backup,
        } => {
            if used_backup {
                warn!("Connected to backup broker {}", broker);
            } else {
                info!("Connected to {}", broker);
            }
        }
        SyncEvent::Disconnected => info!("Disconnected"),
        SyncEvent::MessageReceived(message) => info!("{}", message),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
