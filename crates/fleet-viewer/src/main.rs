mod app;
mod ui;

use app::{handle_input, App, HubEvent};
use clap::Parser;
use crossterm::{
    event::EventStream,
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use fleet_core::protocol::{decode_event, encode_command, ClientCommand};
use futures_util::{SinkExt, StreamExt};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{error::Error, io, time::Duration};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:4870/ws";
const COMMAND_QUEUE_CAPACITY: usize = 64;
const PULSE_INTERVAL_MS: u64 = 500;

#[derive(Clone, Debug)]
struct Config {
    hub_url: Url,
    reconnect_delay: Duration,
    grace_period: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "fleet-viewer", about = "Terminal dashboard for a fleet-hub")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value_t = 2000)]
    reconnect_delay_ms: u64,
    #[arg(long, default_value_t = 120)]
    grace_period_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config(Args::parse())?;
    init_logging();
    info!(event = "viewer_start", url = %config.hub_url);

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let mut app = App::new(cmd_tx, config.grace_period);

    let (hub_tx, mut hub_rx) = mpsc::channel(256);
    let hub_cfg = config.clone();
    tokio::spawn(async move {
        hub_loop(hub_cfg, hub_tx, cmd_rx).await;
    });

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();
    let mut pulse_ticker = tokio::time::interval(Duration::from_millis(PULSE_INTERVAL_MS));

    loop {
        terminal.draw(|frame| ui::render_ui(frame, &app))?;
        tokio::select! {
            _ = pulse_ticker.tick() => {
                app.toggle_pulse();
            }
            Some(event) = hub_rx.recv() => {
                app.apply_hub_event(event);
            }
            maybe_event = events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    if handle_input(event, &mut app) {
                        break;
                    }
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Keeps one channel to the hub open, reconnecting after a fixed delay.
/// Returns once the viewer side of either channel is gone.
async fn hub_loop(
    config: Config,
    tx: mpsc::Sender<HubEvent>,
    mut command_rx: mpsc::Receiver<ClientCommand>,
) {
    loop {
        let mut ws = match connect_async(config.hub_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!(event = "hub_connect_error", error = %err);
                tokio::time::sleep(config.reconnect_delay).await;
                continue;
            }
        };
        info!(event = "hub_connected", url = %config.hub_url);
        if tx.send(HubEvent::Connected).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match decode_event(&text) {
                            Ok(event) => {
                                if tx.send(HubEvent::Server(event)).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => warn!(event = "event_invalid", error = %err),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(event = "hub_read_error", error = %err);
                            break;
                        }
                    }
                }
                maybe_command = command_rx.recv() => {
                    let Some(command) = maybe_command else {
                        let _ = ws.close(None).await;
                        return;
                    };
                    match encode_command(&command) {
                        Ok(text) => {
                            if ws.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(event = "command_encode_error", error = %err),
                    }
                }
            }
        }

        let _ = ws.close(None).await;
        info!(event = "hub_disconnected");
        if tx.send(HubEvent::Disconnected).await.is_err() {
            return;
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

fn load_config(args: Args) -> Result<Config, Box<dyn Error>> {
    let raw_url = if !args.url.trim().is_empty() {
        args.url
    } else {
        match std::env::var("FLEET_HUB_URL") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => DEFAULT_HUB_URL.to_string(),
        }
    };
    let hub_url = Url::parse(raw_url.trim())?;
    if !matches!(hub_url.scheme(), "ws" | "wss") {
        return Err(format!("hub url must use ws:// or wss://, got {hub_url}").into());
    }
    Ok(Config {
        hub_url,
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        grace_period: Duration::from_secs(args.grace_period_secs),
    })
}

fn init_logging() {
    let level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout_enabled = matches!(
        std::env::var("FLEET_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
