mod actions;
mod control_plane;
mod hub;
mod logging;
mod monitor;

use clap::Parser;
use control_plane::ProcessControlPlane;
use hub::HubState;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_ADDR: &str = "127.0.0.1:4870";
const DEFAULT_CONTROL_PLANE: &str = "powershell";
const DEFAULT_CONTROL_PLANE_ARGS: &[&str] = &["-ExecutionPolicy", "Bypass", "-File", "wsl_tools.ps1"];
const DEFAULT_LOG_DIR: &str = ".fleet/logs";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub allow_remote: bool,
    pub control_plane: String,
    pub control_plane_args: Vec<String>,
    pub poll_interval: Duration,
    pub cooldown: Duration,
    pub refresh_delay: Duration,
    pub command_timeout: Duration,
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub debug: bool,
    pub log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "fleet-hub", about = "Fleet dashboard hub: polls the control plane and fans events out to viewers")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    allow_remote: bool,
    #[arg(long, default_value = "")]
    control_plane: String,
    /// Argument placed before every control-plane command; repeatable.
    #[arg(long = "control-plane-arg", allow_hyphen_values = true)]
    control_plane_arg: Vec<String>,
    #[arg(long, default_value_t = 3000)]
    poll_interval_ms: u64,
    #[arg(long, default_value_t = 5000)]
    cooldown_ms: u64,
    #[arg(long, default_value_t = 1000)]
    refresh_delay_ms: u64,
    #[arg(long, default_value_t = 60)]
    command_timeout_secs: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    logging::init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() && !config.allow_remote {
        error!(event = "invalid_addr", addr = %config.addr, reason = "non_loopback");
        return;
    }

    let plane = ProcessControlPlane::new(
        config.control_plane.clone(),
        config.control_plane_args.clone(),
        config.command_timeout,
    );
    let state = Arc::new(HubState::new(config.clone(), plane));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = tokio::spawn(monitor::run(state.clone(), shutdown_rx));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        control_plane = %config.control_plane,
        poll_interval_ms = config.poll_interval.as_millis() as u64
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    if let Err(err) = axum::serve(
        listener,
        hub::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }

    let _ = shutdown_tx.send(true);
    let _ = monitor_task.await;
}

fn load_config() -> Config {
    config_from_args(Args::parse())
}

fn config_from_args(args: Args) -> Config {
    let control_plane = resolve_string(&args.control_plane, "FLEET_CONTROL_PLANE", DEFAULT_CONTROL_PLANE);
    let control_plane_args = resolve_control_plane_args(&control_plane, args.control_plane_arg);
    Config {
        addr: resolve_string(&args.addr, "FLEET_HUB_ADDR", DEFAULT_ADDR),
        allow_remote: args.allow_remote,
        control_plane,
        control_plane_args,
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
        cooldown: Duration::from_millis(args.cooldown_ms),
        refresh_delay: Duration::from_millis(args.refresh_delay_ms),
        command_timeout: Duration::from_secs(args.command_timeout_secs.max(1)),
        queue_capacity: args.queue_capacity.max(1),
        write_timeout: Duration::from_secs(args.write_timeout),
        debug: args.debug || env_true("FLEET_HUB_DEBUG"),
        log_dir: resolve_string(&args.log_dir, "FLEET_LOG_DIR", DEFAULT_LOG_DIR),
    }
}

/// Flag, then environment, then default.
fn resolve_string(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_control_plane_args(program: &str, flags: Vec<String>) -> Vec<String> {
    if !flags.is_empty() {
        return flags;
    }
    if let Ok(value) = std::env::var("FLEET_CONTROL_PLANE_ARGS") {
        if !value.trim().is_empty() {
            return value.split_whitespace().map(str::to_string).collect();
        }
    }
    if program == DEFAULT_CONTROL_PLANE {
        return DEFAULT_CONTROL_PLANE_ARGS
            .iter()
            .map(|arg| arg.to_string())
            .collect();
    }
    Vec::new()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        addr: "127.0.0.1:0".to_string(),
        allow_remote: false,
        control_plane: "scripted".to_string(),
        control_plane_args: Vec::new(),
        poll_interval: Duration::from_millis(3000),
        cooldown: Duration::from_millis(5000),
        refresh_delay: Duration::from_millis(1000),
        command_timeout: Duration::from_secs(60),
        queue_capacity: 16,
        write_timeout: Duration::from_secs(2),
        debug: false,
        log_dir: String::new(),
    }
}
