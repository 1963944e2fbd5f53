//! # ArachnoNestor Motion Supervisor Binary
//!
//! Wires the sensor poll worker, the motor bus and the HTTP adapter
//! around one process-local [`Supervisor`] value.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config path
//! nestor_supervisor
//!
//! # Explicit config, verbose logging
//! nestor_supervisor -c config/nestor.toml -v
//!
//! # IMU balance loop instead of the HTTP surface
//! nestor_supervisor --balance --base-rpm 900
//!
//! # No drive hardware attached
//! nestor_supervisor --no-motors
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nestor_common::config::{ConfigLoader, NestorConfig};
use nestor_hal::motor::{MotorBus, MotorPort, NullMotorPort, SerialMotorPort};
use nestor_supervisor::balance::{self, BalanceOptions};
use nestor_supervisor::supervisor::Supervisor;
use nestor_supervisor::{api, poller};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// ArachnoNestor motion supervisor for the four-winch cable platform.
#[derive(Parser, Debug)]
#[command(name = "nestor_supervisor")]
#[command(version)]
#[command(about = "Supervisory controller for the ArachnoNestor winch platform")]
#[command(long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/nestor.toml")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,

    /// Do not start the HTTP adapter.
    #[arg(long)]
    no_api: bool,

    /// Run without drive hardware (discard motor commands).
    #[arg(long)]
    no_motors: bool,

    /// Run the blocking IMU balance loop instead of the HTTP adapter.
    #[arg(long)]
    balance: bool,

    /// Base RPM for the balance loop.
    #[arg(long, default_value_t = 1000.0)]
    base_rpm: f64,
}

fn main() {
    if let Err(e) = run() {
        error!("supervisor startup failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!(
        "ArachnoNestor supervisor v{} starting...",
        env!("CARGO_PKG_VERSION")
    );

    let cfg = load_config(&args)?;
    cfg.validate()?;

    let port: Box<dyn MotorPort> = if args.no_motors {
        info!("motor commands disabled (--no-motors)");
        Box::new(NullMotorPort)
    } else {
        Box::new(SerialMotorPort::open(
            &cfg.motion.serial_port,
            cfg.motion.baud_rate,
            Duration::from_secs_f64(cfg.motion.serial_timeout_s),
            Duration::from_millis(cfg.motion.settle_ms),
        )?)
    };
    let bus = MotorBus::new(port, &cfg.motion);
    let sup = Supervisor::new(cfg, bus);

    // Shutdown on Ctrl-C: cancel any job and stop all motors.
    let handler_sup = Arc::clone(&sup);
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        handler_sup.request_shutdown();
    })?;

    let poll_handle = poller::spawn(Arc::clone(&sup))?;

    if args.balance {
        let opts = BalanceOptions {
            base_rpm: args.base_rpm,
            no_motors: args.no_motors,
            ..BalanceOptions::default()
        };
        if let Err(e) = balance::run(&sup, opts) {
            error!("balance loop failed: {e}");
        }
        sup.request_shutdown();
    } else if args.no_api {
        // Headless: park until the shutdown signal.
        while !sup.is_shutdown() {
            std::thread::sleep(Duration::from_millis(200));
        }
    } else {
        let api_cfg = sup.config().api.clone();
        if let Err(e) = api::serve(&sup, &api_cfg.host, api_cfg.port) {
            error!("http adapter failed: {e}");
            sup.request_shutdown();
        }
    }

    sup.request_shutdown();
    if poll_handle.join().is_err() {
        warn!("sensor poll worker panicked");
    }
    info!("supervisor shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<NestorConfig, Box<dyn std::error::Error>> {
    use nestor_common::config::ConfigError;
    match NestorConfig::load(&args.config) {
        Ok(cfg) => {
            info!(path = %args.config.display(), "configuration loaded");
            Ok(cfg)
        }
        Err(ConfigError::FileNotFound) => {
            warn!(
                path = %args.config.display(),
                "configuration file not found; using defaults"
            );
            Ok(NestorConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
