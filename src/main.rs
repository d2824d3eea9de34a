//! `cseries`: command-line control of C-Series syringe pumps.
//!
//! Subcommands:
//! - `ports`: list USB serial ports that look like a C-Series pump
//! - `config`: print the merged configuration
//! - `status`, `init`, `configure`, `valve`, `move`, `dispense`, `send`:
//!   operate the pump named with `--pump`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cseries_pump::adapters::{discover_ports, SerialTransport};
use cseries_pump::config::PumpRegistry;
use cseries_pump::pump::{InitKind, PumpController, ValvePosition};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Tricontinent C-Series pump control tool
#[derive(Parser, Debug)]
#[command(name = "cseries")]
#[command(about = "Drive Tricontinent C-Series syringe pumps over the Data Terminal protocol")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "cseries.toml")]
    config: PathBuf,

    /// Pump name from the configuration file
    #[arg(short, long, global = true)]
    pump: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports with the pump's USB-serial bridge
    Ports,

    /// Print the configuration after environment overrides
    Config,

    /// Query device status
    Status,

    /// Initialize plunger and valve
    Init {
        #[arg(value_enum, default_value = "right")]
        kind: InitArg,
    },

    /// Upload increment mode, velocities and acceleration
    Configure,

    /// Report the valve position, or switch it
    Valve {
        #[arg(value_enum)]
        target: Option<ValveArg>,
    },

    /// Move the plunger to an absolute volume and wait for it
    Move {
        /// Volume in mL
        volume: f64,
    },

    /// Dispense a volume from inlet to outlet
    Dispense {
        /// Volume in mL
        volume: f64,
    },

    /// Send a raw command such as `A1200` or `?6`
    Send { command: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum InitArg {
    Right,
    Left,
    NoValve,
    ValveOnly,
}

impl From<InitArg> for InitKind {
    fn from(arg: InitArg) -> Self {
        match arg {
            InitArg::Right => InitKind::ValveRight,
            InitArg::Left => InitKind::ValveLeft,
            InitArg::NoValve => InitKind::NoValve,
            InitArg::ValveOnly => InitKind::ValveOnly,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ValveArg {
    Inlet,
    Outlet,
    Bypass,
    Extra,
}

impl From<ValveArg> for ValvePosition {
    fn from(arg: ValveArg) -> Self {
        match arg {
            ValveArg::Inlet => ValvePosition::Inlet,
            ValveArg::Outlet => ValvePosition::Outlet,
            ValveArg::Bypass => ValvePosition::Bypass,
            ValveArg::Extra => ValvePosition::Extra,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Args {
        config,
        pump,
        command,
    } = Args::parse();

    match command {
        Command::Ports => {
            let ports = discover_ports().context("Failed to enumerate serial ports")?;
            if ports.is_empty() {
                println!("No C-Series pumps found");
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
        Command::Config => {
            let registry = load_registry(&config)?;
            let text = toml::to_string_pretty(&registry).context("Failed to render configuration")?;
            print!("{}", text);
            Ok(())
        }
        command => {
            let mut pump = connect(&config, pump.as_deref())?;
            let result = run(&mut pump, command);
            let closed = pump.close().context("Failed to close pump connection");
            result.and(closed)
        }
    }
}

fn load_registry(path: &Path) -> Result<PumpRegistry> {
    PumpRegistry::load_from(path)
        .with_context(|| format!("Failed to load configuration '{}'", path.display()))
}

fn connect(path: &Path, pump: Option<&str>) -> Result<PumpController> {
    let registry = load_registry(path)?;
    let name = match pump {
        Some(name) => name.to_string(),
        None => match registry.names().as_slice() {
            [only] => (*only).to_string(),
            names => anyhow::bail!("--pump is required; configured pumps: {:?}", names),
        },
    };
    let config = registry
        .resolve(&name)
        .with_context(|| format!("Unknown pump '{}'", name))?;
    let transport = SerialTransport::from_config(&config);
    let mut pump =
        PumpController::new(config, Box::new(transport))?.with_idle_wait(registry.idle_wait());
    pump.open()
        .with_context(|| format!("Failed to open pump '{}'", name))?;
    Ok(pump)
}

fn run(pump: &mut PumpController, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            let status = pump.status()?;
            println!(
                "{} (code '{}', data {:?})",
                status.message(),
                status.code,
                status.data
            );
        }
        Command::Init { kind } => pump.initialize(kind.into())?,
        Command::Configure => pump.configure()?,
        Command::Valve { target: None } => {
            println!("{}", pump.valve_position()?);
        }
        Command::Valve {
            target: Some(target),
        } => {
            pump.switch_valve(target.into())?;
            pump.wait_for_idle()?;
        }
        Command::Move { volume } => {
            let steps = pump.move_to_absolute_volume(volume)?;
            pump.wait_for_idle()?;
            info!("Moved to {} mL ({} steps)", volume, steps);
        }
        Command::Dispense { volume } => {
            let report = pump
                .dispense(volume)
                .with_context(|| format!("Dispense of {} mL failed", volume))?;
            println!(
                "Dispensed {} mL ({} full strokes)",
                report.plan.requested_ml, report.strokes_completed
            );
        }
        Command::Send { command } => {
            let reply = pump.send_raw(&command)?;
            println!("{} {:?}", reply.message(), reply.data);
        }
        Command::Ports | Command::Config => {}
    }
    Ok(())
}
