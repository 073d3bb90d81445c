use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use jsk_vmc_lib::serial::sim::{SimScript, SimulatedVmc};
use jsk_vmc_lib::serial::SerialInterface;
use jsk_vmc_lib::{ControllerConfig, ControllerError, DispenseStatus, LogicalCommand, VendingController};

/// Exit status for a request the controller could not carry out for lack
/// of a working transport, as opposed to a machine or caller problem
const EXIT_INFRASTRUCTURE: u8 = 2;

/// JSK vending machine controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// serial device, overrides the config file
    #[arg(short, long)]
    port: Option<String>,

    /// talk to an in-process simulated VMC instead of hardware
    #[arg(long)]
    simulate: bool,

    /// enable debug messages
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Dispense one product
    Dispense {
        aisle: u16,
        /// drive the motor directly (DRIVE_AISLE_DIRECT)
        #[arg(long)]
        direct: bool,
        /// with --direct, don't wait for the drop sensor
        #[arg(long)]
        no_drop_sensor: bool,
        /// with --direct, use the elevator
        #[arg(long)]
        elevator: bool,
    },
    /// Check one aisle
    Status { aisle: u16 },
    /// Set the inventory count of an aisle
    Inventory { aisle: u16, count: u8 },
    /// Request the machine status block
    MachineStatus,
    /// Report transport health
    Health,
    /// List serial ports on this host
    Ports,
}

#[derive(Serialize)]
struct MachineStatusOutput {
    raw: String,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn is_infrastructure(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ControllerError>()
        .is_some_and(ControllerError::is_infrastructure)
}

fn dispense_exit_code(status: DispenseStatus) -> u8 {
    match status {
        DispenseStatus::Success => 0,
        DispenseStatus::TransportError | DispenseStatus::ControllerBusy => EXIT_INFRASTRUCTURE,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    builder.init();

    if let Cmd::Ports = args.command {
        let ports = SerialInterface::list_ports().context("listing serial ports")?;
        print_json(&ports)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(port) = args.port {
        config.serial.port = port;
    }

    let controller = if args.simulate {
        log::info!("Using simulated VMC");
        VendingController::start_with(SimulatedVmc::new(SimScript::default()), &config)
    } else {
        VendingController::start(&config)
    };
    let orchestrator = controller.orchestrator();

    let result = match args.command {
        Cmd::Dispense {
            aisle,
            direct,
            no_drop_sensor,
            elevator,
        } => {
            let mut command = LogicalCommand::new(aisle)
                .with_drop_sensor(!no_drop_sensor)
                .with_elevator(elevator);
            if direct {
                command = command.direct();
            }
            let outcome = orchestrator.dispense(command).await;
            print_json(&outcome).map(|_| dispense_exit_code(outcome.status))
        }
        Cmd::Status { aisle } => match orchestrator.check_aisle(aisle).await {
            Ok(report) => print_json(&report).map(|_| 0),
            Err(e) => Err(e).with_context(|| format!("checking aisle {}", aisle)),
        },
        Cmd::Inventory { aisle, count } => orchestrator
            .set_aisle_inventory(aisle, count)
            .await
            .map(|_| 0)
            .with_context(|| format!("setting inventory of aisle {}", aisle)),
        Cmd::MachineStatus => match orchestrator.machine_status().await {
            Ok(raw) => print_json(&MachineStatusOutput { raw: hex::encode(raw) }).map(|_| 0),
            Err(e) => Err(e).context("requesting machine status"),
        },
        Cmd::Health => {
            let health = controller.health_report();
            print_json(&health).map(|_| if health.transport_open { 0 } else { EXIT_INFRASTRUCTURE })
        }
        Cmd::Ports => Ok(0),
    };

    log::debug!("Session metrics: {:?}", controller.metrics());
    controller.shutdown().await;
    match result {
        Ok(code) => Ok(ExitCode::from(code)),
        Err(e) if is_infrastructure(&e) => {
            log::error!("{:#}", e);
            Ok(ExitCode::from(EXIT_INFRASTRUCTURE))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failures_exit_with_infrastructure_code() {
        let busy = anyhow::Error::new(ControllerError::ControllerBusy("full".into())).context("checking aisle 3");
        assert!(is_infrastructure(&busy));

        let invalid = anyhow::Error::new(ControllerError::InvalidAisle { aisle: 999, min: 1, max: 20 });
        assert!(!is_infrastructure(&invalid));

        assert_eq!(dispense_exit_code(DispenseStatus::Success), 0);
        assert_eq!(dispense_exit_code(DispenseStatus::Jammed), 1);
        assert_eq!(dispense_exit_code(DispenseStatus::TransportError), EXIT_INFRASTRUCTURE);
    }
}
