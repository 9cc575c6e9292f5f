// Process runtime: devices, control loop thread, Zenoh command/status surface
//
// The control loop runs on its own thread at the configured rate. This task only
// forwards commands from Zenoh into it and publishes its snapshots; a slow or dead
// network side never delays a control cycle.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::{RuntimeConfig, SHUTDOWN_TIMEOUT, STATUS_HZ, TOPIC_CMD, TOPIC_HEALTH, TOPIC_STATUS};
use crate::control::{self, ControlHandle};
use crate::messages::{GripperCommand, RuntimeHealth};
use crate::motor::UsbCanAdapter;
use crate::sensor::SerialPressureSource;
use crate::sim::{SimMotor, SimSensor};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug, Default)]
#[command(name = "gripper-runtime", about = "Adaptive grip force control runtime")]
pub struct Args {
    /// JSON config file; defaults are used for anything it leaves out
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Pressure array serial port
    #[arg(long)]
    pub sensor_port: Option<String>,

    /// USB-CAN adapter serial port
    #[arg(long)]
    pub can_port: Option<String>,

    /// USB serial number the CAN adapter must report
    #[arg(long)]
    pub adapter_serial: Option<String>,

    /// Run against a simulated motor and pressure pad
    #[arg(long)]
    pub simulate: bool,

    /// Print serial ports and exit
    #[arg(long)]
    pub list_ports: bool,
}

impl Args {
    /// Load the config file (if any) and apply command line overrides
    pub fn runtime_config(&self) -> Result<RuntimeConfig, BoxError> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };

        if let Some(port) = &self.sensor_port {
            config.ports.sensor_port = port.clone();
        }
        if let Some(port) = &self.can_port {
            config.ports.can_port = port.clone();
        }
        if let Some(serial) = &self.adapter_serial {
            config.ports.adapter_serial = Some(serial.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

pub async fn run(args: Args) -> Result<(), BoxError> {
    if args.list_ports {
        return list_ports();
    }

    let config = args.runtime_config()?;
    let control = start_control(&config, args.simulate)?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD).await?;
    let pub_status = session.declare_publisher(TOPIC_STATUS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    info!("Subscribed to: {}", TOPIC_CMD);
    info!("Publishing to: {}, {} at {}Hz", TOPIC_STATUS, TOPIC_HEALTH, STATUS_HZ);

    let mut tick = interval(Duration::from_millis(1000 / STATUS_HZ));
    let mut last_health: Option<RuntimeHealth> = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result: Result<(), BoxError> = loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, shutting down");
                break Ok(());
            }
        }

        if !control.is_running() {
            break Err("control loop exited unexpectedly".into());
        }

        // 1. Forward pending commands (non-blocking)
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<GripperCommand>(&payload) {
                Ok(cmd) => {
                    info!("Received command: {:?}", cmd);
                    if let Err(e) = control.submit(cmd) {
                        warn!("Dropping command: {}", e);
                    }
                }
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Publish the latest snapshot and its health
        let snapshot = control.status();
        let health = snapshot.health();
        if last_health != Some(health) {
            info!("Health: {:?}", health);
            last_health = Some(health);
        }

        let published = async {
            pub_status.put(serde_json::to_string(&snapshot)?).await?;
            pub_health.put(serde_json::to_string(&health)?).await?;
            Ok::<(), BoxError>(())
        };
        if let Err(e) = published.await {
            warn!("Failed to publish status: {}", e);
        }
    };

    // Two-phase stop blocks on the loop thread
    tokio::task::spawn_blocking(move || control.shutdown(SHUTDOWN_TIMEOUT)).await??;
    info!("Runtime stopped");
    result
}

fn start_control(config: &RuntimeConfig, simulate: bool) -> Result<ControlHandle, BoxError> {
    if simulate {
        info!("Simulation mode: no hardware will be touched");
        let (motor, bus) = SimMotor::new(config.motor);
        let sensor = SimSensor::coupled(bus, config.calibration_table()?);
        return Ok(control::start(config, motor, sensor)?);
    }

    let ports = &config.ports;
    info!("Opening CAN adapter on {} @ {} baud", ports.can_port, ports.can_baudrate);
    let transport = UsbCanAdapter::open_with_baudrate(&ports.can_port, ports.can_baudrate)?;
    info!("Opening pressure sensor on {} @ {} baud", ports.sensor_port, ports.sensor_baudrate);
    let sensor = SerialPressureSource::open_with_baudrate(&ports.sensor_port, ports.sensor_baudrate)?;

    Ok(control::start(config, transport, sensor)?)
}

fn list_ports() -> Result<(), BoxError> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => println!(
                "{}  usb {:04x}:{:04x}  serial={}  {}",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.serial_number.as_deref().unwrap_or("-"),
                usb.product.as_deref().unwrap_or("")
            ),
            other => println!("{}  {:?}", port.port_name, other),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "gripper-runtime",
            "--sensor-port",
            "/dev/ttyUSB3",
            "--adapter-serial",
            "ABC123",
            "--simulate",
        ]);
        assert!(args.simulate);

        let config = args.runtime_config().unwrap();
        assert_eq!(config.ports.sensor_port, "/dev/ttyUSB3");
        assert_eq!(config.ports.adapter_serial.as_deref(), Some("ABC123"));
        assert_eq!(config.ports.can_port, RuntimeConfig::default().ports.can_port);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/gripper.json")),
            ..Args::default()
        };
        assert!(args.runtime_config().is_err());
    }

    #[test]
    fn test_simulated_control_starts_and_stops() {
        let config = RuntimeConfig::default();
        let control = start_control(&config, true).unwrap();
        assert!(control.is_running());
        control.shutdown(SHUTDOWN_TIMEOUT).unwrap();
    }
}
