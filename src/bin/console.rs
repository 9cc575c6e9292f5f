// Keyboard console: E/D enable/disable, A acknowledge, Z zero, +/- target,
// O/C open/close by torque, F force tracking, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::Duration;
use tracing::{info, warn};

use gripper_force_runtime::config::{DEFAULT_TARGET_FORCE_N, TOPIC_CMD, TOPIC_HEALTH};
use gripper_force_runtime::messages::{GripperCommand, RuntimeHealth};

const TARGET_STEP_N: f32 = 0.05;
const MAX_TARGET_N: f32 = 2.0;
const OPEN_TORQUE_NM: f32 = -0.25;
const CLOSE_TORQUE_NM: f32 = 0.15;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD).await?;
    let health = session.declare_subscriber(TOPIC_HEALTH).await?;

    info!("Controls: E/D=enable/disable, A=ack fault, Z=zero, +/-=target, O/C=open/close, F=force, Q=quit");
    info!("Target: {:.2} N", DEFAULT_TARGET_FORCE_N);

    enable_raw_mode()?;
    let result = run_console(&publisher, &health).await;
    disable_raw_mode()?;

    result
}

async fn run_console(
    publisher: &zenoh::pubsub::Publisher<'_>,
    health: &zenoh::pubsub::Subscriber<zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut target = DEFAULT_TARGET_FORCE_N;
    let mut last_health: Option<RuntimeHealth> = None;

    loop {
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if kind != KeyEventKind::Press {
                    continue;
                }

                let cmd = match code {
                    KeyCode::Char('e') => Some(GripperCommand::Enable),
                    KeyCode::Char('d') | KeyCode::Char(' ') => Some(GripperCommand::Disable),
                    KeyCode::Char('a') => Some(GripperCommand::AcknowledgeFault),
                    KeyCode::Char('z') => Some(GripperCommand::ZeroCalibrate),
                    KeyCode::Char('+') | KeyCode::Char('=') => {
                        target = (target + TARGET_STEP_N).min(MAX_TARGET_N);
                        Some(GripperCommand::SetTarget { force_n: target })
                    }
                    KeyCode::Char('-') => {
                        target = (target - TARGET_STEP_N).max(0.0);
                        Some(GripperCommand::SetTarget { force_n: target })
                    }
                    KeyCode::Char('f') => Some(GripperCommand::SetTarget { force_n: target }),
                    KeyCode::Char('o') => Some(GripperCommand::SetManualTorque {
                        torque_nm: OPEN_TORQUE_NM,
                    }),
                    KeyCode::Char('c') => Some(GripperCommand::SetManualTorque {
                        torque_nm: CLOSE_TORQUE_NM,
                    }),
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    _ => None,
                };

                if let Some(cmd) = cmd {
                    info!("Sending {:?}", cmd);
                    publisher.put(serde_json::to_string(&cmd)?).await?;
                }
            }
        }

        // Report health transitions from the runtime
        while let Ok(Some(sample)) = health.try_recv() {
            match serde_json::from_slice::<RuntimeHealth>(&sample.payload().to_bytes()) {
                Ok(h) if last_health != Some(h) => {
                    info!("Runtime health: {:?}", h);
                    last_health = Some(h);
                }
                Ok(_) => {}
                Err(e) => warn!("Bad health payload: {}", e),
            }
        }
    }

    // Leave the gripper disabled when the operator quits
    publisher.put(serde_json::to_string(&GripperCommand::Disable)?).await?;
    Ok(())
}
