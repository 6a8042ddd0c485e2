//! rl-sim - run the full controller against a simulated A1.
//!
//! The simulated operator presses the stand button after one second and the
//! start-policy button once the stance ramp has finished. The policy is a
//! constant model, so the robot holds its stance under policy control.
//!
//! Usage:
//!   rl-sim [options]
//!
//! Options:
//!   --config <path>      JSON controller config (default: built-in A1 config)
//!   --duration <secs>    Stop after this many seconds (default: run until Ctrl+C)
//!   --telemetry          Log joint tracking error
//!   --torque             Torque control mode

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rlsar::config::ControlMode;
use rlsar::joint_map::{JointMapping, NUM_JOINTS};
use rlsar::sim::{ConstantPolicyLoader, ScriptedPress, SimParams, SimRobot};
use rlsar::{ControlConfig, Controller, PolicyModels};

/// Folded-leg pose the simulated robot starts in, policy order.
const CROUCH: [f32; NUM_JOINTS] = [
    0.0, 1.2, -2.7, //
    0.0, 1.2, -2.7, //
    0.0, 1.2, -2.7, //
    0.0, 1.2, -2.7,
];

struct Args {
    config: Option<String>,
    duration: Option<f64>,
    telemetry: bool,
    torque: bool,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        config: None,
        duration: None,
        telemetry: false,
        torque: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                result.config = Some(args[i + 1].clone());
                i += 2;
            }
            "--duration" if i + 1 < args.len() => {
                let secs: f64 = args[i + 1]
                    .parse()
                    .with_context(|| format!("invalid --duration `{}`", args[i + 1]))?;
                if !(secs > 0.0) {
                    anyhow::bail!("--duration must be positive");
                }
                result.duration = Some(secs);
                i += 2;
            }
            "--telemetry" => {
                result.telemetry = true;
                i += 1;
            }
            "--torque" => {
                result.torque = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    Ok(result)
}

fn print_usage() {
    println!("rl-sim - learned-policy controller against a simulated A1");
    println!();
    println!("Usage: rl-sim [options]");
    println!();
    println!("Options:");
    println!("  --config <path>      JSON controller config (default: built-in A1 config)");
    println!("  --duration <secs>    Stop after this many seconds (default: until Ctrl+C)");
    println!("  --telemetry          Log joint tracking error");
    println!("  --torque             Torque control mode");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rlsar=info".parse()?)
                .add_directive("rl_sim=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = parse_args()?;

    let mut config = match &args.config {
        Some(path) => ControlConfig::from_file(path)?,
        None => ControlConfig::default(),
    };
    if args.torque {
        config.mode = ControlMode::Torque;
    }
    if args.telemetry && config.rates.telemetry_period_s.is_none() {
        config.rates.telemetry_period_s = Some(0.01);
    }
    config.validate()?;

    // Receive calls are one per receive period.
    let receives_per_s = (1.0 / config.rates.receive_period_s).round() as u64;
    let stand_at = receives_per_s;
    let ramp = (config.ramp_ticks() as f64 * config.rates.control_period_s
        / config.rates.receive_period_s)
        .ceil() as u64;
    let start_at = stand_at + ramp + receives_per_s / 2;
    let hold = (receives_per_s / 5).max(2);

    let robot = Arc::new(
        SimRobot::new(JointMapping::a1().to_hardware(&CROUCH), SimParams::default())
            .with_press(ScriptedPress {
                button: config.buttons.stand,
                at: stand_at,
                hold,
            })
            .with_press(ScriptedPress {
                button: config.buttons.start_policy,
                at: start_at,
                hold,
            }),
    );

    println!();
    println!("========================================");
    println!("rl-sim");
    println!("========================================");
    println!("Mode:       {}", config.mode);
    println!("Control:    {:.0} Hz", 1.0 / config.rates.control_period_s);
    println!("Policy:     {:.0} Hz", 1.0 / config.rates.inference_period_s);
    println!(
        "Stand:      {:?} at {:.1}s",
        config.buttons.stand,
        stand_at as f64 / receives_per_s as f64
    );
    println!(
        "Policy on:  {:?} at {:.1}s",
        config.buttons.start_policy,
        start_at as f64 / receives_per_s as f64
    );
    println!("========================================");
    println!();

    let models = PolicyModels::load(&config.model_dir, &ConstantPolicyLoader::default())?;
    let controller = Controller::new(config, robot.clone(), models)?;
    controller.start()?;

    match args.duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {
                    tracing::info!("Run duration elapsed");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            tracing::info!("Interrupted");
        }
    }

    let phase = controller.phase();
    tokio::task::spawn_blocking(move || controller.shutdown()).await?;

    let q = JointMapping::a1().to_policy(&robot.positions());
    tracing::info!(
        "Final phase {}, {} frames sent, front-left leg at [{:.3}, {:.3}, {:.3}]",
        phase,
        robot.frames_sent(),
        q[0],
        q[1],
        q[2]
    );
    Ok(())
}
