//! Simulated robot and policy for running the controller without hardware.
//!
//! [`SimRobot`] integrates a per-joint PD + inertia model once per sent frame
//! and plays back scripted remote button presses. [`ConstantPolicyLoader`]
//! provides model backends that return fixed tensors.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::command::{CommandFrame, MotorCommand, MotorMode};
use crate::inference::{Model, ModelBackend, ModelLoader, Tensor};
use crate::joint_map::NUM_JOINTS;
use crate::state::{Button, ImuState, RemoteState, SensorSnapshot};
use crate::transport::{RobotTransport, TransportError};

/// Highest power budget level accepted by [`SimRobot::apply_power_limit`].
pub const MAX_POWER_LEVEL: u8 = 10;

/// Per-joint torque budget for each power level (N·m).
const TORQUE_PER_LEVEL: f32 = 5.0;

/// A button held down for a number of receive calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedPress {
    pub button: Button,
    /// Receive call at which the press starts (0-based).
    pub at: u64,
    /// Receive calls the button stays down.
    pub hold: u64,
}

/// Physical parameters of the joint model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimParams {
    /// Integration step per sent frame (s).
    pub dt: f32,
    /// Reflected joint inertia (kg·m²).
    pub inertia: f32,
    /// Viscous friction (N·m·s/rad).
    pub friction: f32,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            dt: 0.002,
            inertia: 0.05,
            friction: 0.2,
        }
    }
}

#[derive(Debug)]
struct SimState {
    q: [f32; NUM_JOINTS],
    dq: [f32; NUM_JOINTS],
    receives: u64,
    sent: u64,
    last_sent: Option<CommandFrame>,
}

/// In-process robot implementing [`RobotTransport`].
#[derive(Debug)]
pub struct SimRobot {
    params: SimParams,
    script: Vec<ScriptedPress>,
    state: Mutex<SimState>,
}

impl SimRobot {
    /// Robot at rest at `q` (hardware order).
    pub fn new(q: [f32; NUM_JOINTS], params: SimParams) -> Self {
        Self {
            params,
            script: Vec::new(),
            state: Mutex::new(SimState {
                q,
                dq: [0.0; NUM_JOINTS],
                receives: 0,
                sent: 0,
                last_sent: None,
            }),
        }
    }

    /// Add a scripted button press.
    pub fn with_press(mut self, press: ScriptedPress) -> Self {
        self.script.push(press);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current joint positions.
    pub fn positions(&self) -> [f32; NUM_JOINTS] {
        self.lock().q
    }

    pub fn frames_sent(&self) -> u64 {
        self.lock().sent
    }

    pub fn last_sent(&self) -> Option<CommandFrame> {
        self.lock().last_sent
    }

    fn buttons_at(&self, receive: u64) -> u16 {
        self.script
            .iter()
            .filter(|p| receive >= p.at && receive < p.at + p.hold)
            .fold(0, |acc, p| acc | p.button.mask())
    }
}

/// PD torque a motor would produce for `cmd` at the given joint state.
fn motor_torque(cmd: &MotorCommand, q: f32, dq: f32) -> f32 {
    match cmd.mode {
        MotorMode::Passive => 0.0,
        MotorMode::Servo | MotorMode::Torque => {
            cmd.kp * (cmd.q - q) + cmd.kd * (cmd.dq - dq) + cmd.tau
        }
    }
}

impl RobotTransport for SimRobot {
    fn receive(&self) -> Result<SensorSnapshot, TransportError> {
        let mut state = self.lock();
        let receive = state.receives;
        state.receives += 1;
        Ok(SensorSnapshot {
            q: state.q,
            dq: state.dq,
            imu: ImuState::default(),
            remote: RemoteState {
                buttons: self.buttons_at(receive),
                ..Default::default()
            },
        })
    }

    fn apply_power_limit(
        &self,
        mut frame: CommandFrame,
        state: &SensorSnapshot,
        level: u8,
    ) -> Result<CommandFrame, TransportError> {
        let budget = level.min(MAX_POWER_LEVEL) as f32 * TORQUE_PER_LEVEL;
        for (hw, cmd) in frame.motors.iter_mut().enumerate() {
            let tau = motor_torque(cmd, state.q[hw], state.dq[hw]).abs();
            if tau > budget {
                let scale = budget / tau;
                cmd.kp *= scale;
                cmd.kd *= scale;
                cmd.tau *= scale;
            }
        }
        Ok(frame)
    }

    fn send(&self, frame: &CommandFrame) -> Result<(), TransportError> {
        let p = self.params;
        let mut state = self.lock();
        for hw in 0..NUM_JOINTS {
            let (q, dq) = (state.q[hw], state.dq[hw]);
            let tau = motor_torque(&frame.motors[hw], q, dq) - p.friction * dq;
            let dq = dq + tau / p.inertia * p.dt;
            state.dq[hw] = dq;
            state.q[hw] = q + dq * p.dt;
        }
        state.sent += 1;
        state.last_sent = Some(*frame);
        Ok(())
    }
}

/// Backend returning the same tensor for every input.
#[derive(Debug, Clone)]
pub struct ConstantModel {
    output: Vec<f32>,
}

impl ConstantModel {
    pub fn new(output: Vec<f32>) -> Self {
        Self { output }
    }
}

impl ModelBackend for ConstantModel {
    fn invoke(&self, _input: &Tensor) -> Result<Tensor, String> {
        Ok(Tensor::row(self.output.clone()))
    }
}

/// Loads [`ConstantModel`]s without touching the filesystem.
#[derive(Debug, Clone)]
pub struct ConstantPolicyLoader {
    pub encoding_width: usize,
    pub latent_width: usize,
    pub action: [f32; NUM_JOINTS],
}

impl Default for ConstantPolicyLoader {
    fn default() -> Self {
        Self {
            encoding_width: 64,
            latent_width: 16,
            action: [0.0; NUM_JOINTS],
        }
    }
}

impl ModelLoader for ConstantPolicyLoader {
    fn load(&self, model: Model, path: &Path) -> Result<Box<dyn ModelBackend>, String> {
        tracing::debug!("Simulating {} model in place of {}", model, path.display());
        let output = match model {
            Model::Encoder => vec![0.0; self.encoding_width],
            Model::Quantizer => vec![0.0; self.latent_width],
            Model::Actor => self.action.to_vec(),
        };
        Ok(Box::new(ConstantModel::new(output)))
    }
}
