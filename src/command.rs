//! Actuator command frames and the action → command mapping.

use crate::config::{ControlConfig, ControlMode};
use crate::joint_map::{is_hip, JointMapping, NUM_JOINTS};
use crate::state::{SensorSnapshot, TargetJointState};

/// Motor control mode flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MotorMode {
    /// Motor unpowered.
    #[default]
    Passive,
    /// PD tracking of position/velocity targets plus feed-forward torque.
    Servo,
    /// Direct torque: gains are zero and only `tau` is applied.
    Torque,
}

impl MotorMode {
    /// Mode byte understood by the motor controller. Torque control runs in
    /// servo mode with zero gains.
    pub fn wire_code(self) -> u8 {
        match self {
            MotorMode::Passive => 0x00,
            MotorMode::Servo | MotorMode::Torque => 0x0A,
        }
    }
}

/// Command for one motor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorCommand {
    pub mode: MotorMode,
    /// Target position (rad).
    pub q: f32,
    /// Target velocity (rad/s).
    pub dq: f32,
    /// Position gain.
    pub kp: f32,
    /// Velocity gain.
    pub kd: f32,
    /// Feed-forward torque (N·m).
    pub tau: f32,
}

/// One command per motor, in hardware order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommandFrame {
    pub motors: [MotorCommand; NUM_JOINTS],
}

impl CommandFrame {
    /// Passive frame holding the measured pose with zero gains.
    pub fn passive(snapshot: &SensorSnapshot) -> Self {
        Self {
            motors: std::array::from_fn(|hw| MotorCommand {
                mode: MotorMode::Passive,
                q: snapshot.q[hw],
                ..Default::default()
            }),
        }
    }

    /// Damping-only frame: stiffness zero, so joints are free to settle while
    /// velocity is resisted.
    pub fn damping_hold(snapshot: &SensorSnapshot, kd: f32) -> Self {
        Self {
            motors: std::array::from_fn(|hw| MotorCommand {
                mode: MotorMode::Servo,
                q: snapshot.q[hw],
                kd,
                ..Default::default()
            }),
        }
    }

    /// Commanded positions in hardware order.
    pub fn positions(&self) -> [f32; NUM_JOINTS] {
        std::array::from_fn(|hw| self.motors[hw].q)
    }
}

/// Element-wise symmetric clamp to `[-bound, bound]`.
pub fn clamp_symmetric(values: &mut [f32], bound: f32) {
    for v in values {
        *v = v.clamp(-bound, bound);
    }
}

/// Converts policy actions into joint targets and joint targets into frames.
#[derive(Debug, Clone)]
pub struct ActionMapper {
    mode: ControlMode,
    mapping: JointMapping,
    default_dof_pos: [f32; NUM_JOINTS],
    action_scale: f32,
    hip_scale_reduction: f32,
    torque_limits: [f32; NUM_JOINTS],
    stiffness: f32,
    damping: f32,
    stance_stiffness: f32,
    stance_damping: f32,
}

impl ActionMapper {
    pub fn new(config: &ControlConfig, mapping: JointMapping) -> Self {
        Self {
            mode: config.mode,
            mapping,
            default_dof_pos: config.stance.default_dof_pos,
            action_scale: config.policy.action_scale,
            hip_scale_reduction: config.policy.hip_scale_reduction,
            torque_limits: config.stance.torque_limits,
            stiffness: config.gains.stiffness,
            damping: config.gains.damping,
            stance_stiffness: config.gains.stance_stiffness,
            stance_damping: config.gains.stance_damping,
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn mapping(&self) -> &JointMapping {
        &self.mapping
    }

    /// Stance pose in policy order.
    pub fn stance(&self) -> &[f32; NUM_JOINTS] {
        &self.default_dof_pos
    }

    /// Target the policy loop starts from: the stance pose, or zero torque.
    pub fn neutral_target(&self) -> TargetJointState {
        match self.mode {
            ControlMode::Position => TargetJointState::Position(self.default_dof_pos),
            ControlMode::Torque => TargetJointState::Torque([0.0; NUM_JOINTS]),
        }
    }

    /// Joint target for a clamped action vector (policy order).
    pub fn target_from_action(&self, action: &[f32; NUM_JOINTS]) -> TargetJointState {
        match self.mode {
            ControlMode::Position => TargetJointState::Position(std::array::from_fn(|p| {
                let mut scaled = action[p] * self.action_scale;
                if is_hip(p) {
                    scaled *= self.hip_scale_reduction;
                }
                self.default_dof_pos[p] + scaled
            })),
            ControlMode::Torque => TargetJointState::Torque(std::array::from_fn(|p| {
                action[p].clamp(-self.torque_limits[p], self.torque_limits[p])
            })),
        }
    }

    /// Frame for a published joint target, remapped to hardware order.
    pub fn command(&self, target: &TargetJointState) -> CommandFrame {
        let motors = match *target {
            TargetJointState::Position(q) => {
                let q = self.mapping.to_hardware(&q);
                std::array::from_fn(|hw| MotorCommand {
                    mode: MotorMode::Servo,
                    q: q[hw],
                    dq: 0.0,
                    kp: self.stiffness,
                    kd: self.damping,
                    tau: 0.0,
                })
            }
            TargetJointState::Torque(tau) => {
                let tau = self.mapping.to_hardware(&tau);
                std::array::from_fn(|hw| MotorCommand {
                    mode: MotorMode::Torque,
                    tau: tau[hw],
                    ..Default::default()
                })
            }
        };
        CommandFrame { motors }
    }

    /// Stance-entry frame: linear interpolation from `start` (hardware order)
    /// towards the stance pose at `progress` in `[0, 1]`.
    pub fn stance_command(&self, start: &[f32; NUM_JOINTS], progress: f32) -> CommandFrame {
        let stance = self.mapping.to_hardware(&self.default_dof_pos);
        CommandFrame {
            motors: std::array::from_fn(|hw| MotorCommand {
                mode: MotorMode::Servo,
                q: (1.0 - progress) * start[hw] + progress * stance[hw],
                dq: 0.0,
                kp: self.stance_stiffness,
                kd: self.stance_damping,
                tau: 0.0,
            }),
        }
    }
}
