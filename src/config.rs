//! Controller configuration.
//!
//! All tuning constants live here. Defaults reproduce the A1 walking policy
//! deployment; a JSON file can override any subset of fields.
//!
//! ```no_run
//! use rlsar::config::ControlConfig;
//!
//! let config = ControlConfig::from_file("a1.json")?;
//! config.validate()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::joint_map::NUM_JOINTS;
use crate::state::Button;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// How policy actions drive the actuators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Actions offset the stance pose; actuators run PD position control.
    #[default]
    Position,
    /// Actions are joint torques; gains are zero.
    Torque,
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMode::Position => write!(f, "position"),
            ControlMode::Torque => write!(f, "torque"),
        }
    }
}

/// Loop periods in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopRates {
    pub receive_period_s: f64,
    pub send_period_s: f64,
    pub control_period_s: f64,
    pub inference_period_s: f64,
    /// Telemetry sampling period; `None` disables the telemetry task.
    pub telemetry_period_s: Option<f64>,
    /// Overdue ticks the receive and send loops may run back-to-back before skipping.
    pub io_backlog: u32,
}

impl Default for LoopRates {
    fn default() -> Self {
        Self {
            receive_period_s: 0.002,
            send_period_s: 0.002,
            control_period_s: 0.002,
            inference_period_s: 0.02,
            telemetry_period_s: None,
            io_backlog: 3,
        }
    }
}

/// Observation normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    pub lin_vel_scale: f32,
    pub ang_vel_scale: f32,
    pub dof_pos_scale: f32,
    pub dof_vel_scale: f32,
    /// Symmetric bound applied to every observation element.
    pub clip_obs: f32,
    /// Gravity direction in the world frame.
    pub gravity: [f32; 3],
}

impl ObservationConfig {
    /// Scale applied to the operator command (forward, lateral, yaw).
    pub fn commands_scale(&self) -> [f32; 3] {
        [self.lin_vel_scale, self.lin_vel_scale, self.ang_vel_scale]
    }
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            lin_vel_scale: 2.0,
            ang_vel_scale: 0.25,
            dof_pos_scale: 1.0,
            dof_vel_scale: 0.05,
            clip_obs: 100.0,
            gravity: [0.0, 0.0, -1.0],
        }
    }
}

/// Policy pipeline parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Observations in the encoder window.
    pub history_len: usize,
    /// Symmetric bound applied to raw actions.
    pub clip_actions: f32,
    pub action_scale: f32,
    /// Extra factor on hip actions in position mode.
    pub hip_scale_reduction: f32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            history_len: 6,
            clip_actions: 100.0,
            action_scale: 0.25,
            hip_scale_reduction: 0.5,
        }
    }
}

/// PD gains for each command source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainsConfig {
    /// Position-mode policy gains.
    pub stiffness: f32,
    pub damping: f32,
    /// Gains while ramping to the stance pose.
    pub stance_stiffness: f32,
    pub stance_damping: f32,
    /// Damping used by the hold command sent at shutdown.
    pub hold_damping: f32,
}

impl Default for GainsConfig {
    fn default() -> Self {
        Self {
            stiffness: 20.0,
            damping: 0.5,
            stance_stiffness: 50.0,
            stance_damping: 3.0,
            hold_damping: 3.0,
        }
    }
}

/// Stance pose and stance-entry ramp. Arrays are in policy order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StanceConfig {
    //                          hip   thigh  calf
    pub default_dof_pos: [f32; NUM_JOINTS],
    /// Ramp progress added per control tick.
    pub step: f64,
    /// Per-joint torque bound applied in torque mode (N·m).
    pub torque_limits: [f32; NUM_JOINTS],
}

impl Default for StanceConfig {
    fn default() -> Self {
        Self {
            default_dof_pos: [
                -0.1, 0.8, -1.5, //
                0.1, 0.8, -1.5, //
                -0.1, 1.0, -1.5, //
                0.1, 1.0, -1.5,
            ],
            step: 0.001,
            torque_limits: [
                20.0, 55.0, 55.0, //
                20.0, 55.0, 55.0, //
                20.0, 55.0, 55.0, //
                20.0, 55.0, 55.0,
            ],
        }
    }
}

/// Remote buttons driving the startup sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonConfig {
    /// WAITING → POSITIONING.
    pub stand: Button,
    /// POSITIONING → POLICY_ARMING.
    pub start_policy: Button,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            stand: Button::R2,
            start_policy: Button::R1,
        }
    }
}

/// Full controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Directory holding the encoder, quantizer and actor models.
    pub model_dir: PathBuf,
    pub mode: ControlMode,
    /// Power budget level handed to the transport's power clip.
    pub power_limit: u8,
    pub rates: LoopRates,
    pub observation: ObservationConfig,
    pub policy: PolicyConfig,
    pub gains: GainsConfig,
    pub stance: StanceConfig,
    pub buttons: ButtonConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            mode: ControlMode::Position,
            power_limit: 7,
            rates: LoopRates::default(),
            observation: ObservationConfig::default(),
            policy: PolicyConfig::default(),
            gains: GainsConfig::default(),
            stance: StanceConfig::default(),
            buttons: ButtonConfig::default(),
        }
    }
}

impl ControlConfig {
    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every value the controller relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = &self.rates;
        for (field, period) in [
            ("rates.receive_period_s", rates.receive_period_s),
            ("rates.send_period_s", rates.send_period_s),
            ("rates.control_period_s", rates.control_period_s),
            ("rates.inference_period_s", rates.inference_period_s),
        ] {
            check_period(field, period)?;
        }
        if let Some(period) = rates.telemetry_period_s {
            check_period("rates.telemetry_period_s", period)?;
        }

        if self.policy.history_len == 0 {
            return Err(ConfigError::invalid("policy.history_len", "must be at least 1"));
        }
        if !(self.policy.clip_actions > 0.0) {
            return Err(ConfigError::invalid("policy.clip_actions", "must be positive"));
        }
        if !(self.observation.clip_obs > 0.0) {
            return Err(ConfigError::invalid("observation.clip_obs", "must be positive"));
        }
        let step = self.stance.step;
        if !(step > 0.0 && step <= 1.0) {
            return Err(ConfigError::invalid(
                "stance.step",
                format!("{} is outside (0, 1]", step),
            ));
        }
        if self.stance.default_dof_pos.iter().any(|q| !q.is_finite()) {
            return Err(ConfigError::invalid(
                "stance.default_dof_pos",
                "contains a non-finite value",
            ));
        }
        if self.stance.torque_limits.iter().any(|t| !(*t >= 0.0)) {
            return Err(ConfigError::invalid(
                "stance.torque_limits",
                "limits must be non-negative",
            ));
        }
        if self.buttons.stand == self.buttons.start_policy {
            return Err(ConfigError::invalid(
                "buttons",
                "stand and start_policy must be different buttons",
            ));
        }
        Ok(())
    }

    /// Number of control ticks the stance ramp takes to reach 1.0.
    pub fn ramp_ticks(&self) -> u64 {
        (1.0 / self.stance.step - 1e-9).ceil().max(1.0) as u64
    }
}

fn check_period(field: &'static str, period: f64) -> Result<(), ConfigError> {
    if period.is_finite() && period > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("period {} must be positive", period)))
    }
}

/// Convert a validated period in seconds to a [`Duration`].
pub fn period(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds)
}
