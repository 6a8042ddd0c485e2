//! Policy observation assembly.
//!
//! Layout (45 elements):
//!
//! ```text
//! [0..3)   base angular velocity, body frame   * ang_vel_scale
//! [3..6)   projected gravity, body frame
//! [6..9)   operator command                     * commands_scale
//! [9..21)  joint position - stance              * dof_pos_scale
//! [21..33) joint velocity                       * dof_vel_scale
//! [33..45) previous raw action
//! ```
//!
//! Joint blocks are in policy order. The whole vector is clamped to
//! `±clip_obs`.

use crate::config::ObservationConfig;
use crate::joint_map::{JointMapping, NUM_JOINTS};
use crate::state::SensorSnapshot;

/// Observation width produced by [`ObservationAssembler`].
pub const OBS_DIM: usize = 3 + 3 + 3 + NUM_JOINTS * 3;

/// Rotate `v` by the inverse of the unit quaternion `q` given as `[x, y, z, w]`.
pub fn quat_rotate_inverse(q: [f32; 4], v: [f32; 3]) -> [f32; 3] {
    let [x, y, z, w] = q;
    let qv = [x, y, z];
    let a_scale = 2.0 * w * w - 1.0;
    let cross = [
        qv[1] * v[2] - qv[2] * v[1],
        qv[2] * v[0] - qv[0] * v[2],
        qv[0] * v[1] - qv[1] * v[0],
    ];
    let dot = qv[0] * v[0] + qv[1] * v[1] + qv[2] * v[2];
    std::array::from_fn(|i| v[i] * a_scale - cross[i] * w * 2.0 + qv[i] * dot * 2.0)
}

/// Builds observations from sensor snapshots.
///
/// Holds the previous raw action; everything else is read from the snapshot,
/// so the same snapshot and previous action always produce the same vector.
#[derive(Debug, Clone)]
pub struct ObservationAssembler {
    config: ObservationConfig,
    mapping: JointMapping,
    default_dof_pos: [f32; NUM_JOINTS],
    previous_action: [f32; NUM_JOINTS],
}

impl ObservationAssembler {
    pub fn new(
        config: ObservationConfig,
        mapping: JointMapping,
        default_dof_pos: [f32; NUM_JOINTS],
    ) -> Self {
        Self {
            config,
            mapping,
            default_dof_pos,
            previous_action: [0.0; NUM_JOINTS],
        }
    }

    /// Forget the previous action.
    pub fn reset(&mut self) {
        self.previous_action = [0.0; NUM_JOINTS];
    }

    pub fn previous_action(&self) -> &[f32; NUM_JOINTS] {
        &self.previous_action
    }

    pub fn set_previous_action(&mut self, action: [f32; NUM_JOINTS]) {
        self.previous_action = action;
    }

    /// Build one observation vector.
    pub fn assemble(&self, snapshot: &SensorSnapshot) -> Vec<f32> {
        let cfg = &self.config;
        let [w, x, y, z] = snapshot.imu.quaternion;
        let quat = [x, y, z, w];

        let ang_vel = quat_rotate_inverse(quat, snapshot.imu.gyroscope);
        let gravity = quat_rotate_inverse(quat, cfg.gravity);
        let command = snapshot.remote.command();
        let commands_scale = cfg.commands_scale();
        let q = self.mapping.to_policy(&snapshot.q);
        let dq = self.mapping.to_policy(&snapshot.dq);

        let mut obs = Vec::with_capacity(OBS_DIM);
        obs.extend(ang_vel.iter().map(|v| v * cfg.ang_vel_scale));
        obs.extend_from_slice(&gravity);
        obs.extend(command.iter().zip(commands_scale).map(|(c, s)| c * s));
        obs.extend(
            q.iter()
                .zip(&self.default_dof_pos)
                .map(|(q, q0)| (q - q0) * cfg.dof_pos_scale),
        );
        obs.extend(dq.iter().map(|v| v * cfg.dof_vel_scale));
        obs.extend_from_slice(&self.previous_action);

        crate::command::clamp_symmetric(&mut obs, cfg.clip_obs);
        obs
    }
}
