//! Policy-order ↔ hardware-order joint index mapping.
//!
//! The policy was trained with legs ordered FL, FR, RL, RR while the motor bus
//! enumerates them FR, FL, RR, RL. Each leg has three joints (hip, thigh, calf)
//! in the same order on both sides, so the mapping swaps whole legs.
//!
//! ```text
//! hardware:  FR_0 FR_1 FR_2 | FL_0 FL_1 FL_2 | RR_0 RR_1 RR_2 | RL_0 RL_1 RL_2
//! policy:    FL_0 FL_1 FL_2 | FR_0 FR_1 FR_2 | RL_0 RL_1 RL_2 | RR_0 RR_1 RR_2
//! ```

/// Number of actuated joints on the robot.
pub const NUM_JOINTS: usize = 12;

/// Joints per leg (hip, thigh, calf).
pub const JOINTS_PER_LEG: usize = 3;

/// Policy index of the hip joint of every leg.
pub const HIP_JOINTS: [usize; 4] = [0, 3, 6, 9];

/// Hardware index → policy index for the A1 motor bus.
const A1_HARDWARE_TO_POLICY: [usize; NUM_JOINTS] = [3, 4, 5, 0, 1, 2, 9, 10, 11, 6, 7, 8];

/// Error returned when a table is not a permutation of `0..NUM_JOINTS`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("joint table is not a permutation: index {index} appears {count} times")]
pub struct MappingError {
    pub index: usize,
    pub count: usize,
}

/// Fixed bijection between policy and hardware joint order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointMapping {
    hw_to_policy: [usize; NUM_JOINTS],
    policy_to_hw: [usize; NUM_JOINTS],
}

impl JointMapping {
    /// Mapping used by the Unitree A1.
    pub fn a1() -> Self {
        Self {
            hw_to_policy: A1_HARDWARE_TO_POLICY,
            policy_to_hw: invert(&A1_HARDWARE_TO_POLICY),
        }
    }

    /// Build a mapping from a hardware → policy table.
    pub fn from_hardware_table(hw_to_policy: [usize; NUM_JOINTS]) -> Result<Self, MappingError> {
        let mut counts = [0usize; NUM_JOINTS];
        for &p in &hw_to_policy {
            if p >= NUM_JOINTS {
                return Err(MappingError { index: p, count: 1 });
            }
            counts[p] += 1;
        }
        if let Some((index, &count)) = counts.iter().enumerate().find(|(_, &c)| c != 1) {
            return Err(MappingError { index, count });
        }

        Ok(Self {
            hw_to_policy,
            policy_to_hw: invert(&hw_to_policy),
        })
    }

    /// Policy index driven by hardware joint `hw`.
    pub fn policy_index(&self, hw: usize) -> usize {
        self.hw_to_policy[hw]
    }

    /// Hardware joint that carries policy index `policy`.
    pub fn hardware_index(&self, policy: usize) -> usize {
        self.policy_to_hw[policy]
    }

    /// Reorder a hardware-ordered array into policy order.
    pub fn to_policy<T: Copy>(&self, hw: &[T; NUM_JOINTS]) -> [T; NUM_JOINTS] {
        std::array::from_fn(|p| hw[self.policy_to_hw[p]])
    }

    /// Reorder a policy-ordered array into hardware order.
    pub fn to_hardware<T: Copy>(&self, policy: &[T; NUM_JOINTS]) -> [T; NUM_JOINTS] {
        std::array::from_fn(|hw| policy[self.hw_to_policy[hw]])
    }
}

impl Default for JointMapping {
    fn default() -> Self {
        Self::a1()
    }
}

/// Inverse of a permutation table. The caller guarantees `table` is a permutation.
fn invert(table: &[usize; NUM_JOINTS]) -> [usize; NUM_JOINTS] {
    let mut inverse = [0usize; NUM_JOINTS];
    for (from, &to) in table.iter().enumerate() {
        inverse[to] = from;
    }
    inverse
}

/// Whether policy index `policy` is a hip joint.
pub fn is_hip(policy: usize) -> bool {
    policy % JOINTS_PER_LEG == 0
}
