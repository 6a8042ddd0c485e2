//! Shared state exchanged between the periodic tasks.
//!
//! Every cross-rate value is published whole through [`Latest`], an
//! [`ArcSwapOption`] cell: the writer builds a complete value and swaps it in,
//! readers load an `Arc` to an immutable value. A reader therefore never sees
//! fields from two different publications.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::joint_map::NUM_JOINTS;

/// Size of the wireless remote block embedded in the robot state.
pub const WIRELESS_REMOTE_LEN: usize = 40;

/// Remote-control buttons, by bit position in the 16-bit key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Button {
    R1,
    L1,
    Start,
    Select,
    R2,
    L2,
    F1,
    F2,
    A,
    B,
    X,
    Y,
    Up,
    Right,
    Down,
    Left,
}

impl Button {
    /// Bit mask of this button in [`RemoteState::buttons`].
    pub fn mask(self) -> u16 {
        1 << (self as u16)
    }
}

/// Decoded wireless remote state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RemoteState {
    /// Button bitfield, see [`Button::mask`].
    pub buttons: u16,
    /// Left stick, horizontal.
    pub lx: f32,
    /// Left stick, vertical.
    pub ly: f32,
    /// Right stick, horizontal.
    pub rx: f32,
    /// Right stick, vertical.
    pub ry: f32,
    /// Analog L2 trigger.
    pub l2: f32,
}

impl RemoteState {
    /// Decode the 40-byte wireless remote block.
    ///
    /// ```text
    /// [0..2)   header
    /// [2..4)   buttons  u16 LE
    /// [4..8)   lx       f32 LE
    /// [8..12)  rx       f32 LE
    /// [12..16) ry       f32 LE
    /// [16..20) L2       f32 LE
    /// [20..24) ly       f32 LE
    /// [24..40) reserved
    /// ```
    pub fn from_wireless(raw: &[u8; WIRELESS_REMOTE_LEN]) -> Self {
        let f = |at: usize| f32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Self {
            buttons: u16::from_le_bytes([raw[2], raw[3]]),
            lx: f(4),
            rx: f(8),
            ry: f(12),
            l2: f(16),
            ly: f(20),
        }
    }

    /// Whether `button` is held.
    pub fn is_pressed(&self, button: Button) -> bool {
        self.buttons & button.mask() != 0
    }

    /// Operator velocity intent: forward, lateral, yaw.
    pub fn command(&self) -> [f32; 3] {
        [self.ly, -self.rx, -self.lx]
    }
}

/// Inertial measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuState {
    /// Angular velocity (rad/s).
    pub gyroscope: [f32; 3],
    /// Orientation quaternion, w first.
    pub quaternion: [f32; 4],
}

impl Default for ImuState {
    fn default() -> Self {
        Self {
            gyroscope: [0.0; 3],
            quaternion: [1.0, 0.0, 0.0, 0.0],
        }
    }
}

/// One receive tick worth of robot state. Joint arrays are in hardware order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSnapshot {
    /// Joint positions (rad).
    pub q: [f32; NUM_JOINTS],
    /// Joint velocities (rad/s).
    pub dq: [f32; NUM_JOINTS],
    pub imu: ImuState,
    pub remote: RemoteState,
}

/// Desired per-joint state published by the inference task, in policy order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetJointState {
    /// Joint position targets (rad).
    Position([f32; NUM_JOINTS]),
    /// Joint torque targets (N·m).
    Torque([f32; NUM_JOINTS]),
}

/// Single-writer, many-reader latest-value cell.
pub struct Latest<T> {
    cell: ArcSwapOption<T>,
}

impl<T> Latest<T> {
    /// Create an empty cell.
    pub fn empty() -> Self {
        Self {
            cell: ArcSwapOption::empty(),
        }
    }

    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            cell: ArcSwapOption::from_pointee(value),
        }
    }

    /// Replace the current value.
    pub fn publish(&self, value: T) {
        self.cell.store(Some(Arc::new(value)));
    }

    /// The most recently published value, if any.
    pub fn load(&self) -> Option<Arc<T>> {
        self.cell.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.cell.load().is_none()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Latest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Latest").field(&self.cell.load().as_deref()).finish()
    }
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Phase of the control state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ControlPhase {
    /// Passive; tracking the measured pose.
    Waiting = 0,
    /// Ramping from the captured pose to the stance pose.
    Positioning = 1,
    /// Policy requested; finishing the ramp.
    PolicyArming = 2,
    /// Policy in control.
    PolicyRunning = 3,
}

impl ControlPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ControlPhase::Waiting,
            1 => ControlPhase::Positioning,
            2 => ControlPhase::PolicyArming,
            _ => ControlPhase::PolicyRunning,
        }
    }
}

impl std::fmt::Display for ControlPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlPhase::Waiting => write!(f, "WAITING"),
            ControlPhase::Positioning => write!(f, "POSITIONING"),
            ControlPhase::PolicyArming => write!(f, "POLICY_ARMING"),
            ControlPhase::PolicyRunning => write!(f, "POLICY_RUNNING"),
        }
    }
}

/// Read-only mirror of the control phase for other tasks.
///
/// Only the control task stores into it.
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn store(&self, phase: ControlPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    pub fn load(&self) -> ControlPhase {
        ControlPhase::from_u8(self.0.load(Ordering::Acquire))
    }
}
