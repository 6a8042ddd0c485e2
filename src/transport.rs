//! Robot transport seam.
//!
//! The vendor SDK owns the motor bus. The controller only needs three calls:
//! `receive` from the receive loop, `apply_power_limit` from the control loop,
//! and `send` from the send loop. At shutdown the final hold frame is clipped
//! and sent from the caller's thread once those loops have stopped.

use crate::command::CommandFrame;
use crate::state::SensorSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No fresh state this tick; try again.
    #[error("robot state not available: {0}")]
    NoData(String),

    #[error("robot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The link is gone for good.
    #[error("robot link lost: {0}")]
    Disconnected(String),
}

impl TransportError {
    /// Whether retrying on the next tick can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Disconnected(_))
    }
}

/// Connection to the robot.
pub trait RobotTransport: Send + Sync {
    /// Read the latest robot state.
    fn receive(&self) -> Result<SensorSnapshot, TransportError>;

    /// Clip `frame` to the power budget `level` given the measured `state`.
    ///
    /// This is the authoritative safety clip; every frame passes through it
    /// before it is sent.
    fn apply_power_limit(
        &self,
        frame: CommandFrame,
        state: &SensorSnapshot,
        level: u8,
    ) -> Result<CommandFrame, TransportError>;

    /// Transmit a clipped frame.
    fn send(&self, frame: &CommandFrame) -> Result<(), TransportError>;
}
