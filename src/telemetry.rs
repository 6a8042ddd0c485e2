//! Joint tracking telemetry.
//!
//! Compares the staged command against the measured pose and summarises the
//! worst tracking error over a window of samples.

use crate::command::{CommandFrame, MotorMode};
use crate::joint_map::NUM_JOINTS;
use crate::state::SensorSnapshot;

/// Summary of one telemetry window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingReport {
    /// Samples in the window.
    pub samples: u32,
    /// Largest `|commanded - measured|` position error (rad).
    pub max_error: f32,
    /// Hardware joint index where `max_error` occurred.
    pub joint: usize,
    /// Mean of the per-sample worst error (rad).
    pub mean_error: f32,
}

/// Accumulates tracking error until a report is due.
#[derive(Debug, Clone)]
pub struct TrackingMonitor {
    report_every: u32,
    samples: u32,
    max_error: f32,
    joint: usize,
    sum_error: f64,
}

impl TrackingMonitor {
    pub fn new(report_every: u32) -> Self {
        Self {
            report_every: report_every.max(1),
            samples: 0,
            max_error: 0.0,
            joint: 0,
            sum_error: 0.0,
        }
    }

    /// Record one sample; returns a report every `report_every` samples.
    ///
    /// Passive and torque frames command no position and are not counted.
    pub fn sample(&mut self, state: &SensorSnapshot, frame: &CommandFrame) -> Option<TrackingReport> {
        if frame.motors.iter().any(|m| m.mode != MotorMode::Servo || m.kp == 0.0) {
            return None;
        }

        let mut worst = 0.0f32;
        let mut worst_joint = 0;
        for hw in 0..NUM_JOINTS {
            let err = (frame.motors[hw].q - state.q[hw]).abs();
            if err > worst {
                worst = err;
                worst_joint = hw;
            }
        }
        if worst > self.max_error || self.samples == 0 {
            self.max_error = worst;
            self.joint = worst_joint;
        }
        self.sum_error += worst as f64;
        self.samples += 1;

        if self.samples < self.report_every {
            return None;
        }
        let report = TrackingReport {
            samples: self.samples,
            max_error: self.max_error,
            joint: self.joint,
            mean_error: (self.sum_error / self.samples as f64) as f32,
        };
        *self = Self::new(self.report_every);
        Some(report)
    }
}
