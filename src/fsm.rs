//! Startup state machine driven by the control task.
//!
//! ```text
//! WAITING --stand--> POSITIONING --start_policy--> POLICY_ARMING --ramp done--> POLICY_RUNNING
//! ```
//!
//! Each tick first runs the current phase's behaviour, then looks at button
//! edges. A button-driven transition therefore takes effect on the next tick,
//! while the arming → running switch happens inside the tick that completes
//! the ramp. Phases never move backwards.

use crate::command::{ActionMapper, CommandFrame};
use crate::config::{ButtonConfig, ControlConfig};
use crate::joint_map::NUM_JOINTS;
use crate::state::{Button, ControlPhase, SensorSnapshot, TargetJointState};

/// A phase change made during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ControlPhase,
    pub to: ControlPhase,
}

impl Transition {
    /// Whether this is the switch that hands control to the policy.
    pub fn starts_policy(&self) -> bool {
        self.to == ControlPhase::PolicyRunning
    }
}

/// Output of one control tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlStep {
    /// Proposed command, before the power clip.
    pub frame: CommandFrame,
    pub transition: Option<Transition>,
}

pub struct PhaseMachine {
    mapper: ActionMapper,
    buttons: ButtonConfig,
    step: f64,
    ramp_ticks: u64,
    phase: ControlPhase,
    /// Ramp ticks taken since entering POSITIONING.
    ramp_tick: u64,
    progress: f64,
    start_pose: [f32; NUM_JOINTS],
    /// Control ticks since construction.
    ticks: u64,
    last_buttons: Option<u16>,
    logged_decile: u32,
}

impl PhaseMachine {
    pub fn new(config: &ControlConfig, mapper: ActionMapper) -> Self {
        Self {
            mapper,
            buttons: config.buttons.clone(),
            step: config.stance.step,
            ramp_ticks: config.ramp_ticks(),
            phase: ControlPhase::Waiting,
            ramp_tick: 0,
            progress: 0.0,
            start_pose: [0.0; NUM_JOINTS],
            ticks: 0,
            last_buttons: None,
            logged_decile: 0,
        }
    }

    pub fn phase(&self) -> ControlPhase {
        self.phase
    }

    /// Stance ramp progress in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Pose the stance ramp starts from, hardware order.
    pub fn start_pose(&self) -> &[f32; NUM_JOINTS] {
        &self.start_pose
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn mapper(&self) -> &ActionMapper {
        &self.mapper
    }

    /// Advance one control tick.
    ///
    /// `target` is the latest published policy target; it is only read in
    /// POLICY_RUNNING, and the neutral target is used until one exists.
    pub fn tick(
        &mut self,
        snapshot: &SensorSnapshot,
        target: Option<&TargetJointState>,
    ) -> ControlStep {
        self.ticks += 1;
        let mut transition = None;

        let frame = match self.phase {
            ControlPhase::Waiting => {
                self.start_pose = snapshot.q;
                CommandFrame::passive(snapshot)
            }
            ControlPhase::Positioning | ControlPhase::PolicyArming => {
                self.advance_ramp();
                let frame = self
                    .mapper
                    .stance_command(&self.start_pose, self.progress as f32);
                if self.phase == ControlPhase::PolicyArming && self.progress >= 1.0 {
                    transition = Some(self.enter(ControlPhase::PolicyRunning));
                }
                frame
            }
            ControlPhase::PolicyRunning => match target {
                Some(target) => self.mapper.command(target),
                None => self.mapper.command(&self.mapper.neutral_target()),
            },
        };

        let buttons = snapshot.remote.buttons;
        if self.phase == ControlPhase::Waiting && self.edge(buttons, self.buttons.stand) {
            transition = Some(self.enter(ControlPhase::Positioning));
        } else if self.phase == ControlPhase::Positioning
            && self.edge(buttons, self.buttons.start_policy)
        {
            transition = Some(self.enter(ControlPhase::PolicyArming));
        }
        self.last_buttons = Some(buttons);

        ControlStep { frame, transition }
    }

    fn advance_ramp(&mut self) {
        self.ramp_tick = self.ramp_tick.saturating_add(1);
        self.progress = if self.ramp_tick >= self.ramp_ticks {
            1.0
        } else {
            (self.ramp_tick as f64 * self.step).min(1.0)
        };

        let decile = (self.progress * 10.0).floor() as u32;
        if decile > self.logged_decile {
            self.logged_decile = decile;
            tracing::info!(
                "Stance ramp {:.0}% (tick {})",
                self.progress * 100.0,
                self.ticks
            );
        }
    }

    /// Rising edge of `button`. Needs a previous tick to compare against.
    fn edge(&self, buttons: u16, button: Button) -> bool {
        let mask = button.mask();
        match self.last_buttons {
            Some(prev) => prev & mask == 0 && buttons & mask != 0,
            None => false,
        }
    }

    fn enter(&mut self, to: ControlPhase) -> Transition {
        let from = self.phase;
        self.phase = to;
        tracing::info!("Phase {} -> {} (tick {})", from, to, self.ticks);
        Transition { from, to }
    }
}

impl std::fmt::Debug for PhaseMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseMachine")
            .field("phase", &self.phase)
            .field("progress", &self.progress)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MotorMode;
    use crate::joint_map::JointMapping;
    use crate::state::RemoteState;

    fn machine() -> PhaseMachine {
        let config = ControlConfig::default();
        PhaseMachine::new(&config, ActionMapper::new(&config, JointMapping::a1()))
    }

    fn snapshot(q: f32, buttons: u16) -> SensorSnapshot {
        SensorSnapshot {
            q: [q; NUM_JOINTS],
            remote: RemoteState {
                buttons,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    const R1: u16 = 1 << 0;
    const R2: u16 = 1 << 4;

    /// Drive the machine into POSITIONING with measured pose `q`.
    fn stand(m: &mut PhaseMachine, q: f32) {
        m.tick(&snapshot(q, 0), None);
        m.tick(&snapshot(q, R2), None);
        assert_eq!(m.phase(), ControlPhase::Positioning);
    }

    #[test]
    fn test_waiting_is_passive_and_tracks_pose() {
        let mut m = machine();
        let step = m.tick(&snapshot(0.4, 0), None);
        assert!(step.transition.is_none());
        assert!(step.frame.motors.iter().all(|c| c.mode == MotorMode::Passive && c.kp == 0.0));
        assert_eq!(m.start_pose(), &[0.4; NUM_JOINTS]);
        m.tick(&snapshot(0.6, 0), None);
        assert_eq!(m.start_pose(), &[0.6; NUM_JOINTS]);
    }

    #[test]
    fn test_stand_edge_enters_positioning_next_tick() {
        let mut m = machine();
        m.tick(&snapshot(0.2, 0), None);
        let step = m.tick(&snapshot(0.3, R2), None);
        assert_eq!(
            step.transition,
            Some(Transition {
                from: ControlPhase::Waiting,
                to: ControlPhase::Positioning
            })
        );
        // The tick that saw the edge still commanded WAITING.
        assert_eq!(step.frame.motors[0].mode, MotorMode::Passive);
        assert_eq!(m.start_pose(), &[0.3; NUM_JOINTS]);

        // The next tick ramps from the pose captured at the edge.
        let next = m.tick(&snapshot(9.0, R2), None);
        assert_eq!(m.phase(), ControlPhase::Positioning);
        assert_eq!(next.frame.motors[0].mode, MotorMode::Servo);
        assert_eq!(m.start_pose(), &[0.3; NUM_JOINTS]);
    }

    #[test]
    fn test_button_held_at_boot_is_ignored() {
        let mut m = machine();
        m.tick(&snapshot(0.0, R2), None);
        m.tick(&snapshot(0.0, R2), None);
        assert_eq!(m.phase(), ControlPhase::Waiting);
    }

    #[test]
    fn test_start_policy_ignored_while_waiting() {
        let mut m = machine();
        m.tick(&snapshot(0.0, 0), None);
        m.tick(&snapshot(0.0, R1), None);
        assert_eq!(m.phase(), ControlPhase::Waiting);
    }

    #[test]
    fn test_ramp_reaches_stance_after_exact_tick_count() {
        let mut m = machine();
        stand(&mut m, 0.0);
        let stance_hw = JointMapping::a1().to_hardware(m.mapper().stance());

        let mut last = 0.0;
        for k in 1..=1000 {
            let step = m.tick(&snapshot(0.0, 0), None);
            let p = m.progress();
            assert!(p >= last && (0.0..=1.0).contains(&p), "tick {k}: {p}");
            last = p;
            if k == 1000 {
                assert_eq!(p, 1.0);
                assert_eq!(step.frame.positions(), stance_hw);
            } else {
                assert!(p < 1.0);
            }
        }
        for _ in 0..50 {
            m.tick(&snapshot(0.0, 0), None);
            assert_eq!(m.progress(), 1.0);
        }
        assert_eq!(m.phase(), ControlPhase::Positioning);
    }

    #[test]
    fn test_arming_runs_policy_on_ramp_completion_tick() {
        let mut m = machine();
        stand(&mut m, 0.0);
        for _ in 0..500 {
            m.tick(&snapshot(0.0, 0), None);
        }
        let step = m.tick(&snapshot(0.0, R1), None);
        assert_eq!(step.transition.map(|t| t.to), Some(ControlPhase::PolicyArming));

        // Ticks 502..=999 keep ramping in ARMING.
        for _ in 502..1000 {
            let step = m.tick(&snapshot(0.0, 0), None);
            assert!(step.transition.is_none());
            assert_eq!(m.phase(), ControlPhase::PolicyArming);
        }
        let step = m.tick(&snapshot(0.0, 0), None);
        assert_eq!(m.progress(), 1.0);
        let transition = step.transition.unwrap();
        assert!(transition.starts_policy());
        assert_eq!(transition.from, ControlPhase::PolicyArming);
        assert_eq!(m.phase(), ControlPhase::PolicyRunning);
    }

    #[test]
    fn test_arming_after_ramp_switches_next_tick() {
        let mut m = machine();
        stand(&mut m, 0.0);
        for _ in 0..1200 {
            m.tick(&snapshot(0.0, 0), None);
        }
        m.tick(&snapshot(0.0, R1), None);
        assert_eq!(m.phase(), ControlPhase::PolicyArming);
        let step = m.tick(&snapshot(0.0, R1), None);
        assert!(step.transition.unwrap().starts_policy());
    }

    #[test]
    fn test_running_uses_published_target() {
        let mut m = machine();
        stand(&mut m, 0.0);
        m.tick(&snapshot(0.0, R1), None);
        while m.phase() != ControlPhase::PolicyRunning {
            m.tick(&snapshot(0.0, 0), None);
        }

        let neutral = m.tick(&snapshot(0.0, 0), None);
        let stance_hw = JointMapping::a1().to_hardware(m.mapper().stance());
        assert_eq!(neutral.frame.positions(), stance_hw);
        assert_eq!(neutral.frame.motors[0].kp, 20.0);

        let target = TargetJointState::Position([0.5; NUM_JOINTS]);
        let step = m.tick(&snapshot(0.0, 0), Some(&target));
        assert_eq!(step.frame.positions(), [0.5; NUM_JOINTS]);
    }

    #[test]
    fn test_phase_never_moves_backward() {
        let mut m = machine();
        stand(&mut m, 0.0);
        m.tick(&snapshot(0.0, R1), None);
        let mut prev = m.phase();
        // Hammer both buttons through the rest of the ramp and beyond.
        for i in 0..3000u32 {
            let buttons = match i % 4 {
                0 => R2,
                1 => R1,
                2 => R1 | R2,
                _ => 0,
            };
            m.tick(&snapshot(0.0, buttons), None);
            assert!(m.phase() >= prev);
            prev = m.phase();
        }
        assert_eq!(m.phase(), ControlPhase::PolicyRunning);
    }

    #[test]
    fn test_tick_counter_increments() {
        let mut m = machine();
        for _ in 0..7 {
            m.tick(&snapshot(0.0, 0), None);
        }
        assert_eq!(m.ticks(), 7);
    }
}
