//! The control orchestrator.
//!
//! A [`Controller`] owns five periodic tasks sharing one [`SharedState`]:
//!
//! | task      | writes                 | reads                         |
//! |-----------|------------------------|-------------------------------|
//! | receive   | `sensors`              | transport                     |
//! | control   | `outgoing`, `phase`    | `sensors`, `target`           |
//! | inference | `target`               | `sensors`, `phase`, epoch     |
//! | send      | transport              | `outgoing`                    |
//! | telemetry | log                    | `sensors`, `outgoing`         |
//!
//! The inference task is started by the control task when the phase machine
//! hands over to the policy. Every frame passes through the transport's
//! power clip before it is staged for sending.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::command::{ActionMapper, CommandFrame};
use crate::config::{period, ControlConfig};
use crate::error::Result;
use crate::fsm::PhaseMachine;
use crate::inference::{InferenceError, PolicyModels};
use crate::joint_map::JointMapping;
use crate::observation::ObservationAssembler;
use crate::pipeline::InferencePipeline;
use crate::scheduler::{LoopStatsSnapshot, LoopTask, OverrunPolicy, TickError};
use crate::state::{ControlPhase, Latest, PhaseCell, SensorSnapshot, TargetJointState};
use crate::telemetry::TrackingMonitor;
use crate::transport::{RobotTransport, TransportError};

/// Cross-task state.
#[derive(Debug, Default)]
pub struct SharedState {
    /// Latest robot state.
    pub sensors: Latest<SensorSnapshot>,
    /// Latest policy target, policy order.
    pub target: Latest<TargetJointState>,
    /// Latest clipped frame, ready to send.
    pub outgoing: Latest<CommandFrame>,
    pub phase: PhaseCell,
    /// Bumped each time the policy is (re)started; the inference task resets
    /// its pipeline when it sees a new value.
    pub policy_epoch: AtomicU64,
}

fn transport_tick_error(err: TransportError) -> TickError {
    if err.is_transient() {
        TickError::retry(err)
    } else {
        TickError::fatal(err)
    }
}

fn inference_tick_error(err: InferenceError) -> TickError {
    match err {
        InferenceError::Invoke { .. } => TickError::retry(err),
        _ => TickError::fatal(err),
    }
}

fn no_snapshot() -> TickError {
    TickError::retry(anyhow::anyhow!("no robot state received yet"))
}

pub struct Controller {
    config: ControlConfig,
    transport: Arc<dyn RobotTransport>,
    shared: Arc<SharedState>,
    receive: LoopTask,
    control: LoopTask,
    send: LoopTask,
    inference: Arc<LoopTask>,
    telemetry: Option<LoopTask>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Controller {
    /// Build the controller and register its tasks. Nothing runs until
    /// [`Controller::start`].
    pub fn new(
        config: ControlConfig,
        transport: Arc<dyn RobotTransport>,
        models: PolicyModels,
    ) -> Result<Self> {
        Self::with_mapping(config, transport, models, JointMapping::a1())
    }

    pub fn with_mapping(
        config: ControlConfig,
        transport: Arc<dyn RobotTransport>,
        models: PolicyModels,
        mapping: JointMapping,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(SharedState::default());
        let mapper = ActionMapper::new(&config, mapping);
        let rates = &config.rates;
        let io_policy = OverrunPolicy::CatchUp {
            max_backlog: rates.io_backlog,
        };

        let receive = {
            let transport = Arc::clone(&transport);
            let shared = Arc::clone(&shared);
            LoopTask::new("receive", period(rates.receive_period_s), io_policy, move || {
                let snapshot = transport.receive().map_err(transport_tick_error)?;
                shared.sensors.publish(snapshot);
                Ok(())
            })
        };

        let inference = {
            let shared = Arc::clone(&shared);
            let mapper = mapper.clone();
            let assembler = ObservationAssembler::new(
                config.observation.clone(),
                mapping,
                config.stance.default_dof_pos,
            );
            let mut pipeline = InferencePipeline::new(
                models,
                assembler,
                config.policy.history_len,
                config.policy.clip_actions,
            );
            let mut epoch = 0;
            Arc::new(LoopTask::new(
                "inference",
                period(rates.inference_period_s),
                OverrunPolicy::Skip,
                move || {
                    if shared.phase.load() != ControlPhase::PolicyRunning {
                        return Ok(());
                    }
                    let current = shared.policy_epoch.load(Ordering::Acquire);
                    if current != epoch {
                        pipeline.reset();
                        epoch = current;
                        tracing::info!("Policy pipeline reset (epoch {})", epoch);
                    }
                    let snapshot = shared.sensors.load().ok_or_else(no_snapshot)?;
                    let step = pipeline.step(&snapshot).map_err(inference_tick_error)?;
                    shared.target.publish(mapper.target_from_action(&step.action));
                    Ok(())
                },
            ))
        };

        let control = {
            let transport = Arc::clone(&transport);
            let shared = Arc::clone(&shared);
            let inference = Arc::clone(&inference);
            let power_limit = config.power_limit;
            let mut machine = PhaseMachine::new(&config, mapper);
            LoopTask::new(
                "control",
                period(rates.control_period_s),
                OverrunPolicy::Skip,
                move || {
                    let snapshot = shared.sensors.load().ok_or_else(no_snapshot)?;
                    let target = shared.target.load();
                    let step = machine.tick(&snapshot, target.as_deref());

                    if let Some(transition) = step.transition {
                        shared.phase.store(transition.to);
                        if transition.starts_policy() {
                            shared.target.publish(machine.mapper().neutral_target());
                            shared.policy_epoch.fetch_add(1, Ordering::AcqRel);
                            if let Err(e) = inference.start() {
                                tracing::error!("Failed to start policy inference: {}", e);
                            }
                        }
                    }

                    let frame = transport
                        .apply_power_limit(step.frame, &snapshot, power_limit)
                        .map_err(transport_tick_error)?;
                    shared.outgoing.publish(frame);
                    Ok(())
                },
            )
        };

        let send = {
            let transport = Arc::clone(&transport);
            let shared = Arc::clone(&shared);
            LoopTask::new("send", period(rates.send_period_s), io_policy, move || {
                if let Some(frame) = shared.outgoing.load() {
                    transport.send(&frame).map_err(transport_tick_error)?;
                }
                Ok(())
            })
        };

        let telemetry = rates.telemetry_period_s.map(|seconds| {
            let shared = Arc::clone(&shared);
            // About one report per second.
            let mut monitor = TrackingMonitor::new((1.0 / seconds).round() as u32);
            LoopTask::new("telemetry", period(seconds), OverrunPolicy::Skip, move || {
                let (Some(state), Some(frame)) = (shared.sensors.load(), shared.outgoing.load())
                else {
                    return Ok(());
                };
                if let Some(report) = monitor.sample(&state, &frame) {
                    tracing::info!(
                        "Tracking error over {} samples: max {:.4} rad (joint {}), mean {:.4} rad, phase {}",
                        report.samples,
                        report.max_error,
                        report.joint,
                        report.mean_error,
                        shared.phase.load(),
                    );
                }
                Ok(())
            })
        });

        Ok(Self {
            config,
            transport,
            shared,
            receive,
            control,
            send,
            inference,
            telemetry,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn phase(&self) -> ControlPhase {
        self.shared.phase.load()
    }

    /// Start the receive, control, send and telemetry loops.
    pub fn start(&self) -> Result<()> {
        tracing::info!(
            "Starting controller ({} mode, power limit {})",
            self.config.mode,
            self.config.power_limit
        );
        self.started.store(true, Ordering::Release);
        self.receive.start()?;
        self.control.start()?;
        self.send.start()?;
        if let Some(telemetry) = &self.telemetry {
            telemetry.start()?;
        }
        Ok(())
    }

    /// Per-task loop statistics.
    pub fn stats(&self) -> Vec<(String, LoopStatsSnapshot)> {
        let mut tasks: Vec<&LoopTask> =
            vec![&self.receive, &self.control, &self.send, self.inference.as_ref()];
        if let Some(telemetry) = &self.telemetry {
            tasks.push(telemetry);
        }
        tasks
            .into_iter()
            .map(|t| (t.name().to_string(), t.stats()))
            .collect()
    }

    /// Ordered shutdown: inference, control, send, then a safe hold sent
    /// directly, then telemetry and receive. Blocks until every task has
    /// finished its current tick.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down controller in phase {}", self.phase());

        self.inference.shutdown();
        self.control.shutdown();
        self.send.shutdown();
        if self.started.load(Ordering::Acquire) {
            self.send_hold();
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.shutdown();
        }
        self.receive.shutdown();

        for (name, s) in self.stats() {
            tracing::info!(
                "Task {}: {} ticks, {} overruns, {} skipped, {} retries, worst lateness {}us",
                name,
                s.invocations,
                s.overruns,
                s.skipped,
                s.retries,
                s.max_lateness_us
            );
        }
        tracing::info!("Controller stopped");
    }

    /// Send a damping hold at the last measured pose. It is the last frame
    /// the robot receives.
    fn send_hold(&self) {
        let Some(snapshot) = self.shared.sensors.load() else {
            tracing::warn!("No robot state received; skipping hold command");
            return;
        };
        let hold = CommandFrame::damping_hold(&snapshot, self.config.gains.hold_damping);
        let frame = match self
            .transport
            .apply_power_limit(hold, &snapshot, self.config.power_limit)
        {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Power clip failed for hold command: {}", e);
                return;
            }
        };
        self.shared.outgoing.publish(frame);
        match self.transport.send(&frame) {
            Ok(()) => tracing::info!("Hold command sent"),
            Err(e) => tracing::error!("Failed to send hold command: {}", e),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("phase", &self.phase())
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MotorMode;
    use crate::inference::{ModelBackend, Tensor};
    use crate::joint_map::NUM_JOINTS;
    use crate::sim::{ConstantPolicyLoader, ScriptedPress, SimParams, SimRobot};
    use crate::state::Button;
    use std::time::{Duration, Instant};

    fn fast_config() -> ControlConfig {
        let mut config = ControlConfig::default();
        config.stance.step = 0.05;
        config.rates.inference_period_s = 0.004;
        config.rates.telemetry_period_s = Some(0.01);
        config
    }

    fn scripted_robot() -> Arc<SimRobot> {
        let stance = ControlConfig::default().stance.default_dof_pos;
        Arc::new(
            SimRobot::new(JointMapping::a1().to_hardware(&stance), SimParams::default())
                .with_press(ScriptedPress {
                    button: Button::R2,
                    at: 20,
                    hold: 20,
                })
                .with_press(ScriptedPress {
                    button: Button::R1,
                    at: 60,
                    hold: 20,
                }),
        )
    }

    fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_full_startup_sequence() {
        let robot = scripted_robot();
        let loader = ConstantPolicyLoader {
            action: [0.4; NUM_JOINTS],
            ..Default::default()
        };
        let models = PolicyModels::load("models", &loader).unwrap();
        let controller = Controller::new(fast_config(), robot.clone(), models).unwrap();
        assert_eq!(controller.phase(), ControlPhase::Waiting);
        controller.start().unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            controller.phase() == ControlPhase::PolicyRunning
        }));

        let stance = ControlConfig::default().stance.default_dof_pos;
        assert!(wait_for(Duration::from_secs(5), || {
            match controller.shared().target.load().as_deref() {
                Some(TargetJointState::Position(q)) => (q[1] - (stance[1] + 0.1)).abs() < 1e-6,
                _ => false,
            }
        }));
        let Some(TargetJointState::Position(q)) = controller.shared().target.load().as_deref().copied()
        else {
            panic!("expected a position target");
        };
        // Hip actions are halved.
        assert!((q[0] - (stance[0] + 0.05)).abs() < 1e-6);

        controller.shutdown();
        let last = robot.last_sent().unwrap();
        assert!(last
            .motors
            .iter()
            .all(|m| m.mode == MotorMode::Servo && m.kp == 0.0 && m.kd == 3.0));

        let stats = controller.stats();
        let inference = stats.iter().find(|(n, _)| n == "inference").unwrap();
        assert!(inference.1.invocations > 0);
        let sent = robot.frames_sent();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(robot.frames_sent(), sent);
    }

    #[test]
    fn test_inference_idle_until_policy() {
        let robot = Arc::new(SimRobot::new([0.0; NUM_JOINTS], SimParams::default()));
        let models = PolicyModels::load("models", &ConstantPolicyLoader::default()).unwrap();
        let controller = Controller::new(fast_config(), robot.clone(), models).unwrap();
        controller.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || robot.frames_sent() > 10));

        assert_eq!(controller.phase(), ControlPhase::Waiting);
        assert!(controller.shared().target.is_empty());
        let last = robot.last_sent().unwrap();
        assert!(last.motors.iter().all(|m| m.mode == MotorMode::Passive));
        controller.shutdown();
        let stats = controller.stats();
        let inference = stats.iter().find(|(n, _)| n == "inference").unwrap();
        assert_eq!(inference.1.invocations, 0);
    }

    struct FailingActor;

    impl ModelBackend for FailingActor {
        fn invoke(&self, _input: &Tensor) -> std::result::Result<Tensor, String> {
            Err("out of memory".to_string())
        }
    }

    #[test]
    fn test_model_failure_keeps_neutral_target() {
        let robot = scripted_robot();
        let models = PolicyModels::from_backends(
            Box::new(crate::sim::ConstantModel::new(vec![0.0; 8])),
            Box::new(crate::sim::ConstantModel::new(vec![0.0; 4])),
            Box::new(FailingActor),
        );
        let controller = Controller::new(fast_config(), robot.clone(), models).unwrap();
        controller.start().unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            controller.phase() == ControlPhase::PolicyRunning
        }));
        assert!(wait_for(Duration::from_secs(2), || {
            controller.stats().iter().any(|(n, s)| n == "inference" && s.retries >= 3)
        }));

        let stance = ControlConfig::default().stance.default_dof_pos;
        assert_eq!(
            controller.shared().target.load().as_deref(),
            Some(&TargetJointState::Position(stance))
        );
        let frames = robot.frames_sent();
        assert!(wait_for(Duration::from_secs(1), || robot.frames_sent() > frames + 5));
        controller.shutdown();
    }

    struct Silent;

    impl RobotTransport for Silent {
        fn receive(&self) -> std::result::Result<SensorSnapshot, TransportError> {
            Err(TransportError::NoData("no packet".into()))
        }

        fn apply_power_limit(
            &self,
            frame: CommandFrame,
            _state: &SensorSnapshot,
            _level: u8,
        ) -> std::result::Result<CommandFrame, TransportError> {
            Ok(frame)
        }

        fn send(&self, _frame: &CommandFrame) -> std::result::Result<(), TransportError> {
            panic!("nothing should be sent without robot state");
        }
    }

    #[test]
    fn test_nothing_sent_without_state() {
        let models = PolicyModels::load("models", &ConstantPolicyLoader::default()).unwrap();
        let controller = Controller::new(fast_config(), Arc::new(Silent), models).unwrap();
        controller.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || {
            controller.stats().iter().any(|(n, s)| n == "control" && s.retries >= 5)
        }));
        assert!(controller.shared().outgoing.is_empty());
        controller.shutdown();
        let stats = controller.stats();
        let send = stats.iter().find(|(n, _)| n == "send").unwrap();
        assert!(send.1.invocations > 0);
        assert_eq!(send.1.retries, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ControlConfig::default();
        config.policy.history_len = 0;
        let models = PolicyModels::load("models", &ConstantPolicyLoader::default()).unwrap();
        let robot = Arc::new(SimRobot::new([0.0; NUM_JOINTS], SimParams::default()));
        assert!(matches!(
            Controller::new(config, robot, models),
            Err(crate::error::ControlError::Config(_))
        ));
    }

    #[test]
    fn test_shutdown_idempotent_and_unstarted_sends_nothing() {
        let robot = Arc::new(SimRobot::new([0.0; NUM_JOINTS], SimParams::default()));
        let models = PolicyModels::load("models", &ConstantPolicyLoader::default()).unwrap();
        let controller = Controller::new(fast_config(), robot.clone(), models).unwrap();
        controller.shutdown();
        controller.shutdown();
        drop(controller);
        assert_eq!(robot.frames_sent(), 0);
    }
}
