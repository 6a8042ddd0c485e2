//! rlsar - real-time learned-policy locomotion controller.
//!
//! Drives a 12-joint quadruped from a trained encoder → quantizer → actor
//! policy. Robot state is read and commands are written at a high rate while
//! the policy runs at a slower one; the two sides meet through lock-free
//! latest-value cells.
//!
//! # Components
//!
//! - [`scheduler`]: periodic tasks on dedicated threads
//! - [`fsm`]: WAITING → POSITIONING → POLICY_ARMING → POLICY_RUNNING startup sequence
//! - [`observation`] and [`history`]: policy input assembly
//! - [`pipeline`]: inference sequencing over the [`inference`] backend seam
//! - [`command`]: action → actuator command mapping
//! - [`controller`]: wires everything to a [`transport::RobotTransport`]
//! - [`sim`]: simulated robot and constant policy for running without hardware
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rlsar::sim::{ConstantPolicyLoader, SimParams, SimRobot};
//! use rlsar::{ControlConfig, Controller, PolicyModels};
//!
//! let config = ControlConfig::default();
//! let models = PolicyModels::load(&config.model_dir, &ConstantPolicyLoader::default())?;
//! let robot = Arc::new(SimRobot::new([0.0; 12], SimParams::default()));
//! let controller = Controller::new(config, robot, models)?;
//! controller.start()?;
//! // ...
//! controller.shutdown();
//! # Ok::<(), rlsar::ControlError>(())
//! ```

pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod fsm;
pub mod history;
pub mod inference;
pub mod joint_map;
pub mod observation;
pub mod pipeline;
pub mod scheduler;
pub mod sim;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use command::{ActionMapper, CommandFrame, MotorCommand, MotorMode};
pub use config::{ControlConfig, ControlMode};
pub use controller::{Controller, SharedState};
pub use error::ControlError;
pub use fsm::PhaseMachine;
pub use inference::{Model, ModelBackend, ModelLoader, PolicyModels, Tensor};
pub use joint_map::JointMapping;
pub use scheduler::{LoopTask, OverrunPolicy, TickError};
pub use state::{ControlPhase, SensorSnapshot, TargetJointState};
pub use transport::{RobotTransport, TransportError};
