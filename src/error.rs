use crate::config::ConfigError;
use crate::inference::InferenceError;
use crate::joint_map::MappingError;
use crate::scheduler::SchedulerError;
use crate::transport::TransportError;

/// Errors that prevent the controller from starting.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

pub type Result<T> = std::result::Result<T, ControlError>;
