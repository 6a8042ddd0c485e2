//! Encoder → quantizer → actor pipeline, run once per inference tick.

use crate::command::clamp_symmetric;
use crate::history::HistoryBuffer;
use crate::inference::{InferenceError, Model, PolicyModels, Tensor};
use crate::joint_map::NUM_JOINTS;
use crate::observation::{ObservationAssembler, OBS_DIM};
use crate::state::SensorSnapshot;

/// Result of one pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStep {
    /// Actor output as returned.
    pub raw_action: [f32; NUM_JOINTS],
    /// `raw_action` clamped to `±clip_actions`.
    pub action: [f32; NUM_JOINTS],
}

/// Owns the observation history and runs the three models.
pub struct InferencePipeline {
    models: PolicyModels,
    assembler: ObservationAssembler,
    history: HistoryBuffer,
    clip_actions: f32,
}

impl InferencePipeline {
    pub fn new(
        models: PolicyModels,
        assembler: ObservationAssembler,
        history_len: usize,
        clip_actions: f32,
    ) -> Self {
        Self {
            models,
            assembler,
            history: HistoryBuffer::new(history_len, OBS_DIM),
            clip_actions,
        }
    }

    /// Clear the previous action and the history. The next step refills the
    /// history from its own observation.
    pub fn reset(&mut self) {
        self.assembler.reset();
        self.history.reset();
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn previous_action(&self) -> &[f32; NUM_JOINTS] {
        self.assembler.previous_action()
    }

    /// Compute the next action from `snapshot`.
    ///
    /// On a model failure the history already holds this tick's observation
    /// but the previous action is left unchanged.
    pub fn step(&mut self, snapshot: &SensorSnapshot) -> Result<PolicyStep, InferenceError> {
        let obs = self.assembler.assemble(snapshot);
        self.history.insert(&obs);

        // Non-empty right after an insert.
        let window = self.history.flattened().unwrap_or_default();
        let encoding = self.models.invoke(Model::Encoder, &Tensor::row(window))?;
        let latent = self.models.invoke(Model::Quantizer, &encoding)?;

        let mut actor_input = obs;
        actor_input.extend_from_slice(latent.data());
        let output = self.models.invoke(Model::Actor, &Tensor::row(actor_input))?;

        let raw_action: [f32; NUM_JOINTS] =
            output
                .data()
                .try_into()
                .map_err(|_| InferenceError::OutputWidth {
                    model: Model::Actor,
                    got: output.len(),
                    expected: NUM_JOINTS,
                })?;
        self.assembler.set_previous_action(raw_action);

        let mut action = raw_action;
        clamp_symmetric(&mut action, self.clip_actions);
        Ok(PolicyStep { raw_action, action })
    }
}

impl std::fmt::Debug for InferencePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferencePipeline")
            .field("history_len", &self.history.capacity())
            .field("clip_actions", &self.clip_actions)
            .finish_non_exhaustive()
    }
}
