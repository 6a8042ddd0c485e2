//! Inference runtime seam.
//!
//! The policy is three trained models run in sequence. This crate does not
//! implement the models; a [`ModelLoader`] turns a model file into a
//! [`ModelBackend`] that maps one input tensor to one output tensor.
//!
//! # Example
//!
//! ```ignore
//! use rlsar::inference::{Model, PolicyModels, Tensor};
//!
//! let models = PolicyModels::load("models", &my_loader)?;
//! let encoding = models.invoke(Model::Encoder, &Tensor::row(window))?;
//! ```

use std::path::{Path, PathBuf};

/// Errors raised by model loading and invocation.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("failed to load {model} model from {path}: {reason}")]
    Load {
        model: Model,
        path: PathBuf,
        reason: String,
    },

    #[error("{model} model invocation failed: {reason}")]
    Invoke { model: Model, reason: String },

    #[error("invalid tensor shape {shape:?} for {len} elements")]
    Shape { shape: Vec<usize>, len: usize },

    #[error("{model} model returned {got} elements, expected {expected}")]
    OutputWidth {
        model: Model,
        got: usize,
        expected: usize,
    },
}

/// The three models of the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    /// Observation window → encoding.
    Encoder,
    /// Encoding → latent code.
    Quantizer,
    /// Observation + latent code → action.
    Actor,
}

impl Model {
    pub const ALL: [Model; 3] = [Model::Encoder, Model::Quantizer, Model::Actor];

    /// File name of the model inside the model directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Model::Encoder => "encoder.pt",
            Model::Quantizer => "vq_layer.pt",
            Model::Actor => "actor.pt",
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Model::Encoder => write!(f, "encoder"),
            Model::Quantizer => write!(f, "quantizer"),
            Model::Actor => write!(f, "actor"),
        }
    }
}

/// Dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that `shape` covers `data` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, InferenceError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(InferenceError::Shape {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// A `[1, n]` batch of one row.
    pub fn row(data: Vec<f32>) -> Self {
        Self {
            shape: vec![1, data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A loaded model.
///
/// Backends are read-only after loading and only ever invoked from one task.
pub trait ModelBackend: Send + Sync {
    fn invoke(&self, input: &Tensor) -> Result<Tensor, String>;
}

/// Loads model files into backends.
pub trait ModelLoader {
    fn load(&self, model: Model, path: &Path) -> Result<Box<dyn ModelBackend>, String>;
}

/// The encoder, quantizer and actor, loaded once at startup.
pub struct PolicyModels {
    encoder: Box<dyn ModelBackend>,
    quantizer: Box<dyn ModelBackend>,
    actor: Box<dyn ModelBackend>,
}

impl PolicyModels {
    /// Load all three models from `dir`. Fails on the first model that does not load.
    pub fn load(dir: impl AsRef<Path>, loader: &dyn ModelLoader) -> Result<Self, InferenceError> {
        let dir = dir.as_ref();
        let load = |model: Model| {
            let path = dir.join(model.file_name());
            tracing::info!("Loading {} model from {}", model, path.display());
            loader
                .load(model, &path)
                .map_err(|reason| InferenceError::Load {
                    model,
                    path,
                    reason,
                })
        };
        Ok(Self {
            encoder: load(Model::Encoder)?,
            quantizer: load(Model::Quantizer)?,
            actor: load(Model::Actor)?,
        })
    }

    /// Assemble from already-loaded backends.
    pub fn from_backends(
        encoder: Box<dyn ModelBackend>,
        quantizer: Box<dyn ModelBackend>,
        actor: Box<dyn ModelBackend>,
    ) -> Self {
        Self {
            encoder,
            quantizer,
            actor,
        }
    }

    /// Run one model.
    pub fn invoke(&self, model: Model, input: &Tensor) -> Result<Tensor, InferenceError> {
        let backend = match model {
            Model::Encoder => &self.encoder,
            Model::Quantizer => &self.quantizer,
            Model::Actor => &self.actor,
        };
        backend
            .invoke(input)
            .map_err(|reason| InferenceError::Invoke { model, reason })
    }
}

impl std::fmt::Debug for PolicyModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyModels").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Echo;

    impl ModelBackend for Echo {
        fn invoke(&self, input: &Tensor) -> Result<Tensor, String> {
            Ok(input.clone())
        }
    }

    /// Records load paths; fails for one model.
    struct RecordingLoader {
        fail: Option<Model>,
        seen: Mutex<Vec<PathBuf>>,
    }

    impl ModelLoader for RecordingLoader {
        fn load(&self, model: Model, path: &Path) -> Result<Box<dyn ModelBackend>, String> {
            self.seen.lock().unwrap().push(path.to_path_buf());
            if self.fail == Some(model) {
                return Err("corrupt file".to_string());
            }
            Ok(Box::new(Echo))
        }
    }

    #[test]
    fn test_tensor_shape_checked() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            Tensor::new(vec![2, 3], vec![0.0; 5]),
            Err(InferenceError::Shape { len: 5, .. })
        ));
        let row = Tensor::row(vec![1.0, 2.0]);
        assert_eq!(row.shape(), &[1, 2]);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_load_all_models() {
        let loader = RecordingLoader {
            fail: None,
            seen: Mutex::new(Vec::new()),
        };
        let models = PolicyModels::load("/opt/policy", &loader).unwrap();
        let seen = loader.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                PathBuf::from("/opt/policy/encoder.pt"),
                PathBuf::from("/opt/policy/vq_layer.pt"),
                PathBuf::from("/opt/policy/actor.pt"),
            ]
        );
        let out = models.invoke(Model::Actor, &Tensor::row(vec![3.0])).unwrap();
        assert_eq!(out.data(), &[3.0]);
    }

    #[test]
    fn test_load_failure_names_model() {
        let loader = RecordingLoader {
            fail: Some(Model::Quantizer),
            seen: Mutex::new(Vec::new()),
        };
        let err = PolicyModels::load("m", &loader).unwrap_err();
        match err {
            InferenceError::Load { model, path, .. } => {
                assert_eq!(model, Model::Quantizer);
                assert_eq!(path, PathBuf::from("m/vq_layer.pt"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The actor is never attempted.
        assert_eq!(loader.seen.lock().unwrap().len(), 2);
    }
}
