//! Scalar prediction on top of a loaded graph.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use tract_onnx::prelude::*;

use crate::model::LoadedModel;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("failed to build input tensor: {0}")]
    TensorConstruction(String),
    #[error("graph execution failed: {0}")]
    Execution(String),
    #[error("expected a non-empty rank 2 result, got shape {0:?}")]
    ShapeMismatch(Vec<usize>),
    #[error("expected f32 result, got {0}")]
    TypeMismatch(String),
    #[error("prediction unavailable: {0}")]
    Unavailable(String),
}

/// Anything that turns one input value into one prediction.
pub trait Predict: Send + Sync {
    fn predict(&self, x: f64) -> Result<f32, PredictError>;
}

/// What a single graph run produced, before it is trusted.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Success { shape: Vec<usize>, values: Vec<f32> },
    ShapeMismatch { shape: Vec<usize> },
    TypeMismatch { found: String },
    RuntimeFault(String),
}

impl Execution {
    fn inspect(outputs: TractResult<TVec<TValue>>) -> Self {
        let outputs = match outputs {
            Ok(outputs) => outputs,
            Err(e) => return Execution::RuntimeFault(e.to_string()),
        };
        let Some(result) = outputs.first() else {
            return Execution::RuntimeFault("graph produced no outputs".to_string());
        };

        let shape = result.shape().to_vec();
        if result.datum_type() != f32::datum_type() {
            return Execution::TypeMismatch {
                found: format!("{:?}", result.datum_type()),
            };
        }
        if shape.len() != 2 || shape.contains(&0) {
            return Execution::ShapeMismatch { shape };
        }

        match result.as_slice::<f32>() {
            Ok(values) => Execution::Success {
                shape,
                values: values.to_vec(),
            },
            Err(e) => Execution::RuntimeFault(e.to_string()),
        }
    }

    /// Element `[0][0]` of a successful run.
    pub fn into_scalar(self) -> Result<f32, PredictError> {
        match self {
            Execution::Success { shape, values } => values
                .first()
                .copied()
                .ok_or(PredictError::ShapeMismatch(shape)),
            Execution::ShapeMismatch { shape } => Err(PredictError::ShapeMismatch(shape)),
            Execution::TypeMismatch { found } => Err(PredictError::TypeMismatch(found)),
            Execution::RuntimeFault(reason) => Err(PredictError::Execution(reason)),
        }
    }
}

/// Predictor backed by a shared, immutable tract plan.
///
/// Each run gets its own execution state, so one plan serves concurrent
/// callers without locking.
#[derive(Debug, Clone)]
pub struct Predictor {
    model: Arc<LoadedModel>,
}

impl Predictor {
    pub fn new(model: Arc<LoadedModel>) -> Self {
        Self { model }
    }

    pub fn execute(&self, x: f64) -> Result<Execution, PredictError> {
        let input: TValue = Tensor::from_shape(&[1], &[x])
            .map_err(|e| PredictError::TensorConstruction(e.to_string()))?
            .into();

        Ok(Execution::inspect(self.model.plan.run(tvec!(input))))
    }
}

impl Predict for Predictor {
    fn predict(&self, x: f64) -> Result<f32, PredictError> {
        let execution = self.execute(x)?;
        debug!(input = x, result = ?execution, "Graph executed");
        execution.into_scalar()
    }
}
