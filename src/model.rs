//! Model loading: resolve the artifact, check the node contract, build an immutable plan.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use tract_onnx::prelude::*;

use crate::config::ModelConfig;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact not found at {0}")]
    NotFound(PathBuf),
    #[error("no serving tags given for artifact directory {0}")]
    NoTags(PathBuf),
    #[error("failed to load model from {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("input node '{0}' not found in graph")]
    MissingInput(String),
    #[error("output node '{0}' not found in graph")]
    MissingOutput(String),
    #[error("output node '{node}' has {outputs} output(s), slot {slot} requested")]
    MissingSlot {
        node: String,
        slot: usize,
        outputs: usize,
    },
    #[error("failed to prepare execution plan: {0}")]
    Plan(String),
}

/// Which graph nodes the predictor feeds and reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelContract {
    pub input_node: String,
    pub output_node: String,
    pub output_slot: usize,
}

impl ModelContract {
    /// Checks the contract against a graph and returns the input and output
    /// outlets to bind. `lookup` maps a node name to its id and output count.
    fn bind<F>(&self, lookup: F) -> Result<(OutletId, OutletId), ModelError>
    where
        F: Fn(&str) -> Option<(usize, usize)>,
    {
        let (input, _) = lookup(&self.input_node)
            .ok_or_else(|| ModelError::MissingInput(self.input_node.clone()))?;
        let (output, outputs) = lookup(&self.output_node)
            .ok_or_else(|| ModelError::MissingOutput(self.output_node.clone()))?;
        if self.output_slot >= outputs {
            return Err(ModelError::MissingSlot {
                node: self.output_node.clone(),
                slot: self.output_slot,
                outputs,
            });
        }
        Ok((OutletId::new(input, 0), OutletId::new(output, self.output_slot)))
    }
}

/// A graph ready to execute. Loaded once and shared read-only.
pub struct LoadedModel {
    pub(crate) plan: Arc<TypedRunnableModel<TypedModel>>,
    contract: ModelContract,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

impl LoadedModel {
    pub fn contract(&self) -> &ModelContract {
        &self.contract
    }

    /// Builds a plan from an already typed graph whose input node accepts `f64[1]`.
    #[cfg(test)]
    pub(crate) fn from_typed(mut model: TypedModel, contract: ModelContract) -> Result<Self, ModelError> {
        let (input, output) =
            contract.bind(|name| model.node_by_name(name).ok().map(|n| (n.id, n.outputs.len())))?;

        model
            .set_input_outlets(&[input])
            .and_then(|_| model.set_output_outlets(&[output]))
            .map_err(|e| ModelError::Plan(e.to_string()))?;

        let optimized = model
            .into_optimized()
            .map_err(|e| ModelError::Plan(e.to_string()))?;
        Self::from_optimized(optimized, contract)
    }

    fn from_optimized(model: TypedModel, contract: ModelContract) -> Result<Self, ModelError> {
        let plan = model
            .into_runnable()
            .map_err(|e| ModelError::Plan(e.to_string()))?
            .into();
        Ok(Self { plan, contract })
    }
}

/// Resolves the file to load: a direct `.onnx` path is used as-is, otherwise
/// the sorted tags joined with `-` name the variant inside the directory.
pub fn artifact_path(path: &Path, tags: &[String]) -> Result<PathBuf, ModelError> {
    if path.extension().is_some_and(|ext| ext == "onnx") {
        return Ok(path.to_path_buf());
    }
    if tags.is_empty() {
        return Err(ModelError::NoTags(path.to_path_buf()));
    }

    let mut tags: Vec<&str> = tags.iter().map(String::as_str).collect();
    tags.sort_unstable();
    tags.dedup();
    Ok(path.join(format!("{}.onnx", tags.join("-"))))
}

/// Loads the configured artifact and binds the contract nodes.
pub fn load(config: &ModelConfig) -> Result<LoadedModel, ModelError> {
    let path = artifact_path(Path::new(&config.path), &config.tags)?;
    if !path.is_file() {
        return Err(ModelError::NotFound(path));
    }

    info!(path = %path.display(), tags = ?config.tags, "Loading model");

    let load_err = |e: TractError| ModelError::Load {
        path: path.clone(),
        reason: e.to_string(),
    };

    let mut model = tract_onnx::onnx().model_for_path(&path).map_err(load_err)?;

    let contract = config.contract();
    let (input, output) =
        contract.bind(|name| model.node_by_name(name).ok().map(|n| (n.id, n.outputs.len())))?;

    model
        .set_input_outlets(&[input])
        .and_then(|_| model.set_output_outlets(&[output]))
        .and_then(|_| model.set_input_fact(0, f64::fact([1usize]).into()))
        .map_err(load_err)?;

    let optimized = model
        .into_optimized()
        .map_err(|e| ModelError::Plan(e.to_string()))?;
    LoadedModel::from_optimized(optimized, contract)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use prost::Message;
    use tract_onnx::pb::attribute_proto::AttributeType;
    use tract_onnx::pb::tensor_proto::DataType;
    use tract_onnx::pb::*;

    pub const INPUT: &str = "input_x";
    pub const OUTPUT: &str = "linear/linear_model/linear_model/linear_model/weighted_sum";

    pub fn contract() -> ModelContract {
        ModelContract {
            input_node: INPUT.to_string(),
            output_node: OUTPUT.to_string(),
            output_slot: 0,
        }
    }

    /// `f64[1] -> f32[1, 1]`, passing the value through.
    pub fn passthrough() -> TypedModel {
        let mut model = TypedModel::default();
        let x = model.add_source(INPUT, f64::fact([1usize])).unwrap();
        let cast = model
            .wire_node("cast", tract_onnx::tract_core::ops::cast::cast(f32::datum_type()), &[x])
            .unwrap();
        let out = model
            .wire_node(OUTPUT, tract_onnx::tract_core::ops::change_axes::AxisOp::Add(0), &cast)
            .unwrap();
        model.set_output_outlets(&out).unwrap();
        model
    }

    /// Output stays rank 1.
    pub fn rank_one() -> TypedModel {
        let mut model = TypedModel::default();
        let x = model.add_source(INPUT, f64::fact([1usize])).unwrap();
        let out = model
            .wire_node(OUTPUT, tract_onnx::tract_core::ops::cast::cast(f32::datum_type()), &[x])
            .unwrap();
        model.set_output_outlets(&out).unwrap();
        model
    }

    fn tensor_info(name: &str, elem_type: DataType, dims: &[i64]) -> ValueInfoProto {
        let dim = dims
            .iter()
            .map(|d| tensor_shape_proto::Dimension {
                value: Some(tensor_shape_proto::dimension::Value::DimValue(*d)),
                ..Default::default()
            })
            .collect();

        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: elem_type as i32,
                    shape: Some(TensorShapeProto { dim }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Serialized ONNX graph: `Cast(to=float)` then `Unsqueeze(axes=[0])`,
    /// the same passthrough as [`passthrough`].
    pub fn onnx_passthrough() -> Vec<u8> {
        let cast = NodeProto {
            name: "cast".to_string(),
            op_type: "Cast".to_string(),
            input: vec![INPUT.to_string()],
            output: vec!["as_float".to_string()],
            attribute: vec![AttributeProto {
                name: "to".to_string(),
                r#type: AttributeType::Int as i32,
                i: DataType::Float as i64,
                ..Default::default()
            }],
            ..Default::default()
        };
        let unsqueeze = NodeProto {
            name: OUTPUT.to_string(),
            op_type: "Unsqueeze".to_string(),
            input: vec!["as_float".to_string()],
            output: vec!["prediction".to_string()],
            attribute: vec![AttributeProto {
                name: "axes".to_string(),
                r#type: AttributeType::Ints as i32,
                ints: vec![0],
                ..Default::default()
            }],
            ..Default::default()
        };

        ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 11,
            }],
            graph: Some(GraphProto {
                name: "linear".to_string(),
                node: vec![cast, unsqueeze],
                input: vec![tensor_info(INPUT, DataType::Double, &[1])],
                output: vec![tensor_info("prediction", DataType::Float, &[1, 1])],
                ..Default::default()
            }),
            ..Default::default()
        }
        .encode_to_vec()
    }

    /// Output is rank 2 but still `f64`.
    pub fn wrong_type() -> TypedModel {
        let mut model = TypedModel::default();
        let x = model.add_source(INPUT, f64::fact([1usize])).unwrap();
        let out = model
            .wire_node(OUTPUT, tract_onnx::tract_core::ops::change_axes::AxisOp::Add(0), &[x])
            .unwrap();
        model.set_output_outlets(&out).unwrap();
        model
    }
}
