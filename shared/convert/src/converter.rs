use std::collections::{HashMap, HashSet};

use tch::Tensor;
use thiserror::Error;
use tracing::{debug, trace};

use crate::mapping::{StateMapping, StateMappingTemplate};
use crate::placeholder::{PlaceholderAssignments, PlaceholderBounds};

/// One entry in a state dict. Model parameters are tensors; optimizer and
/// trainer state may carry plain values (step counters and the like), which
/// the converter refuses to map.
#[derive(Debug)]
pub enum StateValue {
    Tensor(Tensor),
    Value(serde_json::Value),
}

impl StateValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            StateValue::Tensor(tensor) => Some(tensor),
            StateValue::Value(_) => None,
        }
    }
}

impl From<Tensor> for StateValue {
    fn from(tensor: Tensor) -> Self {
        StateValue::Tensor(tensor)
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        StateValue::Value(value)
    }
}

/// A flat mapping from parameter names to values, as persisted in a
/// checkpoint.
pub type StateDict = HashMap<String, StateValue>;

#[derive(Debug, Error)]
pub enum StateConversionError {
    #[error("having a key per {placeholder} is not supported with multiple template keys")]
    PerPlaceholderWithMultipleKeys { placeholder: crate::TemplatePlaceholder },

    #[error("per-key placeholder {placeholder} does not occur in its template")]
    PerPlaceholderMissingFromTemplate { placeholder: crate::TemplatePlaceholder },

    #[error("a mapping template has an empty key tuple")]
    EmptyKeyTemplates,

    #[error("attempting to map {num_source} non-tensor states to {num_dest} keys")]
    NonTensorState { num_source: usize, num_dest: usize },

    #[error("cannot evenly chunk dim {dim} of size {size} into {chunks} chunks")]
    UnevenChunk { dim: i64, size: i64, chunks: usize },

    #[error("state key {0} was claimed by more than one mapping")]
    DoubleClaimedKey(String),

    #[error("source key {0} vanished from the state dict during conversion")]
    MissingSourceKey(String),

    #[error("some state keys were not converted: {0:?}")]
    UnconvertedKeys(Vec<String>),

    #[error(transparent)]
    Tensor(#[from] tch::TchError),
}

/// Converts state dicts from one checkpoint layout to another (e.g.
/// framework-native to model-hub format), driven by a set of
/// [`StateMappingTemplate`]s.
///
/// The template list is the only state; every conversion call is a pure
/// function of the supplied state dict and placeholder bounds.
#[derive(Debug)]
pub struct StateConverter {
    mapping_templates: Vec<StateMappingTemplate>,
}

impl StateConverter {
    /// Builds a converter, checking every template's construction invariants
    /// up front so authoring mistakes surface before any conversion runs.
    pub fn new(
        mapping_templates: Vec<StateMappingTemplate>,
    ) -> Result<Self, StateConversionError> {
        for template in &mapping_templates {
            template.validate()?;
        }
        Ok(Self { mapping_templates })
    }

    /// Resolves the template set against the given state dict and bounds,
    /// without converting anything.
    ///
    /// Every combination of placeholder assignments is considered, including
    /// leaving each placeholder unset; a template only resolves under the
    /// assignments that exactly match the placeholders it mentions, and
    /// mappings whose source keys are not all present in the state dict are
    /// dropped. Result order is template declaration order, then assignment
    /// enumeration order.
    pub fn get_mappings(
        &self,
        state_dict: &StateDict,
        placeholder_bounds: &PlaceholderBounds,
    ) -> Vec<StateMapping> {
        let assignments: Vec<_> = PlaceholderAssignments::new(placeholder_bounds).collect();

        let mut mappings = Vec::new();
        for template in &self.mapping_templates {
            for assignment in &assignments {
                let Some(mapping) = template.to_mapping(assignment, placeholder_bounds) else {
                    continue;
                };
                if mapping
                    .source_keys
                    .iter()
                    .all(|key| state_dict.contains_key(key))
                {
                    trace!(
                        source_keys = ?mapping.source_keys,
                        dest_keys = ?mapping.dest_keys,
                        "resolved mapping"
                    );
                    mappings.push(mapping);
                }
            }
        }

        debug!(
            num_templates = self.mapping_templates.len(),
            num_mappings = mappings.len(),
            "resolved mapping templates"
        );
        mappings
    }

    /// Converts a state dict to the destination layout.
    ///
    /// Every source entry must be claimed by exactly one mapping; unclaimed
    /// keys, keys claimed twice, and non-tensor entries matched by a mapping
    /// all fail the conversion. No partially converted dict is ever returned.
    pub fn convert(
        &self,
        state_dict: &StateDict,
        placeholder_bounds: &PlaceholderBounds,
    ) -> Result<StateDict, StateConversionError> {
        let mappings = self.get_mappings(state_dict, placeholder_bounds);

        let mut unused_keys: HashSet<&str> =
            state_dict.keys().map(String::as_str).collect();
        let mut converted = StateDict::with_capacity(state_dict.len());

        for mapping in &mappings {
            let mut tensors = Vec::with_capacity(mapping.source_keys.len());
            for key in &mapping.source_keys {
                let value = state_dict
                    .get(key)
                    .ok_or_else(|| StateConversionError::MissingSourceKey(key.clone()))?;
                match value.as_tensor() {
                    Some(tensor) => tensors.push(tensor),
                    None => {
                        return Err(StateConversionError::NonTensorState {
                            num_source: mapping.source_keys.len(),
                            num_dest: mapping.dest_keys.len(),
                        })
                    }
                }
            }

            let mut state = Tensor::f_cat(&tensors, mapping.source_concat_dim)?;
            if let Some((dim, shape)) = &mapping.unflatten_dim {
                state = state.f_unflatten(*dim, shape.as_slice())?;
            }
            if let Some(permutation) = &mapping.dims_permutation {
                state = state.f_permute(permutation.as_slice())?;
            }
            if let Some((start_dim, end_dim)) = mapping.flatten_dims {
                state = state.f_flatten(start_dim, end_dim)?;
            }

            // A per-placeholder expansion with a bound of zero produces no
            // destination keys even for a validated template.
            let num_chunks = mapping.dest_keys.len();
            let chunk_size = dim_size(&state, mapping.dest_chunk_dim);
            if num_chunks == 0 || chunk_size % num_chunks as i64 != 0 {
                return Err(StateConversionError::UnevenChunk {
                    dim: mapping.dest_chunk_dim,
                    size: chunk_size,
                    chunks: num_chunks,
                });
            }
            let chunks = state.f_chunk(num_chunks as i64, mapping.dest_chunk_dim)?;
            for (dest_key, chunk) in mapping.dest_keys.iter().zip(chunks) {
                converted.insert(dest_key.clone(), StateValue::Tensor(chunk.contiguous()));
            }

            for key in &mapping.source_keys {
                if !unused_keys.remove(key.as_str()) {
                    return Err(StateConversionError::DoubleClaimedKey(key.clone()));
                }
            }
        }

        if !unused_keys.is_empty() {
            let mut unconverted: Vec<String> =
                unused_keys.into_iter().map(str::to_string).collect();
            unconverted.sort();
            return Err(StateConversionError::UnconvertedKeys(unconverted));
        }

        Ok(converted)
    }
}

fn dim_size(tensor: &Tensor, dim: i64) -> i64 {
    let size = tensor.size();
    let index = if dim < 0 { dim + size.len() as i64 } else { dim };
    size[index as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TemplatePlaceholder;
    use tch::{Device, Kind};

    fn bounds(entries: &[(TemplatePlaceholder, usize)]) -> PlaceholderBounds {
        entries.iter().copied().collect()
    }

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::from_slice(values)
    }

    #[test]
    fn test_per_layer_rename_copies_every_tensor() {
        let converter = StateConverter::new(vec![StateMappingTemplate::new(
            "blocks.[layer].attn.w_q",
            "model.layers.[layer].self_attn.q_proj.weight",
        )
        .source_key_per_placeholder(TemplatePlaceholder::Layer)
        .dest_key_per_placeholder(TemplatePlaceholder::Layer)])
        .unwrap();

        let state_dict: StateDict = [
            ("blocks.0.attn.w_q".to_string(), tensor(&[1.0, 2.0]).into()),
            ("blocks.1.attn.w_q".to_string(), tensor(&[3.0, 4.0]).into()),
        ]
        .into_iter()
        .collect();

        let converted = converter
            .convert(&state_dict, &bounds(&[(TemplatePlaceholder::Layer, 2)]))
            .unwrap();

        assert_eq!(converted.len(), 2);
        let q0 = converted["model.layers.0.self_attn.q_proj.weight"]
            .as_tensor()
            .unwrap();
        let q1 = converted["model.layers.1.self_attn.q_proj.weight"]
            .as_tensor()
            .unwrap();
        assert_eq!(Vec::<f32>::try_from(q0).unwrap(), vec![1.0, 2.0]);
        assert_eq!(Vec::<f32>::try_from(q1).unwrap(), vec![3.0, 4.0]);

        // The output must not alias the caller's tensors.
        let _ = state_dict["blocks.0.attn.w_q"]
            .as_tensor()
            .unwrap()
            .shallow_clone()
            .fill_(0.0);
        assert_eq!(Vec::<f32>::try_from(q0).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_fused_split_pipeline() {
        // A fused (expert * inter, hidden) bank split into per-expert
        // (hidden, inter) weights: unflatten, transpose per expert, flatten,
        // chunk.
        let converter = StateConverter::new(vec![StateMappingTemplate::new(
            "experts.w2",
            "experts.[expert].down_proj.weight",
        )
        .dest_key_per_placeholder(TemplatePlaceholder::Expert)
        .unflatten(0, vec![TemplatePlaceholder::Expert.into(), (-1).into()])
        .permute(vec![0, 2, 1])
        .flatten(0, 1)])
        .unwrap();

        // 2 experts, inter = 2, hidden = 3.
        let fused = Tensor::arange(12, (Kind::Float, Device::Cpu)).reshape([4, 3]);
        let state_dict: StateDict = [("experts.w2".to_string(), fused.into())]
            .into_iter()
            .collect();

        let converted = converter
            .convert(&state_dict, &bounds(&[(TemplatePlaceholder::Expert, 2)]))
            .unwrap();

        let expert0 = converted["experts.0.down_proj.weight"].as_tensor().unwrap();
        let expert1 = converted["experts.1.down_proj.weight"].as_tensor().unwrap();
        assert_eq!(expert0.size(), vec![3, 2]);
        // Expert 0's rows 0..2 of the fused bank, transposed.
        let expert0_flat = expert0.flatten(0, -1);
        let expert1_flat = expert1.flatten(0, -1);
        assert_eq!(
            Vec::<f32>::try_from(&expert0_flat).unwrap(),
            vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]
        );
        assert_eq!(
            Vec::<f32>::try_from(&expert1_flat).unwrap(),
            vec![6.0, 9.0, 7.0, 10.0, 8.0, 11.0]
        );
    }

    #[test]
    fn test_uneven_chunk_is_an_error() {
        let converter = StateConverter::new(vec![StateMappingTemplate::new(
            "fused",
            ["a", "b", "c"],
        )])
        .unwrap();

        let state_dict: StateDict = [(
            "fused".to_string(),
            Tensor::arange(10, (Kind::Float, Device::Cpu)).into(),
        )]
        .into_iter()
        .collect();

        let result = converter.convert(&state_dict, &PlaceholderBounds::new());
        assert!(matches!(
            result,
            Err(StateConversionError::UnevenChunk {
                size: 10,
                chunks: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_zero_bound_expansion_has_no_chunks_to_fill() {
        let converter = StateConverter::new(vec![StateMappingTemplate::new(
            "fused",
            "experts.[expert].weight",
        )
        .dest_key_per_placeholder(TemplatePlaceholder::Expert)])
        .unwrap();

        let state_dict: StateDict = [("fused".to_string(), tensor(&[1.0, 2.0]).into())]
            .into_iter()
            .collect();

        let result = converter.convert(&state_dict, &bounds(&[(TemplatePlaceholder::Expert, 0)]));
        assert!(matches!(
            result,
            Err(StateConversionError::UnevenChunk { chunks: 0, .. })
        ));
    }

    #[test]
    fn test_non_tensor_state_is_rejected() {
        let converter =
            StateConverter::new(vec![StateMappingTemplate::new("step", "global_step")]).unwrap();

        let state_dict: StateDict = [("step".to_string(), serde_json::json!(12).into())]
            .into_iter()
            .collect();

        let result = converter.convert(&state_dict, &PlaceholderBounds::new());
        assert!(matches!(
            result,
            Err(StateConversionError::NonTensorState {
                num_source: 1,
                num_dest: 1,
            })
        ));
    }

    #[test]
    fn test_unclaimed_keys_fail_coverage_sorted() {
        let converter =
            StateConverter::new(vec![StateMappingTemplate::new("known", "renamed")]).unwrap();

        let state_dict: StateDict = [
            ("known".to_string(), tensor(&[1.0]).into()),
            ("zz.orphan".to_string(), tensor(&[1.0]).into()),
            ("aa.orphan".to_string(), tensor(&[1.0]).into()),
        ]
        .into_iter()
        .collect();

        let result = converter.convert(&state_dict, &PlaceholderBounds::new());
        match result {
            Err(StateConversionError::UnconvertedKeys(keys)) => {
                assert_eq!(keys, vec!["aa.orphan".to_string(), "zz.orphan".to_string()]);
            }
            other => panic!("expected UnconvertedKeys, got {other:?}"),
        }
    }

    #[test]
    fn test_double_claimed_key_is_an_error() {
        let converter = StateConverter::new(vec![
            StateMappingTemplate::new("w", "first"),
            StateMappingTemplate::new("w", "second"),
        ])
        .unwrap();

        let state_dict: StateDict = [("w".to_string(), tensor(&[1.0]).into())]
            .into_iter()
            .collect();

        let result = converter.convert(&state_dict, &PlaceholderBounds::new());
        assert!(matches!(
            result,
            Err(StateConversionError::DoubleClaimedKey(key)) if key == "w"
        ));
    }

    #[test]
    fn test_many_to_one_concat_order_follows_expansion_order() {
        let converter = StateConverter::new(vec![StateMappingTemplate::new(
            "experts.[expert].w1",
            "fused.w1",
        )
        .source_key_per_placeholder(TemplatePlaceholder::Expert)
        .source_concat_dim(0)])
        .unwrap();

        let state_dict: StateDict = [
            ("experts.0.w1".to_string(), tensor(&[1.0, 2.0]).into()),
            ("experts.1.w1".to_string(), tensor(&[3.0, 4.0]).into()),
            ("experts.2.w1".to_string(), tensor(&[5.0, 6.0]).into()),
        ]
        .into_iter()
        .collect();

        let converted = converter
            .convert(&state_dict, &bounds(&[(TemplatePlaceholder::Expert, 3)]))
            .unwrap();
        let fused = converted["fused.w1"].as_tensor().unwrap();
        assert_eq!(
            Vec::<f32>::try_from(fused).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn test_mappings_filtered_by_state_dict_membership() {
        // Both a dense and an MoE template are registered; only the dense
        // keys exist, so only the dense mapping survives.
        let converter = StateConverter::new(vec![
            StateMappingTemplate::new(
                "blocks.[layer].feed_forward.w1.weight",
                "model.layers.[layer].mlp.gate_proj.weight",
            ),
            StateMappingTemplate::new(
                "blocks.[layer].feed_forward_moe.router.weight",
                "model.layers.[layer].mlp.gate.weight",
            ),
        ])
        .unwrap();

        let state_dict: StateDict = [(
            "blocks.0.feed_forward.w1.weight".to_string(),
            tensor(&[1.0]).into(),
        )]
        .into_iter()
        .collect();

        let mappings =
            converter.get_mappings(&state_dict, &bounds(&[(TemplatePlaceholder::Layer, 1)]));
        assert_eq!(mappings.len(), 1);
        assert_eq!(
            mappings[0].dest_keys,
            vec!["model.layers.0.mlp.gate_proj.weight"]
        );
    }
}
