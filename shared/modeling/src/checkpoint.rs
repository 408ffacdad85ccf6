use recast_convert::{StateConversionError, StateConverter, StateDict};
use thiserror::Error;
use tracing::info;

use crate::{key_mapping_from_hub, key_mapping_to_hub, TransformerConfig};

#[derive(Debug, Error)]
pub enum HubCheckpointError {
    #[error("state conversion failed: {0}")]
    Conversion(#[from] StateConversionError),

    #[error("converted key {0} does not exist in the model state")]
    UnknownModelKey(String),

    #[error("some model state keys were not set when loading the hub checkpoint: {0:?}")]
    UnsetModelKeys(Vec<String>),
}

/// Converts a framework-native model state dict into the hub layout.
pub fn convert_state_to_hub(
    config: &TransformerConfig,
    state_dict: &StateDict,
) -> Result<StateDict, HubCheckpointError> {
    let converter = StateConverter::new(key_mapping_to_hub(config))?;
    let converted = converter.convert(state_dict, &config.placeholder_bounds())?;
    info!(
        num_source = state_dict.len(),
        num_dest = converted.len(),
        "converted state dict to hub layout"
    );
    Ok(converted)
}

/// Converts a hub-layout state dict into the framework-native layout.
pub fn convert_state_from_hub(
    config: &TransformerConfig,
    hub_state_dict: &StateDict,
) -> Result<StateDict, HubCheckpointError> {
    let converter = StateConverter::new(key_mapping_from_hub(config))?;
    let converted = converter.convert(hub_state_dict, &config.placeholder_bounds())?;
    info!(
        num_source = hub_state_dict.len(),
        num_dest = converted.len(),
        "converted hub state dict to native layout"
    );
    Ok(converted)
}

/// Assigns converted entries into an existing model state dict.
///
/// Every converted key must name an existing model parameter and every model
/// parameter must receive a value; both checks guard against loading a
/// checkpoint from a different model variant. On error the model state is
/// left untouched.
pub fn update_model_state(
    model_state: &mut StateDict,
    converted: StateDict,
) -> Result<(), HubCheckpointError> {
    if let Some(key) = converted.keys().find(|key| !model_state.contains_key(*key)) {
        return Err(HubCheckpointError::UnknownModelKey(key.clone()));
    }

    let mut unset_keys: Vec<String> = model_state
        .keys()
        .filter(|key| !converted.contains_key(*key))
        .cloned()
        .collect();
    if !unset_keys.is_empty() {
        unset_keys.sort();
        return Err(HubCheckpointError::UnsetModelKeys(unset_keys));
    }

    for (key, value) in converted {
        model_state.insert(key, value);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy_state_dict;
    use recast_convert::StateValue;
    use tch::Tensor;

    #[test]
    fn test_update_model_state_replaces_every_entry() {
        let config = TransformerConfig::dummy();
        let mut model_state = dummy_state_dict(&config);
        let incoming = dummy_state_dict(&config);
        let expected: Vec<(String, Tensor)> = incoming
            .iter()
            .map(|(k, v)| (k.clone(), v.as_tensor().unwrap().shallow_clone()))
            .collect();

        update_model_state(&mut model_state, incoming).unwrap();
        for (key, tensor) in expected {
            assert!(
                model_state[&key].as_tensor().unwrap().equal(&tensor),
                "{key} was not replaced"
            );
        }
    }

    #[test]
    fn test_update_model_state_rejects_unknown_keys() {
        let config = TransformerConfig::dummy();
        let mut model_state = dummy_state_dict(&config);

        let mut incoming = dummy_state_dict(&config);
        incoming.insert(
            "blocks.9.attention.w_q.weight".to_string(),
            StateValue::Tensor(Tensor::from_slice(&[1.0f32])),
        );

        assert!(matches!(
            update_model_state(&mut model_state, incoming),
            Err(HubCheckpointError::UnknownModelKey(key)) if key == "blocks.9.attention.w_q.weight"
        ));
    }

    #[test]
    fn test_update_model_state_leaves_model_untouched_on_error() {
        let config = TransformerConfig::dummy();
        let mut model_state = dummy_state_dict(&config);
        let before: Vec<(String, Tensor)> = model_state
            .iter()
            .map(|(k, v)| (k.clone(), v.as_tensor().unwrap().copy()))
            .collect();

        let mut incoming = dummy_state_dict(&config);
        incoming.insert(
            "blocks.9.attention.w_q.weight".to_string(),
            StateValue::Tensor(Tensor::from_slice(&[1.0f32])),
        );
        update_model_state(&mut model_state, incoming).unwrap_err();

        let mut partial = dummy_state_dict(&config);
        partial.remove("lm_head.norm.weight");
        update_model_state(&mut model_state, partial).unwrap_err();

        for (key, tensor) in before {
            assert!(
                model_state[&key].as_tensor().unwrap().equal(&tensor),
                "{key} was modified by a failed update"
            );
        }
    }

    #[test]
    fn test_update_model_state_reports_unset_keys_sorted() {
        let config = TransformerConfig::dummy();
        let mut model_state = dummy_state_dict(&config);

        let mut incoming = dummy_state_dict(&config);
        incoming.remove("embeddings.weight");
        incoming.remove("blocks.0.attention.w_q.weight");

        match update_model_state(&mut model_state, incoming) {
            Err(HubCheckpointError::UnsetModelKeys(keys)) => {
                assert_eq!(
                    keys,
                    vec![
                        "blocks.0.attention.w_q.weight".to_string(),
                        "embeddings.weight".to_string(),
                    ]
                );
            }
            other => panic!("expected UnsetModelKeys, got {other:?}"),
        }
    }
}
