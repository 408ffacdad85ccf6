mod checkpoint;
mod config;
mod dummy;
mod key_mapping;

pub use checkpoint::{
    convert_state_from_hub, convert_state_to_hub, update_model_state, HubCheckpointError,
};
pub use config::TransformerConfig;
pub use dummy::dummy_state_dict;
pub use key_mapping::{key_mapping_from_hub, key_mapping_to_hub};
