use recast_convert::StateDict;
use tch::{Device, Kind, Tensor};

use crate::TransformerConfig;

/// Builds a framework-native state dict with correctly shaped random
/// parameters for the given architecture. Used by tests and examples; real
/// state dicts come from a training checkpoint.
pub fn dummy_state_dict(config: &TransformerConfig) -> StateDict {
    let hidden = config.hidden_size as i64;
    let intermediate = config.intermediate_size as i64;
    let vocab = config.vocab_size as i64;
    let head_dim = config.head_dim() as i64;
    let kv_size = (config.num_key_value_heads() * config.head_dim()) as i64;

    let mut state_dict = StateDict::new();
    let mut param = |key: String, shape: &[i64]| {
        state_dict.insert(
            key,
            Tensor::randn(shape, (Kind::Float, Device::Cpu)).into(),
        );
    };

    param("embeddings.weight".to_string(), &[vocab, hidden]);

    for layer in 0..config.num_hidden_layers {
        let block = format!("blocks.{layer}");

        for (name, rows) in [
            ("w_q", hidden),
            ("w_k", kv_size),
            ("w_v", kv_size),
            ("w_out", hidden),
        ] {
            param(
                format!("{block}.attention.{name}.weight"),
                &[rows, hidden],
            );
            if config.attention_bias {
                param(format!("{block}.attention.{name}.bias"), &[rows]);
            }
        }
        if config.use_qk_norm {
            param(format!("{block}.attention.q_norm.weight"), &[head_dim]);
            param(format!("{block}.attention.k_norm.weight"), &[head_dim]);
        }

        param(format!("{block}.attention_norm.weight"), &[hidden]);
        param(format!("{block}.feed_forward_norm.weight"), &[hidden]);

        if let Some(num_experts) = config.num_experts {
            let num_experts = num_experts as i64;
            param(
                format!("{block}.feed_forward_moe.router.weight"),
                &[num_experts, hidden],
            );
            // All expert banks are fused along dim 0; w2 holds each expert's
            // (intermediate, hidden) slice, i.e. transposed relative to the
            // hub's per-expert down_proj.
            for name in ["w1", "w2", "w3"] {
                param(
                    format!("{block}.feed_forward_moe.experts.mlp.{name}"),
                    &[num_experts * intermediate, hidden],
                );
            }
        } else {
            param(
                format!("{block}.feed_forward.w1.weight"),
                &[intermediate, hidden],
            );
            param(
                format!("{block}.feed_forward.w2.weight"),
                &[hidden, intermediate],
            );
            param(
                format!("{block}.feed_forward.w3.weight"),
                &[intermediate, hidden],
            );
        }
    }

    param("lm_head.norm.weight".to_string(), &[hidden]);
    if !config.tie_word_embeddings {
        param("lm_head.w_out.weight".to_string(), &[vocab, hidden]);
    }

    state_dict
}
