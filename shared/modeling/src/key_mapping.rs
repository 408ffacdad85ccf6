use recast_convert::{StateMappingTemplate, TemplatePlaceholder};

use crate::TransformerConfig;

/// The mapping templates from the framework-native parameter layout to the
/// model-hub convention, for the architecture described by `config`.
///
/// Attention and norm weights map one-to-one per block. MoE expert banks are
/// stored fused (all experts stacked along dim 0) and fan out to one hub key
/// per expert; `w2` is additionally stored transposed per expert, so its
/// template runs the full unflatten/permute/flatten pipeline before chunking.
pub fn key_mapping_to_hub(config: &TransformerConfig) -> Vec<StateMappingTemplate> {
    let mut templates = vec![StateMappingTemplate::new(
        "embeddings.weight",
        "model.embed_tokens.weight",
    )];

    for (source, dest) in [
        ("w_q", "q_proj"),
        ("w_k", "k_proj"),
        ("w_v", "v_proj"),
        ("w_out", "o_proj"),
    ] {
        templates.push(StateMappingTemplate::new(
            format!("blocks.[layer].attention.{source}.weight"),
            format!("model.layers.[layer].self_attn.{dest}.weight"),
        ));
        if config.attention_bias {
            templates.push(StateMappingTemplate::new(
                format!("blocks.[layer].attention.{source}.bias"),
                format!("model.layers.[layer].self_attn.{dest}.bias"),
            ));
        }
    }

    if config.use_qk_norm {
        for norm in ["q_norm", "k_norm"] {
            templates.push(StateMappingTemplate::new(
                format!("blocks.[layer].attention.{norm}.weight"),
                format!("model.layers.[layer].self_attn.{norm}.weight"),
            ));
        }
    }

    templates.push(StateMappingTemplate::new(
        "blocks.[layer].attention_norm.weight",
        "model.layers.[layer].input_layernorm.weight",
    ));
    templates.push(StateMappingTemplate::new(
        "blocks.[layer].feed_forward_norm.weight",
        "model.layers.[layer].post_attention_layernorm.weight",
    ));

    if config.num_experts.is_some() {
        templates.push(StateMappingTemplate::new(
            "blocks.[layer].feed_forward_moe.router.weight",
            "model.layers.[layer].mlp.gate.weight",
        ));
        for (source, dest) in [("w1", "gate_proj"), ("w3", "up_proj")] {
            templates.push(
                StateMappingTemplate::new(
                    format!("blocks.[layer].feed_forward_moe.experts.mlp.{source}"),
                    format!("model.layers.[layer].mlp.experts.[expert].{dest}.weight"),
                )
                .dest_key_per_placeholder(TemplatePlaceholder::Expert)
                .dest_chunk_dim(0),
            );
        }
        // w2 is (num_experts * intermediate, hidden) fused; each hub
        // down_proj is (hidden, intermediate), so transpose per expert
        // before chunking.
        templates.push(
            StateMappingTemplate::new(
                "blocks.[layer].feed_forward_moe.experts.mlp.w2",
                "model.layers.[layer].mlp.experts.[expert].down_proj.weight",
            )
            .dest_key_per_placeholder(TemplatePlaceholder::Expert)
            .unflatten(0, vec![TemplatePlaceholder::Expert.into(), (-1).into()])
            .permute(vec![0, 2, 1])
            .flatten(0, 1)
            .dest_chunk_dim(0),
        );
    } else {
        for (source, dest) in [("w1", "gate_proj"), ("w2", "down_proj"), ("w3", "up_proj")] {
            templates.push(StateMappingTemplate::new(
                format!("blocks.[layer].feed_forward.{source}.weight"),
                format!("model.layers.[layer].mlp.{dest}.weight"),
            ));
        }
    }

    templates.push(StateMappingTemplate::new(
        "lm_head.norm.weight",
        "model.norm.weight",
    ));
    if !config.tie_word_embeddings {
        templates.push(StateMappingTemplate::new(
            "lm_head.w_out.weight",
            "lm_head.weight",
        ));
    }

    templates
}

/// The inverse template set: hub layout back to framework-native. Each MoE
/// pipeline is the exact mirror of its to-hub counterpart, run in reverse
/// order (concat, then unflatten/permute/flatten), so a to-hub/from-hub
/// round trip is bit-exact.
pub fn key_mapping_from_hub(config: &TransformerConfig) -> Vec<StateMappingTemplate> {
    let mut templates = vec![StateMappingTemplate::new(
        "model.embed_tokens.weight",
        "embeddings.weight",
    )];

    for (source, dest) in [
        ("q_proj", "w_q"),
        ("k_proj", "w_k"),
        ("v_proj", "w_v"),
        ("o_proj", "w_out"),
    ] {
        templates.push(StateMappingTemplate::new(
            format!("model.layers.[layer].self_attn.{source}.weight"),
            format!("blocks.[layer].attention.{dest}.weight"),
        ));
        if config.attention_bias {
            templates.push(StateMappingTemplate::new(
                format!("model.layers.[layer].self_attn.{source}.bias"),
                format!("blocks.[layer].attention.{dest}.bias"),
            ));
        }
    }

    if config.use_qk_norm {
        for norm in ["q_norm", "k_norm"] {
            templates.push(StateMappingTemplate::new(
                format!("model.layers.[layer].self_attn.{norm}.weight"),
                format!("blocks.[layer].attention.{norm}.weight"),
            ));
        }
    }

    templates.push(StateMappingTemplate::new(
        "model.layers.[layer].input_layernorm.weight",
        "blocks.[layer].attention_norm.weight",
    ));
    templates.push(StateMappingTemplate::new(
        "model.layers.[layer].post_attention_layernorm.weight",
        "blocks.[layer].feed_forward_norm.weight",
    ));

    if config.num_experts.is_some() {
        templates.push(StateMappingTemplate::new(
            "model.layers.[layer].mlp.gate.weight",
            "blocks.[layer].feed_forward_moe.router.weight",
        ));
        for (source, dest) in [("gate_proj", "w1"), ("up_proj", "w3")] {
            templates.push(
                StateMappingTemplate::new(
                    format!("model.layers.[layer].mlp.experts.[expert].{source}.weight"),
                    format!("blocks.[layer].feed_forward_moe.experts.mlp.{dest}"),
                )
                .source_key_per_placeholder(TemplatePlaceholder::Expert)
                .source_concat_dim(0),
            );
        }
        templates.push(
            StateMappingTemplate::new(
                "model.layers.[layer].mlp.experts.[expert].down_proj.weight",
                "blocks.[layer].feed_forward_moe.experts.mlp.w2",
            )
            .source_key_per_placeholder(TemplatePlaceholder::Expert)
            .source_concat_dim(0)
            .unflatten(0, vec![TemplatePlaceholder::Expert.into(), (-1).into()])
            .permute(vec![0, 2, 1])
            .flatten(0, 1),
        );
    } else {
        for (source, dest) in [("gate_proj", "w1"), ("down_proj", "w2"), ("up_proj", "w3")] {
            templates.push(StateMappingTemplate::new(
                format!("model.layers.[layer].mlp.{source}.weight"),
                format!("blocks.[layer].feed_forward.{dest}.weight"),
            ));
        }
    }

    templates.push(StateMappingTemplate::new(
        "model.norm.weight",
        "lm_head.norm.weight",
    ));
    if !config.tie_word_embeddings {
        templates.push(StateMappingTemplate::new(
            "lm_head.weight",
            "lm_head.w_out.weight",
        ));
    }

    templates
}
