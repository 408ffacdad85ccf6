use recast_convert::{PlaceholderBounds, TemplatePlaceholder};

fn default_rope() -> f32 {
    10000.0
}

/// Architecture hyperparameters for a Llama-family transformer, matching the
/// layout of a hub `config.json`. Only the fields that influence the
/// parameter layout matter for state conversion; the rest ride along so a
/// hub config deserializes cleanly.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TransformerConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope")]
    pub rope_theta: f32,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
    /// Per-head RMSNorm on queries and keys (OLMo2-style).
    #[serde(default)]
    pub use_qk_norm: bool,
    /// Number of MoE experts. `None` means a dense feed-forward.
    #[serde(default)]
    pub num_experts: Option<usize>,
}

impl TransformerConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// The placeholder bounds this model instance implies: the block count,
    /// and the expert count when the feed-forward is MoE.
    pub fn placeholder_bounds(&self) -> PlaceholderBounds {
        let mut bounds = PlaceholderBounds::new();
        bounds.insert(TemplatePlaceholder::Layer, self.num_hidden_layers);
        if let Some(num_experts) = self.num_experts {
            bounds.insert(TemplatePlaceholder::Expert, num_experts);
        }
        bounds
    }

    pub fn dummy() -> Self {
        Self {
            hidden_size: 8,
            intermediate_size: 16,
            vocab_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            num_key_value_heads: Some(1),
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_position_embeddings: 64,
            tie_word_embeddings: false,
            attention_bias: false,
            use_qk_norm: false,
            num_experts: None,
        }
    }

    pub fn dummy_moe(num_experts: usize) -> Self {
        Self {
            num_experts: Some(num_experts),
            ..Self::dummy()
        }
    }
}
