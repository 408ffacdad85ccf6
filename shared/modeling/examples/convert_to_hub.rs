use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use recast_modeling::{convert_state_to_hub, dummy_state_dict, TransformerConfig};

#[derive(Parser, Debug)]
struct Args {
    /// Path to a config.json describing the architecture. When omitted, a
    /// small dummy architecture is used.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    layers: usize,

    /// Number of MoE experts; omit for a dense feed-forward.
    #[arg(long)]
    experts: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => {
            let mut config = match args.experts {
                Some(experts) => TransformerConfig::dummy_moe(experts),
                None => TransformerConfig::dummy(),
            };
            config.num_hidden_layers = args.layers;
            config
        }
    };

    let state_dict = dummy_state_dict(&config);
    let hub = convert_state_to_hub(&config, &state_dict)?;

    let mut keys: Vec<_> = hub.keys().collect();
    keys.sort();
    for key in keys {
        println!("{key}: {:?}", hub[key].as_tensor().unwrap().size());
    }
    Ok(())
}
