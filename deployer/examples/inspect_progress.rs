//! Example: Inspect deployment progress
//!
//! Prints where each layer of a stage stands and what its metadata records,
//! without touching the network.
//!
//! ```text
//! cargo run --example inspect_progress -- staging
//! ```

use dex_deployer::{DeployConfig, Layer, Stage, SettingsStore, SystemMetadataStore};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("dex_deployer=info")
        .init();

    let stage: Stage = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "test".to_string())
        .parse()?;
    let config = match std::env::args().nth(2) {
        Some(path) => DeployConfig::from_file(path)?,
        None => DeployConfig::default(),
    };

    println!("=== {} ===\n", stage);

    let settings = SettingsStore::load(stage, &config.settings_dir)?;
    let metadata = SystemMetadataStore::load(&config.metadata_dir, &settings)?;

    for layer in Layer::ALL {
        let Ok(layer_settings) = settings.layer(layer) else {
            println!("{}: not configured\n", layer);
            continue;
        };
        let progress = settings.progress(layer)?;

        println!("{} ({}, chain {})", layer, layer_settings.network, layer_settings.chain_id);
        if progress.is_start() {
            println!("  - Next batch: {} (fresh)", progress.batch);
        } else if progress.task == 0 {
            println!("  - Next batch: {}", progress.batch);
        } else {
            println!(
                "  - Batch {} interrupted after {} task(s)",
                progress.batch, progress.task
            );
        }

        if let Ok(recorded) = metadata.layer(layer) {
            if let Some(governance) = &recorded.admin_transferred_to {
                println!("  - Upgrade admin: {}", governance);
            }
            for (alias, contract) in &recorded.contracts {
                println!("  - {} ({}): {}", alias, contract.name, contract.address);
            }
        }
        println!();
    }

    Ok(())
}
