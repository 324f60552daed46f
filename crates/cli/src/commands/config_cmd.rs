//! `tokenfold config` — Configuration management commands.

use std::path::Path;
use tokenfold_config::AppConfig;

pub async fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match super::load_config(path) {
        Ok(config) => {
            println!("   ✅ Config parsed and validated");

            let mut warnings = Vec::new();
            if config.reduction.reduction_loc.is_empty() {
                warnings.push("No reduction locations; every stage keeps all tokens");
            }
            if config.model.weights.is_none() {
                warnings.push("No weights configured; passes use random initialization");
            }
            if config.cache.enabled && config.cache.recovery_layers.is_none() {
                warnings.push("Cache recovery layers derived from the reduction locations");
            }

            if !warnings.is_empty() {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            let vit = config.vit_config()?;
            println!();
            println!("   Preset:     {}", config.model.preset);
            println!("   Tokens:     {} ({} prefix)", vit.initial_len(), vit.num_prefix_tokens());
            println!("   Reduce at:  {:?}", config.reduction.reduction_loc);
            println!("   Keep rate:  {:?}", config.reduction.keep_rate);
            println!("   Cache:      {}", if config.cache.enabled { "on" } else { "off" });
            println!("   Precision:  {}", config.runtime.dtype);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e);
        }
    }

    Ok(())
}

pub async fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => AppConfig::config_dir().join("config.toml"),
    };
    println!("{}", config_path.display());
    Ok(())
}
