//! `tokenfold onboard` — First-time setup.

use tokenfold_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("TokenFold — First-Time Setup");
    println!("============================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("  Config file exists: {}", config_path.display());
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("✅ Created default config: {}", config_path.display());
    }

    println!();
    println!("Next steps:");
    println!("  tokenfold models          # pick a preset");
    println!("  tokenfold plan            # see what the schedule does");
    println!("  tokenfold run --trace     # run one pass");
    Ok(())
}
