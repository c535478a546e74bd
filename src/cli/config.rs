use crate::config::default_user_config_path;
use crate::config::generate::generate_starter_config;
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Prefer ~/.config/batchup/config.yml, fall back to /etc/batchup/config.yml
    let config_path = match default_user_config_path() {
        Some(user_config) => match user_config.parent().map(fs::create_dir_all) {
            Some(Err(_)) => {
                eprintln!("Warning: Could not create directory for {}", user_config.display());
                eprintln!("Falling back to /etc/batchup/config.yml");
                PathBuf::from("/etc/batchup/config.yml")
            }
            _ => user_config,
        },
        None => PathBuf::from("/etc/batchup/config.yml"),
    };

    if config_path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}
