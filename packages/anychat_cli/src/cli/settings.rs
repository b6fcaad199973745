use anyhow::{Context, Result};

use crate::config::{self, AppDirs, FileConfig};

/// `anychat config show`: the merged result of defaults, config.toml and
/// `ANYCHAT_*` env vars.
pub fn show_command(dirs: &AppDirs, config: &FileConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    eprintln!("# {}", dirs.config_toml_path().display());
    print!("{rendered}");
    Ok(())
}

/// `anychat config set <section.field> <value>`
pub fn set_command(dirs: &AppDirs, key: &str, value: &str) -> Result<()> {
    let path = dirs.config_toml_path();
    config::set_config_value(&path, key, value)?;
    eprintln!("Set {key} = {value} in {}", path.display());
    Ok(())
}
