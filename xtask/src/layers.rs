//! xtask layers: print the derived layer table for a pyramid configuration.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tilewave::{LayerTable, PyramidConfig};

/// Entry point called from main.rs
pub fn run(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let table = LayerTable::new(&config).map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;

    println!();
    println!("{}", "📐 Layer table".cyan().bold());
    println!();
    println!("{table}");
    println!();
    if !config.write_enabled {
        println!("{}", "  writes disabled (dry run)".yellow());
        println!();
    }
    Ok(())
}

/// Read a JSON config, or the default one when no path is given.
pub(crate) fn load_config(path: Option<&Path>) -> Result<PyramidConfig> {
    let Some(path) = path else {
        return Ok(PyramidConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: PyramidConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::load_config;
    use tempfile::TempDir;

    #[test]
    fn missing_fields_take_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pyramid.json");
        std::fs::write(&path, r#"{ "unit_size": 64, "layer_count": 6, "tiles_per_layer": 256 }"#)
            .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.unit_size, 64);
        assert_eq!(config.event_queue_depth, 8);
        assert!(config.write_enabled);
    }

    #[test]
    fn invalid_geometry_is_rejected_with_the_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, r#"{ "unit_size": 100 }"#).unwrap();
        let err = load_config(Some(&path)).unwrap_err().to_string();
        assert!(err.contains("bad.json"), "{err}");
    }
}
