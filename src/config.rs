//! Configuration loading and schema definitions for testlauncher.
//!
//! This module provides types and functions for loading the runner
//! configuration from TOML files or strings: the platform registry, the
//! applications whose targets are added to a platform's, and runner-wide
//! settings.
//!
//! The file format is described in the README.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads testlauncher configuration from a TOML file.
///
/// Relative paths inside the file are resolved against its parent directory.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema, including
///   malformed filter entries
///
/// # Example
///
/// ```no_run
/// use testlauncher::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testlauncher.toml"))?;
/// println!("Platforms: {:?}", config.platforms.keys().collect::<Vec<_>>());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config.base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    Ok(config)
}

/// Loads testlauncher configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testlauncher::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [platforms.linux-x64x11]
///     ipv6 = true
///     test_targets = ["nplb", "base_unittests"]
/// "#)?;
///
/// assert_eq!(config.platforms["linux-x64x11"].test_targets.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_sets_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testlauncher.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[platforms.linux]\ntest_targets = [\"nplb\"]").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.base_dir, dir.path());
        assert_eq!(config.platforms["linux"].test_targets, vec!["nplb"]);
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let err = load_config_str(
            r#"
            [[platforms.linux.filters]]
            sentinel = "SOMETIMES"
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/testlauncher.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
