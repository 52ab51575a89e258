//! Optimizer configuration discovery.
//!
//! Looks for `.helm-optimizer.toml` in the project directory first, then in
//! the home directory, and falls back to defaults.

use crate::analyzer::helm_optimize::OptimizerConfig;
use crate::error::{OptimizerError, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = ".helm-optimizer.toml";

/// Get the global config file path (~/.helm-optimizer.toml)
pub fn global_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(CONFIG_FILE_NAME))
}

/// Get the local config file path (project/.helm-optimizer.toml)
pub fn local_config_path(project_path: &Path) -> PathBuf {
    project_path.join(CONFIG_FILE_NAME)
}

/// Load configuration from file or use defaults.
/// Checks local config first, then global config; unreadable files are skipped.
pub fn load_config(project_path: Option<&Path>) -> Result<OptimizerConfig> {
    let candidates = project_path
        .map(local_config_path)
        .into_iter()
        .chain(global_config_path());

    for path in candidates {
        if !path.exists() {
            continue;
        }
        match read_config_file(&path) {
            Ok(config) => {
                debug!("Loaded optimizer config from {}", path.display());
                return Ok(config);
            }
            Err(e) => warn!("Ignoring config {}: {}", path.display(), e),
        }
    }

    Ok(OptimizerConfig::default())
}

/// Parse one config file.
pub fn read_config_file(path: &Path) -> Result<OptimizerConfig> {
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| OptimizerError::Config(e.to_string()))
}

/// Save configuration to a project's local config file.
pub fn save_local_config(project_path: &Path, config: &OptimizerConfig) -> Result<()> {
    let content =
        toml::to_string_pretty(config).map_err(|e| OptimizerError::Config(e.to_string()))?;
    fs::write(local_config_path(project_path), content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::AnalysisMode;
    use tempfile::TempDir;

    #[test]
    fn test_local_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = OptimizerConfig::new()
            .with_mode(AnalysisMode::Values)
            .ignore_rule("AVL004");
        save_local_config(dir.path(), &config).unwrap();

        let loaded = load_config(Some(dir.path())).unwrap();
        assert_eq!(loaded.mode, AnalysisMode::Values);
        assert!(loaded.should_ignore_rule("AVL004"));
    }

    #[test]
    fn test_malformed_config_is_error() {
        let dir = TempDir::new().unwrap();
        let path = local_config_path(dir.path());
        fs::write(&path, "mode = [").unwrap();
        assert!(matches!(read_config_file(&path), Err(OptimizerError::Config(_))));
    }
}
