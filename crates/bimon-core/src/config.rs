//! Project configuration, usually read from `bimon.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bisect::{AutomationPolicy, EngineOptions, RunnerOptions};
use crate::domain::{BimonError, Result};
use crate::precompile::PrecompileOptions;
use crate::store::StoreOptions;

/// Default file name looked up in the working directory.
pub const CONFIG_FILE: &str = "bimon.toml";

/// Overrides `store_dir` when set.
pub const STORE_DIR_ENV: &str = "BIMON_STORE_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BimonConfig {
    /// Cache root: raw artifacts, bundles, lists and the session file.
    pub store_dir: PathBuf,
    /// Source checkout the build command runs in.
    pub workspace_path: PathBuf,
    pub bundle_size: usize,
    pub prefetch_width: usize,
    pub prefetch_depth: usize,
    pub lru_keep: usize,
    pub compile_error_threshold: usize,
    pub move_on_store: bool,
    pub retry_compress: bool,
    pub compression_level: u32,
    /// Program and arguments, run in `workspace_path` after the commit is
    /// checked out.
    pub build_command: Vec<String>,
    /// Build outputs to cache, relative to `workspace_path`.
    pub artifact_paths: Vec<PathBuf>,
    /// Program to test, relative to the artifact directory.
    pub executable_path: Option<PathBuf>,
    pub execution_args: Vec<String>,
    pub automation: AutomationPolicy,
}

impl Default for BimonConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".bimon"),
            workspace_path: PathBuf::from("."),
            bundle_size: 20,
            prefetch_width: 2,
            prefetch_depth: 2,
            lru_keep: 10,
            compile_error_threshold: 3,
            move_on_store: false,
            retry_compress: true,
            compression_level: 6,
            build_command: Vec::new(),
            artifact_paths: Vec::new(),
            executable_path: None,
            execution_args: Vec::new(),
            automation: AutomationPolicy::default(),
        }
    }
}

impl BimonConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BimonError::Config(e.to_string()))
    }

    /// Read `path`, falling back to defaults when it does not exist.
    ///
    /// Relative directories are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text)
                .map_err(|e| BimonError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.store_dir = base.join(&config.store_dir);
            config.workspace_path = base.join(&config.workspace_path);
        }
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(STORE_DIR_ENV).filter(|d| !d.is_empty()) {
            self.store_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bundle_size == 0 {
            return Err(BimonError::Config("bundle_size must be at least 1".into()));
        }
        if self.prefetch_width == 0 {
            return Err(BimonError::Config(
                "prefetch_width must be at least 1".into(),
            ));
        }
        if self.compression_level > 9 {
            return Err(BimonError::Config(format!(
                "compression_level {} is out of range 0-9",
                self.compression_level
            )));
        }
        if self.artifact_paths.iter().any(|p| p.is_absolute()) {
            return Err(BimonError::Config(
                "artifact_paths must be relative to workspace_path".into(),
            ));
        }
        self.automation.validate()?;
        Ok(())
    }

    /// Whether compile commands are configured.
    pub fn can_build(&self) -> bool {
        !self.build_command.is_empty() && !self.artifact_paths.is_empty()
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            move_on_store: self.move_on_store,
            compression_level: self.compression_level,
        }
    }

    pub fn engine_options(&self, cache_only: bool) -> EngineOptions {
        EngineOptions {
            cache_only,
            compile_error_threshold: self.compile_error_threshold,
            ..EngineOptions::default()
        }
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            prefetch_depth: self.prefetch_depth,
            prefetch_width: self.prefetch_width,
            lru_keep: self.lru_keep,
            persist_session: true,
        }
    }

    pub fn precompile_options(&self) -> PrecompileOptions {
        PrecompileOptions {
            bundle_size: self.bundle_size,
            compile_error_threshold: self.compile_error_threshold,
            retry_compress: self.retry_compress,
            compress: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bisect::{AutomationRule, OutcomeMatcher};
    use crate::domain::Mark;

    #[test]
    fn empty_file_gives_defaults() {
        let config = BimonConfig::from_toml_str("").unwrap();
        assert_eq!(config, BimonConfig::default());
        assert_eq!(config.bundle_size, 20);
        assert_eq!(config.lru_keep, 10);
        assert!(config.retry_compress);
    }

    #[test]
    fn parses_automation_rules() {
        let text = r#"
bundle_size = 5
build_command = ["make", "build"]
artifact_paths = ["out"]
executable_path = "out/app"

[[automation.rules]]
mark = "bad"
[automation.rules.when]
kind = "crashed"

[[automation.rules]]
mark = "good"
[automation.rules.when]
kind = "exit_code"
code = 0
"#;
        let config = BimonConfig::from_toml_str(text).unwrap();
        assert_eq!(config.bundle_size, 5);
        assert!(config.can_build());
        assert_eq!(
            config.automation.rules[0],
            AutomationRule::new(OutcomeMatcher::Crashed, Mark::Bad)
        );
        assert_eq!(config.automation.rules.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_values() {
        let config = BimonConfig {
            bundle_size: 0,
            ..BimonConfig::default()
        };
        assert!(matches!(config.validate(), Err(BimonError::Config(_))));

        let config = BimonConfig {
            artifact_paths: vec![PathBuf::from("/abs/out")],
            ..BimonConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BimonConfig {
            automation: AutomationPolicy::manual().with_rule(AutomationRule::new(
                OutcomeMatcher::OutputContains {
                    text: String::new(),
                },
                Mark::Bad,
            )),
            ..BimonConfig::default()
        };
        assert!(matches!(config.validate(), Err(BimonError::Bisect(_))));
    }

    #[test]
    fn invalid_rule_regex_fails_at_load() {
        let text = r#"
[[automation.rules]]
mark = "bad"
[automation.rules.when]
kind = "output_matches"
pattern = "(unclosed"
"#;
        let err = BimonConfig::from_toml_str(text).unwrap_err();
        assert!(matches!(err, BimonError::Config(_)));
    }

    #[test]
    fn unknown_type_is_config_error() {
        let err = BimonConfig::from_toml_str("bundle_size = \"many\"").unwrap_err();
        assert!(matches!(err, BimonError::Config(_)));
    }

    #[test]
    fn load_missing_file_and_relative_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let missing = BimonConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(missing.store_dir, dir.path().join(".bimon"));

        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "store_dir = \"cache\"\n").unwrap();
        let loaded = BimonConfig::load(&path).unwrap();
        assert_eq!(loaded.store_dir, dir.path().join("cache"));
        assert_eq!(loaded.workspace_path, dir.path().join("."));
    }

    #[test]
    fn env_override_replaces_store_dir() {
        let config = BimonConfig::default().with_env_overrides(|key| {
            (key == STORE_DIR_ENV).then(|| "/tmp/bimon-store".to_string())
        });
        assert_eq!(config.store_dir, PathBuf::from("/tmp/bimon-store"));

        let unchanged = BimonConfig::default().with_env_overrides(|_| Some(String::new()));
        assert_eq!(unchanged.store_dir, PathBuf::from(".bimon"));
    }
}
