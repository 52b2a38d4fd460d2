//! Mutation run configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogOptions;

use super::engine::CommandTestRunner;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO failure.
    #[error("io error reading {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file extension is neither YAML nor JSON.
    #[error("unsupported config format for {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),
    /// YAML parse failure.
    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// JSON parse failure.
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    /// No test command to run.
    #[error("no test command configured")]
    MissingTestCommand,
}

/// Configuration for a mutation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MutationConfig {
    /// OpenAPI document describing the API under test.
    pub schema_path: PathBuf,
    /// Root directory where run state is persisted.
    pub run_root: PathBuf,
    /// Optional substring filter over mutant labels.
    pub filter: Option<String>,
    /// Optional per-mutant suite timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Test command: program followed by its arguments.
    pub test_command: Vec<String>,
    /// Directory the test command runs in.
    pub working_dir: Option<PathBuf>,
    /// Exit codes that mean the test command itself broke, not the suite.
    pub error_exit_codes: Vec<i32>,
    /// Run the suite once unarmed before any mutant.
    pub baseline: bool,
    /// Catalog knobs.
    pub catalog: CatalogOptions,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            schema_path: PathBuf::from("openapi.yaml"),
            run_root: PathBuf::from(".apimutant").join("runs"),
            filter: None,
            timeout_secs: None,
            test_command: Vec::new(),
            working_dir: None,
            error_exit_codes: Vec::new(),
            baseline: true,
            catalog: CatalogOptions::default(),
        }
    }
}

impl MutationConfig {
    /// Load from a YAML or JSON file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&text)?),
            Some("json") => Ok(serde_json::from_str(&text)?),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Set schema path.
    pub fn with_schema_path(mut self, schema_path: impl Into<PathBuf>) -> Self {
        self.schema_path = schema_path.into();
        self
    }

    /// Set run-state root.
    pub fn with_run_root(mut self, run_root: impl Into<PathBuf>) -> Self {
        self.run_root = run_root.into();
        self
    }

    /// Set selector filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set timeout in seconds.
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the test command.
    pub fn with_test_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the test command's working directory.
    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    /// Enable or disable the baseline run.
    pub fn with_baseline(mut self, baseline: bool) -> Self {
        self.baseline = baseline;
        self
    }

    /// Set catalog options.
    pub fn with_catalog(mut self, catalog: CatalogOptions) -> Self {
        self.catalog = catalog;
        self
    }

    /// Per-mutant timeout as a duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Build the command runner described by this config.
    pub fn command_runner(&self) -> Result<CommandTestRunner, ConfigError> {
        let (program, args) = self
            .test_command
            .split_first()
            .ok_or(ConfigError::MissingTestCommand)?;
        let mut runner = CommandTestRunner::new(program)
            .with_args(args.iter().cloned())
            .with_error_exit_codes(self.error_exit_codes.iter().copied());
        if let Some(dir) = &self.working_dir {
            runner = runner.with_working_dir(dir);
        }
        if let Some(timeout) = self.timeout() {
            runner = runner.with_timeout(timeout);
        }
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::operators::OperatorKind;

    #[test]
    fn default_paths_and_builder_overrides_work() {
        let default = MutationConfig::default();
        assert!(default.run_root.ends_with(".apimutant/runs"));
        assert!(default.baseline);
        assert!(!default.catalog.is_enabled(OperatorKind::LatencyInjection));

        let cfg = MutationConfig::default()
            .with_schema_path("/tmp/api.yaml")
            .with_run_root("/tmp/runs-a")
            .with_filter("null-field")
            .with_timeout_secs(42)
            .with_test_command(["npm", "test"])
            .with_baseline(false);

        assert_eq!(cfg.schema_path, PathBuf::from("/tmp/api.yaml"));
        assert_eq!(cfg.run_root, PathBuf::from("/tmp/runs-a"));
        assert_eq!(cfg.filter.as_deref(), Some("null-field"));
        assert_eq!(cfg.timeout(), Some(Duration::from_secs(42)));
        assert_eq!(cfg.test_command, vec!["npm".to_string(), "test".to_string()]);
        assert!(!cfg.baseline);
    }

    #[test]
    fn loads_yaml_and_json_by_extension() {
        let tmp = tempdir().expect("tempdir should be created");

        let yaml = tmp.path().join("apimutant.yaml");
        std::fs::write(
            &yaml,
            "schema_path: api/openapi.json\n\
             test_command: [sh, run-tests.sh]\n\
             timeout_secs: 30\n\
             catalog:\n  enabled: [null-field, status-code-swap]\n  exclude_paths: [/internal]\n",
        )
        .expect("yaml should be written");
        let cfg = MutationConfig::load(&yaml).expect("yaml config should load");
        assert_eq!(cfg.schema_path, PathBuf::from("api/openapi.json"));
        assert_eq!(cfg.timeout_secs, Some(30));
        assert!(cfg.baseline);
        assert!(cfg.catalog.is_enabled(OperatorKind::NullField));
        assert!(!cfg.catalog.is_enabled(OperatorKind::FieldOmission));
        assert_eq!(cfg.catalog.exclude_paths, vec!["/internal".to_string()]);
        assert!(cfg.catalog.include_request_fields);

        let json = tmp.path().join("apimutant.json");
        std::fs::write(&json, r#"{ "baseline": false, "filter": "orders" }"#)
            .expect("json should be written");
        let cfg = MutationConfig::load(&json).expect("json config should load");
        assert!(!cfg.baseline);
        assert_eq!(cfg.filter.as_deref(), Some("orders"));

        let toml = tmp.path().join("apimutant.toml");
        std::fs::write(&toml, "baseline = false").expect("toml should be written");
        assert!(matches!(
            MutationConfig::load(&toml),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn command_runner_requires_a_command() {
        assert!(matches!(
            MutationConfig::default().command_runner(),
            Err(ConfigError::MissingTestCommand)
        ));
        assert!(
            MutationConfig::default()
                .with_test_command(["true"])
                .command_runner()
                .is_ok()
        );
    }
}
