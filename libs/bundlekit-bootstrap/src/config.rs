use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bundlekit::{DependencyOptions, OrchestratorConfig, Scope};

use crate::paths::home_dir::resolve_home_dir;

/// Application configuration: orchestrator tuning, logging and the workspace
/// manifest to operate on.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Base directory for logs; normalized to an absolute path on load.
    #[serde(default)]
    pub home_dir: String,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub workspace: WorkspaceSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorSection {
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    pub allow_cycles: bool,
    pub scope: Scope,
    pub exclude_build_errors: bool,
    pub include_requiring_on_activate: bool,
    pub include_providing_on_deactivate: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            start_timeout: defaults.start_timeout,
            stop_timeout: defaults.stop_timeout,
            allow_cycles: defaults.options.allow_cycles,
            scope: defaults.options.scope,
            exclude_build_errors: defaults.options.exclude_build_errors,
            include_requiring_on_activate: defaults.options.include_requiring_on_activate,
            include_providing_on_deactivate: defaults.options.include_providing_on_deactivate,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceSection {
    /// Path to the YAML workspace manifest.
    #[serde(default)]
    pub manifest: Option<String>,
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

/// Console at info, JSON file at debug under `<home_dir>/logs`.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/bundlekit.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(50),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            home_dir: String::new(),
            orchestrator: OrchestratorSection::default(),
            logging: Some(default_logging_config()),
            workspace: WorkspaceSection::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    /// Also normalizes `home_dir` into an absolute path and creates the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Logging stays None unless YAML or ENV provide it.
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path.as_ref()))
            // BUNDLEKIT__ORCHESTRATOR__START_TIMEOUT=5s maps to orchestrator.start_timeout
            .merge(Env::prefixed("BUNDLEKIT__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| {
                format!(
                    "Failed to extract config from {}",
                    config_path.as_ref().display()
                )
            })?;

        config
            .normalize_home_dir()
            .context("Failed to resolve home_dir")?;
        Ok(config)
    }

    /// Load configuration from file or create with default values.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                c.normalize_home_dir()
                    .context("Failed to resolve home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(manifest) = &args.manifest {
            self.workspace.manifest = Some(manifest.clone());
        }
        if args.allow_cycles {
            self.orchestrator.allow_cycles = true;
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }

    pub fn dependency_options(&self) -> DependencyOptions {
        let o = &self.orchestrator;
        DependencyOptions {
            allow_cycles: o.allow_cycles,
            include_requiring_on_activate: o.include_requiring_on_activate,
            include_providing_on_deactivate: o.include_providing_on_deactivate,
            scope: o.scope.clone(),
            exclude_build_errors: o.exclude_build_errors,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            start_timeout: self.orchestrator.start_timeout,
            stop_timeout: self.orchestrator.stop_timeout,
            options: self.dependency_options(),
        }
    }

    /// The manifest to load, if one is configured.
    pub fn manifest_path(&self) -> Option<PathBuf> {
        self.workspace
            .manifest
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .map(PathBuf::from)
    }

    fn normalize_home_dir(&mut self) -> Result<()> {
        let opt = if self.home_dir.trim().is_empty() {
            None
        } else {
            Some(self.home_dir.clone())
        };
        let resolved: PathBuf = resolve_home_dir(opt, default_subdir(), /*create*/ true)
            .context("home_dir normalization failed")?;
        self.home_dir = resolved.to_string_lossy().to_string();
        Ok(())
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub manifest: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
    pub allow_cycles: bool,
}

const fn default_subdir() -> &'static str {
    ".bundlekit"
}
