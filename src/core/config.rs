/*
 * Application configuration: export size, accepted layer kinds, output location,
 * recognition service settings and the classification tables. Settings are kept as
 * JSON (`config.json`) in the per-user local configuration directory. A missing
 * file simply means defaults; the file is written on the first save.
 *
 * It uses a trait-based approach (`ConfigManagerOperations`) so the handler and the
 * tests can swap the storage. `CoreConfigManager` resolves its directory through
 * `path_utils` unless one is injected.
 */
use crate::core::capture::CanvasSize;
use crate::core::classification::{CategoryRule, LayerNameRules, TierRules, default_category_rules};
use crate::core::grouping::GroupingMode;
use crate::core::layer_tree::ContentKind;
use crate::core::path_utils;
use crate::core::recognition::RecognitionSettings;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "config.json";
pub const API_KEY_ENV: &str = "LAYER_SORTER_API_KEY";
pub const SECRET_KEY_ENV: &str = "LAYER_SORTER_SECRET_KEY";

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    NoProjectDirectory,
    Serde(serde_json::Error),
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Serde(err)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Configuration I/O error: {e}"),
            ConfigError::NoProjectDirectory => {
                write!(f, "Could not determine the directory for configuration")
            }
            ConfigError::Serde(e) => write!(f, "Configuration file format error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub canonical_size: CanvasSize,
    pub accepted_kinds: Vec<ContentKind>,
    pub output_dir: Option<PathBuf>,
    pub plan_file_name: String,
    // Write the classification result as an editable plan next to the exports.
    pub emit_plan: bool,
    pub recognition: RecognitionSettings,
    pub category_rules: Vec<CategoryRule>,
    pub tier_rules: TierRules,
    pub layer_name_rules: LayerNameRules,
    pub default_grouping_mode: GroupingMode,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_level: "info".to_string(),
            canonical_size: CanvasSize::default(),
            accepted_kinds: vec![ContentKind::Pixel, ContentKind::SmartObject],
            output_dir: None,
            plan_file_name: "rename_list.csv".to_string(),
            emit_plan: false,
            recognition: RecognitionSettings::default(),
            category_rules: default_category_rules(),
            tier_rules: TierRules::default(),
            layer_name_rules: LayerNameRules::default(),
            default_grouping_mode: GroupingMode::ByCategory,
        }
    }
}

impl AppConfig {
    /// Unknown level names fall back to `Info`.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// The configured output directory, else `layer_export` on the desktop or in home.
    pub fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .or_else(path_utils::default_output_dir)
            .unwrap_or_else(|| PathBuf::from(path_utils::OUTPUT_DIR_NAME))
    }

    pub fn plan_path(&self) -> PathBuf {
        self.resolved_output_dir().join(&self.plan_file_name)
    }

    /*
     * Replaces the recognition credentials with values from `lookup` (normally the
     * process environment) when it has non-blank ones.
     */
    pub fn apply_credential_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_blank = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(api_key) = non_blank(API_KEY_ENV) {
            log::debug!("ConfigManager: API key taken from {API_KEY_ENV}.");
            self.recognition.api_key = api_key;
        }
        if let Some(secret_key) = non_blank(SECRET_KEY_ENV) {
            log::debug!("ConfigManager: Secret key taken from {SECRET_KEY_ENV}.");
            self.recognition.secret_key = secret_key;
        }
    }
}

pub trait ConfigManagerOperations: Send + Sync {
    fn load_config(&self, app_name: &str) -> Result<AppConfig>;
    fn save_config(&self, app_name: &str, config: &AppConfig) -> Result<()>;
}

pub struct CoreConfigManager {
    config_dir: Option<PathBuf>,
}

impl CoreConfigManager {
    pub fn new() -> Self {
        CoreConfigManager { config_dir: None }
    }

    /// A manager that reads and writes `config.json` in `dir` instead of the user directory.
    pub fn with_config_dir(dir: &Path) -> Self {
        CoreConfigManager {
            config_dir: Some(dir.to_path_buf()),
        }
    }

    fn config_file_path(&self, app_name: &str) -> Result<PathBuf> {
        let dir = match &self.config_dir {
            Some(dir) => dir.clone(),
            None => path_utils::get_base_app_config_local_dir(app_name)
                .ok_or(ConfigError::NoProjectDirectory)?,
        };
        Ok(dir.join(CONFIG_FILENAME))
    }
}

impl Default for CoreConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManagerOperations for CoreConfigManager {
    fn load_config(&self, app_name: &str) -> Result<AppConfig> {
        log::trace!("ConfigManager: Loading configuration for app '{app_name}'");
        let file_path = self.config_file_path(app_name)?;
        if !file_path.exists() {
            log::debug!("ConfigManager: {file_path:?} does not exist, using defaults.");
            return Ok(AppConfig::default());
        }
        let reader = BufReader::new(File::open(&file_path)?);
        let config: AppConfig = serde_json::from_reader(reader)?;
        log::debug!("ConfigManager: Loaded configuration from {file_path:?}.");
        Ok(config)
    }

    fn save_config(&self, app_name: &str, config: &AppConfig) -> Result<()> {
        let file_path = self.config_file_path(app_name)?;
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(&file_path)?);
        serde_json::to_writer_pretty(writer, config)?;
        log::debug!("ConfigManager: Saved configuration to {file_path:?}.");
        Ok(())
    }
}
