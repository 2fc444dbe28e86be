use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{env, fs, path::PathBuf};
use thiserror::Error;

use shutterflow_core::error::PipelineError;
use shutterflow_core::settings::{PathSettings, SelectionMode, Settings};

pub const ENV_CONFIG: &str = "SHUTTERFLOW_CONFIG";
pub const ENV_API_KEY: &str = "SHUTTERFLOW_API_KEY";
pub const ENV_SYNCTHING_API_KEY: &str = "SHUTTERFLOW_SYNCTHING_API_KEY";
pub const ENV_PORT: &str = "SHUTTERFLOW_PORT";

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("shutterflow.toml"),
        PathBuf::from("config/shutterflow.toml"),
        PathBuf::from("/etc/shutterflow/shutterflow.toml"),
    ]
});

/// Raw configuration as defined in a TOML file. Every field is optional;
/// anything absent falls back to the compiled defaults.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub paths: FilePathsConfig,
    #[serde(default)]
    pub catalog: FileCatalogConfig,
    #[serde(default)]
    pub batch: FileBatchConfig,
    #[serde(default)]
    pub dedup: FileDedupConfig,
    #[serde(default)]
    pub syncthing: FileSyncthingConfig,
    #[serde(default)]
    pub sorter: FileSorterConfig,
    #[serde(default)]
    pub cleanup: FileCleanupConfig,
    #[serde(default)]
    pub pipeline: FilePipelineConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FilePathsConfig {
    pub source_dir: Option<PathBuf>,
    pub duplicates_dir: Option<PathBuf>,
    pub batch_dir: Option<PathBuf>,
    pub sorted_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileCatalogConfig {
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileBatchConfig {
    pub max_size_gb: Option<f64>,
    pub naming_pattern: Option<String>,
    /// "size" or "count".
    pub selection_mode: Option<String>,
    pub max_files: Option<u32>,
    pub allow_parallel: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileDedupConfig {
    pub move_duplicates: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileSyncthingConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub folder_id: Option<String>,
    pub device_id: Option<String>,
    pub timeout_secs: Option<u64>,
    pub rescan_settle_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileSorterConfig {
    pub folder_pattern: Option<String>,
    pub modified_fallback: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileCleanupConfig {
    pub temp_retention_days: Option<u32>,
    pub log_max_bytes: Option<u64>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FilePipelineConfig {
    pub poll_interval_secs: Option<u64>,
    pub poll_samples: Option<u32>,
    pub post_sync_delay_secs: Option<u64>,
}

/// Environment overrides, gathered up front so the merge itself stays
/// testable without mutating process state.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub config_path: Option<PathBuf>,
    pub api_key: Option<String>,
    pub syncthing_api_key: Option<String>,
    pub port: Option<String>,
}

impl EnvOverrides {
    pub fn gather() -> Self {
        Self {
            config_path: env::var(ENV_CONFIG).ok().map(PathBuf::from),
            api_key: env::var(ENV_API_KEY).ok(),
            syncthing_api_key: env::var(ENV_SYNCTHING_API_KEY).ok(),
            port: env::var(ENV_PORT).ok(),
        }
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub settings: Settings,
    pub warnings: Vec<String>,
    /// The file the settings came from, when one was found.
    pub source: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file missing: {path}")]
    Missing { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
    #[error(transparent)]
    Invalid(#[from] PipelineError),
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    root: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Root every pipeline directory (and the catalog database) under one
    /// directory, overriding any per-path configuration.
    pub fn with_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.root = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigError> {
        let env_file_loaded = dotenvy::dotenv().map(|_| true).or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(err),
        })?;

        let overrides = EnvOverrides::gather();
        let (file, source) = self.load_file_config(&overrides)?;

        let mut warnings = Vec::new();
        let mut settings = Settings::default();

        if source.is_none() {
            warnings.push(
                "no shutterflow.toml detected; running on defaults plus environment overrides"
                    .to_string(),
            );
        }

        if let Some(file) = file {
            apply_file(&mut settings, file, &mut warnings);
        }
        apply_env(&mut settings, &overrides, &mut warnings);

        if let Some(root) = &self.root {
            settings.paths = PathSettings::rooted_at(root);
            settings.catalog.db_path = root.join("catalog.sqlite");
        }

        if settings.syncthing.api_key.is_empty() {
            warnings.push(
                "syncthing.api_key is empty; replication requests will be rejected by Syncthing"
                    .to_string(),
            );
        }

        settings.validate()?;

        Ok(ConfigLoad {
            settings,
            warnings,
            source,
            env_file_loaded,
        })
    }

    fn load_file_config(
        &self,
        overrides: &EnvOverrides,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigError> {
        // Explicit paths (CLI flag or env var) must exist; the default
        // locations are best-effort.
        let explicit = self
            .config_path
            .clone()
            .or_else(|| overrides.config_path.clone());

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::Missing { path });
                }
                path
            }
            None => {
                let Some(found) = DEFAULT_CONFIG_LOCATIONS
                    .iter()
                    .find(|candidate| candidate.exists())
                    .cloned()
                else {
                    return Ok((None, None));
                };
                found
            }
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

        Ok((Some(file), Some(path)))
    }
}

fn apply_file(settings: &mut Settings, file: FileConfig, warnings: &mut Vec<String>) {
    let FileConfig {
        server,
        paths,
        catalog,
        batch,
        dedup,
        syncthing,
        sorter,
        cleanup,
        pipeline,
    } = file;

    if let Some(host) = server.host {
        settings.server.host = host;
    }
    if let Some(port) = server.port {
        settings.server.port = port;
    }
    if let Some(api_key) = server.api_key {
        settings.server.api_key = normalize_api_key(api_key, warnings);
    }

    if let Some(dir) = paths.source_dir {
        settings.paths.source_dir = dir;
    }
    if let Some(dir) = paths.duplicates_dir {
        settings.paths.duplicates_dir = dir;
    }
    if let Some(dir) = paths.batch_dir {
        settings.paths.batch_dir = dir;
    }
    if let Some(dir) = paths.sorted_dir {
        settings.paths.sorted_dir = dir;
    }
    if let Some(dir) = paths.temp_dir {
        settings.paths.temp_dir = dir;
    }

    if let Some(db_path) = catalog.db_path {
        settings.catalog.db_path = db_path;
    }

    if let Some(max_size_gb) = batch.max_size_gb {
        settings.batch.max_size_gb = max_size_gb;
    }
    if let Some(pattern) = batch.naming_pattern {
        settings.batch.naming_pattern = pattern;
    }
    if let Some(mode) = batch.selection_mode {
        match parse_selection_mode(&mode) {
            Some(parsed) => settings.batch.selection_mode = parsed,
            None => warnings.push(format!(
                "batch.selection_mode {mode:?} is not \"size\" or \"count\"; keeping {:?}",
                settings.batch.selection_mode
            )),
        }
    }
    if let Some(max_files) = batch.max_files {
        settings.batch.max_files = max_files;
    }
    if let Some(allow_parallel) = batch.allow_parallel {
        settings.batch.allow_parallel = allow_parallel;
    }

    if let Some(move_duplicates) = dedup.move_duplicates {
        settings.dedup.move_duplicates = move_duplicates;
    }

    if let Some(api_url) = syncthing.api_url {
        settings.syncthing.api_url = api_url;
    }
    if let Some(api_key) = syncthing.api_key {
        settings.syncthing.api_key = api_key;
    }
    if let Some(folder_id) = syncthing.folder_id {
        settings.syncthing.folder_id = folder_id;
    }
    if let Some(device_id) = syncthing.device_id {
        settings.syncthing.device_id = Some(device_id);
    }
    if let Some(timeout_secs) = syncthing.timeout_secs {
        settings.syncthing.timeout_secs = timeout_secs;
    }
    if let Some(settle) = syncthing.rescan_settle_secs {
        settings.syncthing.rescan_settle_secs = settle;
    }

    if let Some(pattern) = sorter.folder_pattern {
        settings.sorter.folder_pattern = pattern;
    }
    if let Some(fallback) = sorter.modified_fallback {
        settings.sorter.modified_fallback = fallback;
    }

    if let Some(days) = cleanup.temp_retention_days {
        settings.cleanup.temp_retention_days = days;
    }
    if let Some(bytes) = cleanup.log_max_bytes {
        settings.cleanup.log_max_bytes = bytes;
    }
    if let Some(dir) = cleanup.log_dir {
        settings.cleanup.log_dir = Some(dir);
    }

    if let Some(secs) = pipeline.poll_interval_secs {
        settings.pipeline.poll_interval_secs = secs;
    }
    if let Some(samples) = pipeline.poll_samples {
        settings.pipeline.poll_samples = samples;
    }
    if let Some(secs) = pipeline.post_sync_delay_secs {
        settings.pipeline.post_sync_delay_secs = secs;
    }
}

fn apply_env(settings: &mut Settings, overrides: &EnvOverrides, warnings: &mut Vec<String>) {
    if let Some(api_key) = overrides.api_key.clone() {
        settings.server.api_key = normalize_api_key(api_key, warnings);
    }
    if let Some(api_key) = overrides.syncthing_api_key.clone() {
        settings.syncthing.api_key = api_key;
    }
    if let Some(port) = &overrides.port {
        match port.parse::<u16>() {
            Ok(parsed) => settings.server.port = parsed,
            Err(_) => warnings.push(format!(
                "{ENV_PORT} {port:?} is not a valid port; keeping {}",
                settings.server.port
            )),
        }
    }
}

fn normalize_api_key(raw: String, warnings: &mut Vec<String>) -> Option<String> {
    if raw.trim().is_empty() {
        warnings.push("server.api_key is empty; API authentication is disabled".to_string());
        None
    } else {
        Some(raw)
    }
}

fn parse_selection_mode(raw: &str) -> Option<SelectionMode> {
    match raw.to_ascii_lowercase().as_str() {
        "size" => Some(SelectionMode::Size),
        "count" => Some(SelectionMode::Count),
        _ => None,
    }
}
