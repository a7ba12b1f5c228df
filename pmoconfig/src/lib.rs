//! # pmoconfig - Configuration de l'agent PMOSignage
//!
//! Un document YAML unique décrit l'agent : répertoire de travail, serveur
//! de contrôle, service de lecture, intervalles et journalisation. Il est
//! construit à partir de la configuration intégrée, complétée par
//! `config.yaml` puis par les variables `PMOSIGNAGE_CONFIG__SECTION__KEY`.
//!
//! ```no_run
//! use pmoconfig::get_config;
//!
//! let config = get_config();
//! let server = config.get_server_url();
//! let working_dir = config.get_working_dir()?;
//! config.set_poll_interval_secs(120)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use lazy_static::lazy_static;
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::info;
use uuid::Uuid;

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmosignage.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load_config("").expect("Failed to load PMOSignage configuration"));
}

const ENV_CONFIG_DIR: &str = "PMOSIGNAGE_CONFIG";
const ENV_PREFIX: &str = "PMOSIGNAGE_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmosignage";

const DEFAULT_WORKING_DIR: &str = "media";
const DEFAULT_SNAPSHOT_FILE: &str = "db.json";
const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
const DEFAULT_SERVICE_NAME: &str = "mediaplayer";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 60;
const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_DIGEST_CHUNK_SIZE: usize = 1024 * 1024;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// Getter/setter pair for a size, falling back to `$default`
macro_rules! impl_usize_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<usize> {
            match self.get_value($path) {
                Ok(Value::Number(n)) => Ok(n.as_u64().map(|v| v as usize).unwrap_or($default)),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, size: usize) -> Result<()> {
            let n = Number::from(size);
            self.set_value($path, Value::Number(n))
        }
    };
}

/// Macro to generate getter/setter for u64 values with default
macro_rules! impl_u64_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<u64> {
            match self.get_value($path) {
                Ok(Value::Number(n)) => Ok(n.as_u64().unwrap_or($default)),
                Ok(Value::String(s)) => Ok(s.trim().parse::<u64>().unwrap_or($default)),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: u64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Getter/setter pair for a flag, falling back to `$default`
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path) {
                Ok(Value::Bool(b)) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Where the agent takes its task batches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskSourceKind {
    /// The control plane at `agent.server_url`
    #[default]
    Remote,
    /// The local snapshot only (offline mode)
    Local,
}

impl FromStr for TaskSourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "remote" => Ok(Self::Remote),
            "local" | "json" => Ok(Self::Local),
            other => Err(anyhow!("Unknown task source '{}'", other)),
        }
    }
}

impl fmt::Display for TaskSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("remote"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// Agent configuration backed by a YAML document
///
/// The document is the embedded default overlaid with `config.yaml` from
/// the configuration directory, then with `PMOSIGNAGE_CONFIG__*`
/// variables. Every setter writes the merged document back to disk.
///
/// ```no_run
/// use pmoconfig::get_config;
///
/// let config = get_config();
/// println!("Polling every {}s", config.get_poll_interval_secs()?);
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(self.data().clone()),
        }
    }
}

impl Config {
    fn data(&self) -> MutexGuard<'_, Value> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Candidate directory: argument, env var, `./.pmosignage`, `~/.pmosignage`
    fn locate_config_dir(directory: &str) -> PathBuf {
        if !directory.is_empty() {
            return PathBuf::from(directory);
        }
        if let Ok(from_env) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %from_env, "Config directory from environment");
            return PathBuf::from(from_env);
        }

        let local = PathBuf::from(CONFIG_DIR_NAME);
        if local.exists() {
            return local;
        }
        home_dir()
            .map(|home| home.join(CONFIG_DIR_NAME))
            .filter(|dir| dir.exists())
            .unwrap_or(local)
    }

    /// Creates `dir` if needed and checks that it is a writable directory
    fn ensure_writable_dir(dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        if !dir.is_dir() {
            return Err(anyhow!("Configuration path {} is not a directory", dir.display()));
        }
        let probe = dir.join(".write_test");
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;
        Ok(())
    }

    /// Resolves the configuration directory and makes sure it is usable
    ///
    /// Search order: `directory` when not empty, `PMOSIGNAGE_CONFIG`,
    /// `.pmosignage` in the current directory, then in the home directory.
    pub fn config_dir(directory: &str) -> Result<String> {
        let dir = Self::locate_config_dir(directory);
        Self::ensure_writable_dir(&dir)?;
        Ok(dir.to_string_lossy().into_owned())
    }

    /// Loads (and rewrites) `config.yaml` from the configuration directory
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        let path = Path::new(&config_dir)
            .join("config.yaml")
            .to_string_lossy()
            .into_owned();
        info!(config_dir = %config_dir, config_file = %path, "Loading configuration");

        let mut document: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        match fs::read_to_string(&path) {
            Ok(text) => {
                let local: Value = serde_yaml::from_str(&text)?;
                merge_yaml(&mut document, &local);
            }
            Err(_) => info!("No config.yaml yet, starting from the embedded defaults"),
        }

        let mut document = Self::lower_keys_value(document);
        Self::apply_env_overrides(&mut document);

        let config = Self {
            config_dir,
            path,
            data: Mutex::new(document),
        };
        config.save()?;
        Ok(config)
    }

    pub fn get_config_dir(&self) -> &str {
        &self.config_dir
    }

    /// Writes the current document to `config.yaml`
    pub fn save(&self) -> Result<()> {
        let text = serde_yaml::to_string(&*self.data())?;
        fs::write(&self.path, text)?;
        Ok(())
    }

    /// Stores `value` at `path` (e.g. `&["agent", "serial"]`) and saves
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        Self::insert_at(&mut self.data(), path, value)?;
        self.save()
    }

    fn insert_at(node: &mut Value, path: &[&str], value: Value) -> Result<()> {
        let Some((head, rest)) = path.split_first() else {
            *node = value;
            return Ok(());
        };
        let Value::Mapping(map) = node else {
            return Err(anyhow!("Cannot set '{}': parent is not a mapping", head));
        };
        let key = Value::String(head.to_lowercase());
        if rest.is_empty() {
            map.insert(key, value);
            Ok(())
        } else {
            let child = map.entry(key).or_insert_with(|| Value::Mapping(Mapping::new()));
            Self::insert_at(child, rest, value)
        }
    }

    /// Reads the value at `path`; fails when a key is missing
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data();
        let mut node = &*data;
        for (depth, key) in path.iter().enumerate() {
            node = node
                .as_mapping()
                .and_then(|map| map.get(Value::String(key.to_lowercase())))
                .ok_or_else(|| anyhow!("No configuration value at {}", path[..=depth].join(".")))?;
        }
        Ok(node.clone())
    }

    fn get_string(&self, path: &[&str]) -> Option<String> {
        match self.get_value(path).ok()? {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// `PMOSIGNAGE_CONFIG__AGENT__SERIAL=abc` sets `agent.serial`
    fn apply_env_overrides(document: &mut Value) {
        for (name, raw) in env::vars() {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path: Vec<&str> = key.split("__").collect();
            let value = serde_yaml::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
            if let Err(e) = Self::insert_at(document, &path, value) {
                tracing::warn!(variable = %name, "Ignoring override: {}", e);
            }
        }
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => Value::Mapping(
                map.into_iter()
                    .map(|(k, v)| {
                        let k = match k {
                            Value::String(s) => Value::String(s.to_lowercase()),
                            other => other,
                        };
                        (k, Self::lower_keys_value(v))
                    })
                    .collect(),
            ),
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            other => other,
        }
    }

    /// Directory stored at `path`, relative to the config directory unless
    /// absolute, created on demand
    ///
    /// When nothing is configured `default` is written back first.
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<String> {
        let configured = match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => {
                self.set_managed_dir(path, default.to_string())?;
                default.to_string()
            }
        };

        let dir = Path::new(&self.config_dir).join(&configured);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            info!(directory = %dir.display(), "Created managed directory");
        }
        Ok(dir.to_string_lossy().into_owned())
    }

    pub fn set_managed_dir(&self, path: &[&str], directory: String) -> Result<()> {
        self.set_value(path, Value::String(directory))
    }

    /// Gets the working directory holding placed media, output aliases and the snapshot
    pub fn get_working_dir(&self) -> Result<String> {
        self.get_managed_dir(&["agent", "working_dir"], DEFAULT_WORKING_DIR)
    }

    pub fn set_working_dir(&self, directory: String) -> Result<()> {
        self.set_managed_dir(&["agent", "working_dir"], directory)
    }

    /// File name of the JSON snapshot inside the working directory
    pub fn get_snapshot_file(&self) -> String {
        self.get_string(&["agent", "snapshot_file"])
            .unwrap_or_else(|| DEFAULT_SNAPSHOT_FILE.to_string())
    }

    /// Gets the control-plane base URL (without trailing slash)
    pub fn get_server_url(&self) -> String {
        match self.get_string(&["agent", "server_url"]) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                tracing::warn!(
                    "Server URL is not configured, using default {}",
                    DEFAULT_SERVER_URL
                );
                DEFAULT_SERVER_URL.to_string()
            }
        }
    }

    pub fn set_server_url(&self, url: String) -> Result<()> {
        self.set_value(&["agent", "server_url"], Value::String(url))
    }

    /// Gets the serial number the agent identifies itself with
    ///
    /// The configured serial wins. Otherwise the `probed` serial (from the
    /// hardware) is used as is. When neither exists a UUID is generated and
    /// stored so that the identity survives restarts.
    pub fn get_device_serial(&self, probed: Option<&str>) -> Result<String> {
        if let Some(serial) = self.get_string(&["agent", "serial"]) {
            return Ok(serial);
        }
        if let Some(serial) = probed.map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(serial.to_string());
        }
        let serial = Uuid::new_v4().to_string();
        self.set_device_serial(serial.clone())?;
        Ok(serial)
    }

    pub fn set_device_serial(&self, serial: String) -> Result<()> {
        self.set_value(&["agent", "serial"], Value::String(serial))
    }

    /// Gets where task batches come from (`remote` or `local`)
    pub fn get_task_source(&self) -> TaskSourceKind {
        match self.get_string(&["agent", "task_source"]) {
            Some(s) => s.parse().unwrap_or_else(|err| {
                tracing::warn!("{}, using remote", err);
                TaskSourceKind::Remote
            }),
            None => TaskSourceKind::default(),
        }
    }

    pub fn set_task_source(&self, kind: TaskSourceKind) -> Result<()> {
        self.set_value(&["agent", "task_source"], Value::String(kind.to_string()))
    }

    /// Gets the configured list of video outputs
    ///
    /// An empty list means "use the outputs detected on the device".
    pub fn get_displays(&self) -> Vec<String> {
        match self.get_value(&["agent", "displays"]) {
            Ok(Value::Sequence(seq)) => seq
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_displays(&self, displays: Vec<String>) -> Result<()> {
        let seq = displays.into_iter().map(Value::String).collect();
        self.set_value(&["agent", "displays"], Value::Sequence(seq))
    }

    /// Gets the name of the playback service bounced around an alias swap
    ///
    /// An empty name disables service control.
    pub fn get_service_name(&self) -> String {
        match self.get_value(&["agent", "service", "name"]) {
            Ok(Value::String(s)) => s.trim().to_string(),
            Ok(Value::Null) => String::new(),
            _ => DEFAULT_SERVICE_NAME.to_string(),
        }
    }

    pub fn set_service_name(&self, name: String) -> Result<()> {
        self.set_value(&["agent", "service", "name"], Value::String(name))
    }

    impl_bool_config!(
        get_service_use_sudo,
        set_service_use_sudo,
        &["agent", "service", "use_sudo"],
        true
    );

    impl_u64_config!(
        get_poll_interval_secs,
        set_poll_interval_secs,
        &["agent", "poll_interval_secs"],
        DEFAULT_POLL_INTERVAL_SECS
    );

    impl_u64_config!(
        get_scheduler_interval_secs,
        set_scheduler_interval_secs,
        &["agent", "scheduler_interval_secs"],
        DEFAULT_SCHEDULER_INTERVAL_SECS
    );

    impl_usize_config!(
        get_download_chunk_size,
        set_download_chunk_size,
        &["agent", "download", "chunk_size"],
        DEFAULT_DOWNLOAD_CHUNK_SIZE
    );

    impl_u64_config!(
        get_download_timeout_secs,
        set_download_timeout_secs,
        &["agent", "download", "timeout_secs"],
        DEFAULT_DOWNLOAD_TIMEOUT_SECS
    );

    impl_usize_config!(
        get_digest_chunk_size,
        set_digest_chunk_size,
        &["agent", "digest", "chunk_size"],
        DEFAULT_DIGEST_CHUNK_SIZE
    );

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["host", "logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    /// Minimum log level (`TRACE` .. `ERROR`) when `RUST_LOG` is unset
    pub fn get_log_min_level(&self) -> String {
        self.get_string(&["host", "logger", "min_level"])
            .unwrap_or_else(|| DEFAULT_LOG_MIN_LEVEL.to_string())
    }

    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["host", "logger", "min_level"], Value::String(level))
    }
}

/// Shared configuration, loaded from the default location on first use
///
/// # Panics
///
/// When no configuration directory can be created or written.
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

/// Overlays `local` onto `base`: mappings merge key by key, anything else
/// is replaced
fn merge_yaml(base: &mut Value, local: &Value) {
    match (base, local) {
        (Value::Mapping(base_map), Value::Mapping(local_map)) => {
            for (key, value) in local_map {
                if let Some(existing) = base_map.get_mut(key) {
                    merge_yaml(existing, value);
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (base, local) => *base = local.clone(),
    }
}
