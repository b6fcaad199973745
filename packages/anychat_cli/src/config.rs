use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use anychat_relay::relay::DEFAULT_WS_URL;
use anychat_relay::{ApiConfig, RelayConfig};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [relay]
//                    reconnect_delay_secs = 3
//
//   env var:         ANYCHAT_RELAY__RECONNECT_DELAY_SECS=3   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub log: LogFileConfig,
}

/// Backend endpoints (lives under `[api]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_external_base")]
    pub external_base: String,
    #[serde(default = "default_backend_base")]
    pub backend_base: String,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            external_base: default_external_base(),
            backend_base: default_backend_base(),
        }
    }
}

/// Chat socket settings (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub agency_id: Option<String>,
    /// Seconds to wait before reopening after an unclean close. 0 = never.
    #[serde(default)]
    pub reconnect_delay_secs: u64,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            project_id: None,
            agency_id: None,
            reconnect_delay_secs: 0,
        }
    }
}

/// Logging (lives under `[log]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogFileConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `anychat_relay=debug`.
    #[serde(default)]
    pub level: Option<String>,
}

fn default_external_base() -> String {
    "https://api.chatbot24.ai/v1".to_string()
}
fn default_backend_base() -> String {
    "http://localhost:5000".to_string()
}
fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

impl ApiFileConfig {
    pub fn to_runtime(&self) -> ApiConfig {
        ApiConfig {
            external_base: self.external_base.clone(),
            backend_base: self.backend_base.clone(),
        }
    }
}

impl RelayFileConfig {
    pub fn to_runtime(&self) -> RelayConfig {
        RelayConfig {
            ws_url: self.ws_url.clone(),
            project_id: self.project_id.clone().filter(|s| !s.is_empty()),
            agency_id: self.agency_id.clone().filter(|s| !s.is_empty()),
            reconnect_delay: (self.reconnect_delay_secs > 0)
                .then(|| Duration::from_secs(self.reconnect_delay_secs)),
        }
    }
}

/// Build a figment that layers: defaults → config.toml → ANYCHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ANYCHAT_API__BACKEND_BASE=http://10.0.0.2:5000`  →  `api.backend_base`
///   `ANYCHAT_RELAY__PROJECT_ID=p-1`  →  `relay.project_id`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("ANYCHAT_").split("__"))
}

/// Read-modify-write `config.toml` to set one dotted key, e.g. `relay.project_id`.
///
/// The value is stored as an integer, a boolean or a string, whichever the
/// field accepts first.
pub fn set_config_value(path: &Path, key: &str, value: &str) -> Result<()> {
    let (section, field) = key
        .split_once('.')
        .with_context(|| format!("Key must look like section.field, got {key:?}"))?;

    let mut doc = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        contents
            .parse::<toml::Table>()
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        toml::Table::new()
    };

    let candidates = [
        value.parse::<i64>().ok().map(toml::Value::Integer),
        value.parse::<bool>().ok().map(toml::Value::Boolean),
        Some(toml::Value::String(value.to_string())),
    ];
    for candidate in candidates.into_iter().flatten() {
        section_table(&mut doc, section)?.insert(field.to_string(), candidate);
        let serialized = toml::to_string_pretty(&doc).context("Failed to serialize config.toml")?;
        if toml::from_str::<FileConfig>(&serialized).is_ok() {
            std::fs::write(path, serialized)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            return Ok(());
        }
    }
    anyhow::bail!("Invalid value for {key}: {value:?}")
}

fn section_table<'a>(doc: &'a mut toml::Table, section: &str) -> Result<&'a mut toml::Table> {
    doc.entry(section)
        .or_insert_with(|| toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .with_context(|| format!("[{section}] in config.toml is not a table"))
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct AppDirs {
    pub data_dir: PathBuf,
}

impl AppDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".anychat"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
