use anyhow::{Context, Result};
use fleet_link::{ExecConfig, LogConfig, MuxConfig, ws_base_url};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

// Layered from defaults, then `<data_dir>/config.toml`, then env vars:
//
//   config.toml:     [multiplexer]
//                    max_attempts = 8
//
//   env var:         FLEET_MULTIPLEXER__MAX_ATTEMPTS=8   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub cluster: ClusterFileConfig,
    #[serde(default)]
    pub multiplexer: MuxConfig,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default)]
    pub exec: ExecConfig,
}

/// Where the cluster API lives (`[cluster]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterFileConfig {
    #[serde(default = "default_address")]
    pub address: String,
    /// Event socket endpoint. Defaults to `<address as ws>/api/ws`.
    #[serde(default)]
    pub mux_url: Option<String>,
}

impl Default for ClusterFileConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            mux_url: None,
        }
    }
}

fn default_address() -> String {
    "http://127.0.0.1:4646".to_string()
}

impl ClusterFileConfig {
    pub fn ws_base(&self) -> String {
        ws_base_url(&self.address)
    }

    pub fn mux_url(&self) -> String {
        match &self.mux_url {
            Some(url) => url.clone(),
            None => format!("{}/api/ws", self.ws_base()),
        }
    }
}

pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("FLEET_").split("__"))
}

/// Local directories used by the client.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub data_dir: PathBuf,
    /// Default destination for `fleet logs --download`.
    pub exports_dir: PathBuf,
}

impl FleetConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".fleet"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let exports_dir = data_dir.join("exports");
        std::fs::create_dir_all(&exports_dir)
            .with_context(|| format!("Failed to create exports directory: {:?}", exports_dir))?;

        debug!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            exports_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.data_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_toml_path()))
    }
}
