use std::{collections::HashMap, net::SocketAddr, path::{Path, PathBuf}};

use anyhow::Context;
use serde::Deserialize;

use crate::request::RequestGlobalContext;

/// The fully resolved server configuration, after the config file (if any)
/// and the command line have been merged.
#[derive(Clone, Debug)]
pub struct EchoConfiguration {
    pub env_vars: HashMap<String, String>,
    pub http_configuration: HttpConfiguration,
}

#[derive(Clone, Debug)]
pub struct HttpConfiguration {
    pub listen_on: SocketAddr,
    pub default_hostname: String,
    pub tls: Option<TlsConfiguration>,
}

#[derive(Clone, Debug)]
pub struct TlsConfiguration {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// On-disk configuration file. All entries are optional; command line flags
/// take precedence over anything set here.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub server: Option<ServerFileEntry>,
    /// Extra variables to list in the Server Variables section of every
    /// response, merged below `--env-file` and `--env`.
    pub env: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServerFileEntry {
    pub listen: Option<SocketAddr>,
    pub hostname: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl EchoConfiguration {
    pub fn request_global_context(&self) -> RequestGlobalContext {
        RequestGlobalContext {
            default_host: self.http_configuration.default_hostname.to_owned(),
            use_tls: self.http_configuration.tls.is_some(),
            global_env_vars: self.env_vars.clone(),
        }
    }
}

pub async fn read_config_file(path: &Path) -> anyhow::Result<ConfigFile> {
    tracing::info!(?path, "Loading server config file");
    if !tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
    {
        return Err(anyhow::anyhow!(
            "no configuration file found at {}",
            path.display()
        ));
    }

    let data = std::fs::read(path)
        .with_context(|| format!("Couldn't read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_slice(&data).with_context(|| {
        format!(
            "File {} contained invalid TOML or was not a reqecho config",
            path.display()
        )
    })?;
    Ok(config)
}
