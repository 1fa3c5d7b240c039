use crate::auth::token::TokenEntry;
use miette::{IntoDiagnostic, WrapErr};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xdg::BaseDirectories;

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerConfig {
    /// Where clouds, user data and credentials are persisted.
    pub store: StoreConfig,
    /// Configuration of OpenStack sessions.
    #[serde(default)]
    pub openstack: OpenstackConfig,
    /// Configuration of the HTTP server.
    pub server: ServerConfig,
    /// Bearer tokens and what they may do.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Configuration of logging.
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON document holding every cloud and template.
    pub clouds_file: PathBuf,
    /// Directory with one file per user-data entry.
    pub user_data_dir: PathBuf,
    /// JSON file holding SSH credentials records.
    pub credentials_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenstackConfig {
    /// Cached sessions unused for this long are dropped.
    #[serde(with = "humantime_serde", default = "default_client_ttl")]
    pub client_ttl: Duration,
    /// Timeout of individual OpenStack API requests.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Interval between checks of a booting server.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
}
fn default_client_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}
impl Default for OpenstackConfig {
    fn default() -> Self {
        Self {
            client_ttl: default_client_ttl(),
            request_timeout: default_request_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind to.
    pub bind_address: SocketAddr,
    /// Optional TLS mode for testing only.
    pub testing_only_tls_config: Option<TestingOnlyTlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestingOnlyTlsConfig {
    /// Public key (for TLS).
    pub cert: PathBuf,
    /// Private key (for TLS).
    pub key: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: Option<String>,
}

/// Resolve the configuration file: `path` if given and present, otherwise `config.toml` in the
/// XDG configuration directories.
pub fn find_configuration(
    path: Option<&Path>,
    xdg_basedirs: &BaseDirectories,
) -> miette::Result<PathBuf> {
    path.and_then(|p| {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            tracing::warn!(
                "Specified configuration file '{}' does not exist",
                p.display()
            );
            None
        }
    })
    .ok_or(())
    .or_else(|()| {
        tracing::warn!(
            "Searching for cml_provisioner/config.toml in XDG configuration directories."
        );
        xdg_basedirs
            .find_config_file("config.toml")
            .ok_or(miette::miette!(
                "couldn't find path to 'config.toml' in XDG config dirs"
            ))
    })
}

/// Load the provisioner configuration.
pub fn load_configuration(
    path: Option<&Path>,
    xdg_basedirs: &BaseDirectories,
) -> miette::Result<ProvisionerConfig> {
    let path = find_configuration(path, xdg_basedirs)?;

    use figment::providers::{self, Format};
    figment::Figment::new()
        .merge(providers::Toml::file(&path))
        .merge(providers::Env::prefixed("CML_").split("__"))
        .extract()
        .into_diagnostic()
        .wrap_err("Failed to extract provisioner configuration")
}
