//! Configuration of the pancake binary, loaded from a YAML file.
use pancake_core::proxy::UpstreamConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the proxy listens on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Upstream servers announced through the static provider.
    #[serde(default)]
    pub servers: Vec<UpstreamConfig>,

    /// How often the static provider refreshes service discovery.
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub service_update_interval: Duration,

    /// Do not expose the reflection service.
    #[serde(default)]
    pub disable_reflection: bool,

    /// Serve TLS when set; cleartext HTTP/2 otherwise.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM-encoded certificate chain.
    pub cert: PathBuf,
    /// Path to the PEM-encoded private key.
    pub key: PathBuf,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_update_interval() -> Duration {
    Duration::from_secs(30)
}
