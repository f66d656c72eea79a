//! # Pancake
//!
//! The pancake proxy binary. It loads the YAML configuration, wires the static
//! provider into the proxy core and serves gRPC / gRPC-Web traffic on a single
//! listener, with TLS when configured and cleartext HTTP/2 otherwise.
mod config;

use anyhow::Context;
use clap::Parser;
use config::{ServerConfig, TlsConfig};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use pancake_core::providers::{AutoRestarter, Provider, StaticProvider};
use pancake_core::proxy::{Proxy, ProxyConfig};
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const PROVIDER_RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "pancake", version, about = "An aggregating gRPC reverse proxy")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short = 'c', default_value = "pancake.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read config file {}", args.config.display()))?;
    let config: ServerConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", args.config.display()))?;

    let proxy = Proxy::new(ProxyConfig {
        disable_reflection: config.disable_reflection,
        ..ProxyConfig::default()
    });

    let shutdown = CancellationToken::new();
    let provider = AutoRestarter::new(
        "static",
        PROVIDER_RESTART_DELAY,
        StaticProvider {
            servers: config.servers.clone(),
            service_update_interval: config.service_update_interval,
            ..StaticProvider::default()
        },
    );
    tokio::spawn({
        let proxy = proxy.clone();
        let shutdown = shutdown.clone();
        async move {
            let _ = provider.run(proxy, shutdown).await;
        }
    });

    let acceptor = config
        .tls
        .as_ref()
        .map(tls_acceptor)
        .transpose()
        .context("failed to set up TLS")?;

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    info!(address = %config.bind_address, tls = acceptor.is_some(), "starting proxy");

    loop {
        let (stream, peer) = listener.accept().await?;
        let proxy = proxy.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let proxy = proxy.clone();
                async move { Ok::<_, Infallible>(proxy.handle_request(request).await) }
            });

            let server = auto::Builder::new(TokioExecutor::new());
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => server.serve_connection(TokioIo::new(tls_stream), service).await,
                    Err(error) => {
                        debug!(%peer, error = %error, "tls handshake failed");
                        return;
                    }
                },
                None => server.serve_connection(TokioIo::new(stream), service).await,
            };

            if let Err(error) = result {
                debug!(%peer, error = %error, "connection closed with error");
            }
        });
    }
}

fn tls_acceptor(tls: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&tls.cert).with_context(|| format!("failed to open {}", tls.cert.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("failed to read certificate chain")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&tls.key).with_context(|| format!("failed to open {}", tls.key.display()))?,
    ))
    .context("failed to read private key")?
    .context("no private key found")?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate or key")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
