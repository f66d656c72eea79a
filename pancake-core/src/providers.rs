//! # Discovery Providers
//!
//! A provider is any long-running task that announces upstream configurations to
//! the proxy. The proxy treats each provider's announcement as the complete set
//! for that provider: absent configs are removed, new configs are added and
//! unchanged configs keep their running watcher. Providers are polymorphic over
//! [`Provider::run`]; the proxy never calls back into them and never interprets
//! the provider name beyond using it as a namespace.
use crate::proxy::{Proxy, UpstreamConfig};
use crate::BoxError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A source of upstream configurations.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Runs the provider until `shutdown` is cancelled.
    ///
    /// Implementations may call [`Proxy::replace_servers`] and
    /// [`Proxy::update_services`] any number of times.
    async fn run(&self, proxy: Proxy, shutdown: CancellationToken) -> Result<(), BoxError>;
}

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Provides a fixed list of upstream servers.
pub struct StaticProvider {
    /// The servers that this provider will provide.
    pub servers: Vec<UpstreamConfig>,
    /// How often service discovery is refreshed. Defaults to 30s.
    pub service_update_interval: Duration,
    /// Overrides the provider name. The default is 'static'.
    pub name: String,
}

impl Default for StaticProvider {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            service_update_interval: DEFAULT_UPDATE_INTERVAL,
            name: "static".to_owned(),
        }
    }
}

#[async_trait]
impl Provider for StaticProvider {
    async fn run(&self, proxy: Proxy, shutdown: CancellationToken) -> Result<(), BoxError> {
        let interval = if self.service_update_interval.is_zero() {
            DEFAULT_UPDATE_INTERVAL
        } else {
            self.service_update_interval
        };

        proxy.replace_servers(&self.name, self.servers.clone());
        proxy.update_services(&self.name);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => proxy.update_services(&self.name),
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }
}

/// Supervises a provider, restarting it whenever its `run` returns.
///
/// Failures are logged and followed by a fixed delay before the next attempt;
/// cancellation stops the restart loop.
pub struct AutoRestarter<P> {
    name: String,
    delay: Duration,
    inner: P,
}

impl<P: Provider> AutoRestarter<P> {
    pub fn new(name: impl Into<String>, delay: Duration, inner: P) -> Self {
        Self {
            name: name.into(),
            delay,
            inner,
        }
    }
}

#[async_trait]
impl<P: Provider> Provider for AutoRestarter<P> {
    async fn run(&self, proxy: Proxy, shutdown: CancellationToken) -> Result<(), BoxError> {
        loop {
            match self.inner.run(proxy.clone(), shutdown.clone()).await {
                Ok(()) => info!(task = %self.name, "task stopped"),
                Err(error) => error!(task = %self.name, error = %error, "task stopped with error"),
            }

            if shutdown.is_cancelled() {
                info!(task = %self.name, "task cancelled");
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.delay) => {}
            }
            info!(task = %self.name, "restarting task");
        }
    }
}
