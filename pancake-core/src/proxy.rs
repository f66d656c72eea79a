//! # The Proxy
//!
//! The proxy accepts gRPC and gRPC-Web requests on one endpoint and forwards each
//! call to an upstream server that implements the requested service. Upstream
//! sets are pushed in by [`crate::providers`]; which services each upstream
//! provides is discovered through gRPC Server Reflection by a per-upstream
//! [`watcher`] task and recorded in the routing table. The proxy also serves the
//! reflection protocol itself, answering from the union of every upstream's
//! descriptors.
mod forward;
mod reflection;
mod routing;
pub mod upstream;
mod watcher;

pub use upstream::{Upstream, UpstreamConfig};

use crate::reflection::registry::DescriptorRegistry;
use reflection::{ReflectionService, ReflectionServiceAlpha};
use routing::Service;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tonic::service::Routes;
use tonic_reflection::server::{v1, v1alpha};

/// Settings of the proxy core.
///
/// Everything else (bind addresses, TLS material, the upstream list itself)
/// belongs to the configuration of the binary and the providers.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Do not expose the reflection service; requests to it return
    /// `UNIMPLEMENTED`.
    pub disable_reflection: bool,
    /// How long watchers wait before retrying after a discovery failure or a
    /// lost reflection stream.
    pub retry_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            disable_reflection: false,
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// State shared between the proxy handle, its watchers and the reflection
/// services.
pub(crate) struct Shared {
    pub(crate) services: RwLock<HashMap<String, Service>>,
    pub(crate) servers: Mutex<HashMap<String, Vec<Arc<Upstream>>>>,
    pub(crate) registry: DescriptorRegistry,
    pub(crate) disable_reflection: bool,
    pub(crate) retry_interval: Duration,
}

/// The proxy handle. Cheap to clone; all clones share one routing table and
/// descriptor registry.
#[derive(Clone)]
pub struct Proxy {
    pub(crate) shared: Arc<Shared>,
    reflection: Routes,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        let shared = Arc::new(Shared {
            services: RwLock::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            registry: DescriptorRegistry::default(),
            disable_reflection: config.disable_reflection,
            retry_interval: config.retry_interval,
        });

        let reflection = Routes::new(v1::ServerReflectionServer::new(ReflectionService::new(
            Arc::clone(&shared),
        )))
        .add_service(v1alpha::ServerReflectionServer::new(
            ReflectionServiceAlpha::new(Arc::clone(&shared)),
        ));

        Self { shared, reflection }
    }

    /// The registry holding every descriptor learned from every upstream.
    pub fn registry(&self) -> &DescriptorRegistry {
        &self.shared.registry
    }

    pub(crate) fn retry_interval(&self) -> Duration {
        self.shared.retry_interval
    }
}
