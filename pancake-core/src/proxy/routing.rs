//! The routing table.
//!
//! Maps fully-qualified gRPC service names to the upstreams currently providing
//! them. Providers mutate the table through [`Proxy::replace_servers`] and
//! watchers through [`Proxy::publish_services`]; every request reads it through
//! [`Proxy::find_server`]. All mutations hold the routing-table write lock, so
//! removal of an upstream never leaves stale references behind.
use super::upstream::{Upstream, UpstreamConfig};
use super::{watcher::ServiceInfo, Proxy, Shared};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One service in the routing table: the upstreams providing it, in provider
/// announcement order, and the round-robin cursor.
#[derive(Default)]
pub(crate) struct Service {
    pub(crate) servers: Vec<Arc<Upstream>>,
    next: AtomicU32,
}

impl Proxy {
    /// Replaces the upstream set of one provider.
    ///
    /// The configs are treated as the provider's complete set: upstreams whose
    /// config is still present are kept running (their watcher and reflection
    /// state survive), removed configs are stopped and scrubbed from every
    /// service, and new configs get a fresh upstream with a watcher spawned
    /// immediately. Other providers' upstreams are not touched.
    pub fn replace_servers(&self, provider: &str, configs: Vec<UpstreamConfig>) {
        info!(provider, count = configs.len(), "replacing servers of provider");

        let mut servers = self.shared.servers.lock().unwrap();
        let mut old_servers = servers.remove(provider).unwrap_or_default();

        let mut new_servers = Vec::with_capacity(configs.len());
        for config in configs {
            if let Some(index) = old_servers
                .iter()
                .position(|server| *server.config() == config)
            {
                new_servers.push(old_servers.swap_remove(index));
            } else {
                let server = Arc::new(Upstream::new(provider.to_owned(), config));
                debug!(address = %server.config().address, "adding server to new server list");
                server.start_watcher(self.clone());
                new_servers.push(server);
            }
        }

        for removed in old_servers {
            self.shared.cleanup_server(&removed);
        }

        servers.insert(provider.to_owned(), new_servers);
    }

    /// Forces every watcher of the given provider to publish a fresh snapshot.
    pub fn update_services(&self, provider: &str) {
        let servers = self.shared.servers.lock().unwrap();
        if let Some(upstreams) = servers.get(provider) {
            for upstream in upstreams {
                upstream.request_refresh();
            }
        }
    }

    /// Finds a server implementing the specified service using round robin load
    /// balancing. Returns `None` for unknown services and for services whose
    /// server list is (transiently) empty.
    pub fn find_server(&self, service: &str) -> Option<Arc<Upstream>> {
        let services = self.shared.services.read().unwrap();
        let service = services.get(service)?;
        if service.servers.is_empty() {
            return None;
        }

        let next = service.next.fetch_add(1, Ordering::Relaxed) as usize;
        Some(Arc::clone(&service.servers[next % service.servers.len()]))
    }

    /// Publishes one upstream's advertised services, replacing its previous
    /// snapshot atomically.
    pub(crate) fn publish_services(&self, upstream: &Arc<Upstream>, info: ServiceInfo) {
        debug!(
            address = %upstream.config().address,
            services = ?info.services,
            "replacing services"
        );

        self.shared.registry.register_files(info.files);

        let mut services = self.shared.services.write().unwrap();

        // A watcher may race its own removal: if the upstream was cleaned up
        // after this snapshot was taken, publishing it would resurrect a stale
        // reference. The cleanup clears the watcher slot before it scrubs, so
        // checking under the routing-table lock is enough.
        if !upstream.watcher_active() {
            debug!(address = %upstream.config().address, "discarding publish from stopped watcher");
            return;
        }

        for service in services.values_mut() {
            service
                .servers
                .retain(|server| !Arc::ptr_eq(server, upstream));
        }

        for name in info.services {
            services
                .entry(name)
                .or_default()
                .servers
                .push(Arc::clone(upstream));
        }
    }
}

impl Shared {
    /// Stops the upstream's watcher and removes it from every service's server
    /// list. Must run whenever a server leaves the active set.
    pub(crate) fn cleanup_server(&self, upstream: &Arc<Upstream>) {
        debug!(address = %upstream.config().address, "cleaning up server");
        upstream.stop_watcher();

        let mut services = self.services.write().unwrap();
        for service in services.values_mut() {
            service
                .servers
                .retain(|server| !Arc::ptr_eq(server, upstream));
        }
    }
}
