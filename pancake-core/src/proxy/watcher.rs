//! The per-upstream service watcher.
//!
//! One task per upstream keeps the routing table and the descriptor registry in
//! sync with that upstream's advertised services. The watcher publishes a full
//! snapshot, then blocks until the reflection stream disconnects (retry after
//! the configured interval), a refresh is requested, or the watcher is
//! cancelled.
use super::upstream::Upstream;
use super::Proxy;
use crate::reflection::client::ReflectionClientError;
use prost_types::FileDescriptorProto;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One upstream's advertised services and the descriptors backing them.
pub(crate) struct ServiceInfo {
    pub(crate) services: Vec<String>,
    pub(crate) files: Vec<FileDescriptorProto>,
}

impl Upstream {
    /// Queries the upstream for its services and their file descriptors.
    ///
    /// A service whose descriptors cannot be resolved is logged and still
    /// included in the service list, so that routing works even when reflection
    /// data is incomplete. Files are deduplicated by path across services.
    pub(crate) async fn service_info(&self) -> Result<ServiceInfo, ReflectionClientError> {
        let client = self.reflect_client();
        let services = client.list_services().await?;

        let mut files = Vec::new();
        let mut seen = HashSet::new();
        for service in &services {
            match client.all_files_for_symbol(service).await {
                Ok(batch) => {
                    for file in batch {
                        if seen.insert(file.name().to_owned()) {
                            files.push(file);
                        }
                    }
                }
                Err(error) => {
                    warn!(service_name = %service, error = %error, "failed to resolve service");
                }
            }
        }

        Ok(ServiceInfo { services, files })
    }
}

pub(crate) async fn watch_services(
    upstream: Arc<Upstream>,
    proxy: Proxy,
    cancel: CancellationToken,
) {
    let address = upstream.config().address.clone();
    debug!(upstream_host = %address, "service watcher started");
    let retry_interval = proxy.retry_interval();

    loop {
        let info = loop {
            match upstream.service_info().await {
                Ok(info) => break info,
                Err(error) => {
                    error!(upstream_host = %address, error = %error, "failed to get service info");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(upstream_host = %address, "service watcher stopped");
                            return;
                        }
                        _ = tokio::time::sleep(retry_interval) => {}
                    }
                }
            }
        };

        // Grab the disconnect signal of the stream that produced this snapshot
        // before publishing, so a disconnect in between is not missed.
        let disconnected = upstream.reflect_client().disconnected();
        proxy.publish_services(&upstream, info);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = upstream.refresh_requested() => {
                debug!(upstream_host = %address, "service refresh requested");
            }
            _ = disconnected.cancelled() => {
                debug!(upstream_host = %address, "lost connection to server");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_interval) => {}
                }
                info!(upstream_host = %address, "refreshing service info");
            }
        }
    }

    debug!(upstream_host = %address, "service watcher stopped");
}
