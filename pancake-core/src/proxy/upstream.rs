//! Upstream servers and their transports.
//!
//! Each [`Upstream`] owns exactly one HTTP/2 client, built once from its
//! [`UpstreamConfig`]: cleartext HTTP/2 with prior knowledge when `plaintext` is
//! set, TLS otherwise (optionally skipping certificate verification). The same
//! client carries both the forwarded data plane and, through the origin-rewriting
//! [`H2Client`] service, the reflection control plane.
use super::{watcher, Proxy};
use crate::reflection::client::ReflectionClient;
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tracing::debug;

/// Connection settings for one upstream server.
///
/// Two configs are equal iff all fields match; providers rely on this to decide
/// which upstreams survive a [`Proxy::replace_servers`] call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// The `host:port` of the upstream server.
    pub address: String,
    /// Use cleartext HTTP/2 instead of TLS.
    #[serde(default)]
    pub plaintext: bool,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// One upstream gRPC server known to the proxy.
///
/// Created when a provider announces a new config and dropped when that config
/// disappears from the provider's next announcement. Identity (not config
/// equality) ties routing-table entries to their upstream.
pub struct Upstream {
    config: UpstreamConfig,
    provider: String,
    http_client: H2Client,
    reflection: OnceLock<ReflectionClient<H2Client>>,
    watcher: Mutex<Option<CancellationToken>>,
    refresh: Notify,
}

impl Upstream {
    pub(crate) fn new(provider: String, config: UpstreamConfig) -> Self {
        let http_client = H2Client::new(&config);
        Self {
            config,
            provider,
            http_client,
            reflection: OnceLock::new(),
            watcher: Mutex::new(None),
            refresh: Notify::new(),
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub(crate) fn http_client(&self) -> &H2Client {
        &self.http_client
    }

    /// Returns the reflection client for this server, creating it on first use.
    pub(crate) fn reflect_client(&self) -> &ReflectionClient<H2Client> {
        self.reflection.get_or_init(|| {
            debug!(address = %self.config.address, "creating new reflection client");
            ReflectionClient::new(self.http_client.clone())
        })
    }

    /// Spawns the service watcher for this upstream. At most one watcher runs at
    /// a time; starting an already-watched upstream is a no-op.
    pub(crate) fn start_watcher(self: &Arc<Self>, proxy: Proxy) {
        let mut slot = self.watcher.lock().unwrap();
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        tokio::spawn(watcher::watch_services(Arc::clone(self), proxy, cancel));
    }

    pub(crate) fn stop_watcher(&self) {
        if let Some(cancel) = self.watcher.lock().unwrap().take() {
            cancel.cancel();
        }
    }

    /// True while a watcher owns this upstream. Publishes from a watcher that
    /// has been stopped must be discarded.
    pub(crate) fn watcher_active(&self) -> bool {
        self.watcher.lock().unwrap().is_some()
    }

    /// Asks the watcher to publish a fresh service snapshot.
    pub(crate) fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub(crate) async fn refresh_requested(&self) {
        self.refresh.notified().await;
    }
}

/// The reusable HTTP/2 client of one upstream.
///
/// Requests carry only a path; the scheme and authority of the upstream are
/// grafted on per call. Implements [`tower::Service`] so the tonic-generated
/// reflection clients can drive it directly.
#[derive(Clone)]
pub(crate) struct H2Client {
    inner: Client<HttpsConnector<HttpConnector>, Body>,
    scheme: &'static str,
    authority: String,
}

impl H2Client {
    fn new(config: &UpstreamConfig) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(client_tls_config(config.insecure_skip_verify))
            .https_or_http()
            .enable_http2()
            .build();

        let inner = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build(connector);

        Self {
            inner,
            scheme: if config.plaintext { "http" } else { "https" },
            authority: config.address.clone(),
        }
    }

    pub(crate) async fn request(
        &self,
        mut request: Request<Body>,
    ) -> Result<Response<Incoming>, crate::BoxError> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = Uri::try_from(format!("{}://{}{}", self.scheme, self.authority, path_and_query))?;

        *request.uri_mut() = uri;
        *request.version_mut() = http::Version::HTTP_2;
        request.headers_mut().remove(http::header::HOST);

        Ok(self.inner.request(request).await?)
    }
}

impl tower::Service<Request<Body>> for H2Client {
    type Response = Response<Incoming>;
    type Error = crate::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.request(request).await })
    }
}

fn client_tls_config(insecure_skip_verify: bool) -> rustls::ClientConfig {
    let config = if insecure_skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Certificate verifier for upstreams with `insecure_skip_verify` set.
    /// Accepts any server certificate but still verifies handshake signatures.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
