//! Shared fixtures for the integration tests: hand-built file descriptors, an
//! in-process echo service speaking raw gRPC framing, and helpers to drive the
//! proxy handler with framed messages.
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use pancake_core::proxy::Proxy;
use prost::Message;
use prost_types::{
    FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto, ServiceDescriptorProto,
};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::{ServerReflectionRequest, ServerReflectionResponse};

pub const GRPC_MAX_WAIT: Duration = Duration::from_secs(10);

// --- Descriptor fixtures ---

/// A file declaring a single service with a `Ping` method.
pub fn service_file(path: &str, package: &str, service: &str, deps: &[&str]) -> FileDescriptorProto {
    let request_type = format!(".{package}.PingRequest");
    FileDescriptorProto {
        name: Some(path.to_owned()),
        package: Some(package.to_owned()),
        syntax: Some("proto3".to_owned()),
        dependency: deps.iter().map(|d| (*d).to_owned()).collect(),
        message_type: vec![prost_types::DescriptorProto {
            name: Some("PingRequest".to_owned()),
            ..Default::default()
        }],
        service: vec![ServiceDescriptorProto {
            name: Some(service.to_owned()),
            method: vec![MethodDescriptorProto {
                name: Some("Ping".to_owned()),
                input_type: Some(request_type.clone()),
                output_type: Some(request_type),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn plain_file(path: &str, package: &str) -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some(path.to_owned()),
        package: Some(package.to_owned()),
        syntax: Some("proto3".to_owned()),
        ..Default::default()
    }
}

pub fn fd_set(files: Vec<FileDescriptorProto>) -> FileDescriptorSet {
    FileDescriptorSet { file: files }
}

// --- gRPC framing helpers ---

/// Length-prefixes an encoded protobuf message as an uncompressed gRPC frame.
pub fn grpc_frame(message: &impl Message) -> Bytes {
    let encoded = message.encode_to_vec();
    let mut frame = Vec::with_capacity(5 + encoded.len());
    frame.push(0);
    frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    frame.extend_from_slice(&encoded);
    frame.into()
}

/// Decodes a stream of concatenated padded base64 segments, as produced by the
/// proxy's per-frame text encoding.
pub fn decode_base64_groups(bytes: &[u8]) -> Vec<u8> {
    assert_eq!(bytes.len() % 4, 0, "base64 body is not padded to groups");
    let mut decoded = Vec::new();
    for group in bytes.chunks(4) {
        decoded.extend_from_slice(&STANDARD.decode(group).expect("invalid base64 group"));
    }
    decoded
}

/// Splits a byte stream into (flag, payload) gRPC frames.
pub fn split_frames(mut bytes: &[u8]) -> Vec<(u8, Bytes)> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let flag = bytes[0];
        let length = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        frames.push((flag, Bytes::copy_from_slice(&bytes[5..5 + length])));
        bytes = &bytes[5 + length..];
    }
    frames
}

/// Builds a gRPC POST request carrying the given frames.
pub fn grpc_request(path: &str, body: Bytes) -> Request<Full<Bytes>> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/grpc")
        .body(Full::new(body))
        .unwrap()
}

/// Collects a proxy response into (headers, body bytes, trailers).
pub async fn collect_response(response: Response<Body>) -> (http::HeaderMap, Bytes, HeaderMap) {
    let (parts, body) = response.into_parts();
    let collected = body.collect().await.expect("response body failed");
    let trailers = collected.trailers().cloned().unwrap_or_default();
    (parts.headers, collected.to_bytes(), trailers)
}

/// Sends a batch of reflection requests over one stream through the proxy
/// handler and returns the decoded responses.
pub async fn reflect(proxy: &Proxy, requests: Vec<MessageRequest>) -> Vec<ServerReflectionResponse> {
    let mut body = Vec::new();
    for request in requests {
        let message = ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        };
        body.extend_from_slice(&grpc_frame(&message));
    }

    let request = grpc_request(
        "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo",
        body.into(),
    );
    let (_headers, bytes, trailers) = collect_response(proxy.handle_request(request).await).await;
    assert_eq!(
        trailers.get("grpc-status").map(|v| v.to_str().unwrap()),
        Some("0"),
        "reflection stream failed: {trailers:?}"
    );

    split_frames(&bytes)
        .into_iter()
        .map(|(flag, payload)| {
            assert_eq!(flag, 0, "unexpected compressed frame");
            ServerReflectionResponse::decode(payload).expect("invalid reflection response")
        })
        .collect()
}

/// Polls `condition` until it holds or the timeout expires.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + GRPC_MAX_WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// --- In-process upstream services ---

/// A raw gRPC service that echoes every request frame back and tags responses
/// with an `echo-server` header, so tests can tell upstreams apart.
pub struct EchoService<N> {
    id: &'static str,
    _name: std::marker::PhantomData<N>,
}

impl<N> Clone for EchoService<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            _name: std::marker::PhantomData,
        }
    }
}

impl<N> EchoService<N> {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            _name: std::marker::PhantomData,
        }
    }
}

impl<N: Send + Sync + 'static> tower::Service<Request<Body>> for EchoService<N> {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let id = self.id;
        Box::pin(async move {
            // Mirror the request content type so tests can observe what the
            // proxy forwarded upstream.
            let content_type = request
                .headers()
                .get(CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("application/grpc"));
            let payload = match request.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => Bytes::new(),
            };

            let mut trailers = HeaderMap::new();
            trailers.insert("grpc-status", HeaderValue::from_static("0"));
            let body = Full::new(payload)
                .map_err(|never: Infallible| -> tonic::Status { match never {} })
                .with_trailers(std::future::ready(Some(Ok(trailers))));

            let response = Response::builder()
                .header(CONTENT_TYPE, content_type)
                .header("echo-server", id)
                .body(Body::new(body))
                .unwrap();
            Ok(response)
        })
    }
}

pub struct SvcAName;
pub struct SvcBName;
pub struct SvcXName;

impl NamedService for EchoService<SvcAName> {
    const NAME: &'static str = "svc.a.Echo";
}
impl NamedService for EchoService<SvcBName> {
    const NAME: &'static str = "svc.b.Echo";
}
impl NamedService for EchoService<SvcXName> {
    const NAME: &'static str = "svc.x.Echo";
}

/// An upstream running in this process behind a real socket.
pub struct TestUpstream {
    pub address: String,
    handle: JoinHandle<()>,
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns an upstream gRPC server exposing reflection for `set` on an
/// ephemeral port.
pub async fn spawn_upstream(set: FileDescriptorSet, id: &'static str) -> TestUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    spawn_upstream_on(listener, set, id).await
}

/// Spawns an upstream gRPC server on the given listener: reflection for `set`
/// plus the echo services, all tagged with `id`.
///
/// Which services the proxy discovers is controlled entirely by `set`; the echo
/// services are only there to answer forwarded calls. Connections are served
/// from one task so that dropping the returned handle also severs every open
/// stream, which is how tests simulate an upstream going away.
pub async fn spawn_upstream_on(
    listener: TcpListener,
    set: FileDescriptorSet,
    id: &'static str,
) -> TestUpstream {
    let address = listener.local_addr().unwrap().to_string();
    let reflection = tonic_reflection::server::Builder::configure()
        .register_file_descriptor_set(set)
        .build_v1()
        .expect("failed to build reflection service");

    let routes = tonic::service::Routes::new(reflection)
        .add_service(EchoService::<SvcAName>::new(id))
        .add_service(EchoService::<SvcBName>::new(id))
        .add_service(EchoService::<SvcXName>::new(id));

    let handle = tokio::spawn(async move {
        let mut connections = tokio::task::JoinSet::new();
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let routes = routes.clone();
            connections.spawn(async move {
                let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                    let routes = routes.clone();
                    async move {
                        tower::ServiceExt::oneshot(routes, request.map(Body::new)).await
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestUpstream { address, handle }
}

/// Rebinds a listener on an address that was just released.
pub async fn rebind(address: &str) -> TcpListener {
    let deadline = tokio::time::Instant::now() + GRPC_MAX_WAIT;
    loop {
        match TcpListener::bind(address).await {
            Ok(listener) => return listener,
            Err(error) => {
                if tokio::time::Instant::now() > deadline {
                    panic!("failed to rebind {address}: {error}");
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }
}
