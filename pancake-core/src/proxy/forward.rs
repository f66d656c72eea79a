//! The request forwarding path.
//!
//! Validates the inbound request shape, translates gRPC-Web when needed,
//! short-circuits the reflection services and streams everything else to an
//! upstream selected from the routing table. Bodies are forwarded frame by
//! frame in both directions; HTTP/2 trailers ride along as body frames, so
//! gRPC status propagation is end-to-end.
use super::reflection::{REFLECTION_V1ALPHA_SERVICE, REFLECTION_V1_SERVICE};
use super::upstream::Upstream;
use super::Proxy;
use crate::grpcweb;
use crate::BoxError;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, TRAILER};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Empty, Full};
use std::convert::Infallible;
use tonic::body::Body;
use tonic::Code;
use tower::ServiceExt;
use tracing::debug;

impl Proxy {
    /// Serves one inbound request.
    ///
    /// This is the HTTP entry point of the proxy; hook it up to a hyper server
    /// with a `service_fn` that clones the proxy per request.
    pub async fn handle_request<B>(&self, request: Request<B>) -> Response<Body>
    where
        B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        if request.method() != Method::POST {
            return plain_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "only POST requests are supported",
            );
        }

        let Some(service) = target_service(request.uri().path()) else {
            return plain_response(StatusCode::BAD_REQUEST, "malformed request url");
        };
        let service = service.to_owned();

        if grpcweb::is_grpc_web(&request) {
            let (request, context) = grpcweb::wrap_request(request);
            let response = self.dispatch(&service, request).await;
            return grpcweb::wrap_response(response, &context);
        }

        self.dispatch(&service, request.map(Body::new)).await
    }

    async fn dispatch(&self, service: &str, request: Request<Body>) -> Response<Body> {
        let mut response = match self.handle_reflection(service, request).await {
            Ok(response) => response,
            Err(request) => match self.find_server(service) {
                Some(upstream) => self.forward_request(request, &upstream).await,
                None => grpc_status_response(Code::Unimplemented, "no server provides the service"),
            },
        };

        response
            .headers_mut()
            .entry(TRAILER)
            .or_insert(HeaderValue::from_static("grpc-status, grpc-message"));
        response
    }

    /// Handles the request if it targets one of the reflection services.
    ///
    /// Hands the request back when the caller should keep handling it.
    async fn handle_reflection(
        &self,
        service: &str,
        request: Request<Body>,
    ) -> Result<Response<Body>, Request<Body>> {
        if service != REFLECTION_V1_SERVICE && service != REFLECTION_V1ALPHA_SERVICE {
            return Err(request);
        }

        if self.shared.disable_reflection {
            return Ok(grpc_status_response(Code::Unimplemented, ""));
        }

        let response = match self.reflection.clone().oneshot(request).await {
            Ok(response) => response,
            Err(_) => grpc_status_response(Code::Internal, "reflection service failed"),
        };
        Ok(response)
    }

    /// Forwards an incoming gRPC request to the specified server.
    async fn forward_request(&self, request: Request<Body>, upstream: &Upstream) -> Response<Body> {
        let response = match upstream.http_client().request(request).await {
            Ok(response) => response,
            Err(error) => {
                debug!(error = %error, "failed to start upstream request");
                // The stream ends without trailers; the client observes an
                // aborted call. The proxy never retries.
                return Response::new(Body::empty());
            }
        };

        let (parts, body) = response.into_parts();
        if parts.status != StatusCode::OK {
            debug!(status = %parts.status, "received bad status from upstream");
            return Response::from_parts(parts, Body::empty());
        }

        Response::from_parts(parts, Body::new(body))
    }
}

/// Returns the name of the service a request path is targeting.
///
/// The path must be `/Service/Method` with exactly one separating slash.
fn target_service(path: &str) -> Option<&str> {
    let path = path.strip_prefix('/')?;
    let (service, method) = path.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some(service)
}

/// Builds a trailers-carrying gRPC response for a locally generated status.
pub(crate) fn grpc_status_response(code: Code, message: &str) -> Response<Body> {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from(code as i32));
    if !message.is_empty() {
        if let Ok(value) = HeaderValue::from_str(message) {
            trailers.insert("grpc-message", value);
        }
    }

    let body = Empty::<Bytes>::new()
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .with_trailers(std::future::ready(Some(Ok(trailers))));

    let mut response = Response::new(Body::new(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    response
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never: Infallible| -> BoxError { match never {} });

    let mut response = Response::new(Body::new(body));
    *response.status_mut() = status;
    response
}
