//! # gRPC-Web Translation
//!
//! Bridges `application/grpc-web` and `application/grpc-web-text` traffic onto the
//! plain gRPC data plane and back.
//!
//! Inbound, [`wrap_request`] rewrites only the content-type *prefix* (so a
//! `+proto`/`+json` suffix survives), drops the `Content-Length` and, for the text
//! variant, streams the body through a base64 decoder. Outbound, [`wrap_response`]
//! restores the negotiated web content type and layers body adapters from
//! [`body`]: HTTP/2 trailers become the single `0x80`-flagged end-of-stream frame,
//! text responses are base64 encoded per frame, and gzip is applied when the
//! client advertised support for it.
pub mod body;

use crate::BoxError;
use body::{Base64DecodeBody, Base64EncodeBody, GzipBody, TrailerFrameBody};
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRAILER};
use http::{HeaderValue, Request, Response};
use http_body::Body as HttpBody;
use tonic::body::Body;

pub const CONTENT_TYPE_GRPC: &str = "application/grpc";
pub const CONTENT_TYPE_GRPC_WEB: &str = "application/grpc-web";
pub const CONTENT_TYPE_GRPC_WEB_TEXT: &str = "application/grpc-web-text";

/// Per-request translation state, captured from the inbound request so the
/// response can be translated back at the end of the handler.
pub struct WebContext {
    base_content_type: &'static str,
    text: bool,
    gzip: bool,
}

/// Returns true if the request carries a gRPC-Web content type.
pub fn is_grpc_web<B>(request: &Request<B>) -> bool {
    content_type(request.headers()).starts_with(CONTENT_TYPE_GRPC_WEB)
}

/// Rewrites a gRPC-Web request into a plain gRPC request.
pub fn wrap_request<B>(request: Request<B>) -> (Request<Body>, WebContext)
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let raw_content_type = content_type(request.headers()).to_owned();
    let text = raw_content_type.starts_with(CONTENT_TYPE_GRPC_WEB_TEXT);
    let base_content_type = if text {
        CONTENT_TYPE_GRPC_WEB_TEXT
    } else {
        CONTENT_TYPE_GRPC_WEB
    };
    let gzip = request
        .headers()
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"));

    let (mut parts, body) = request.into_parts();

    // Replace just the prefix of the content type, the message format suffix is retained.
    let grpc_content_type = raw_content_type.replacen(base_content_type, CONTENT_TYPE_GRPC, 1);
    parts.headers.insert(
        CONTENT_TYPE,
        HeaderValue::try_from(grpc_content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(CONTENT_TYPE_GRPC)),
    );
    parts.headers.remove(CONTENT_LENGTH);
    parts.version = http::Version::HTTP_2;

    let body = if text {
        Body::new(Base64DecodeBody::new(body))
    } else {
        Body::new(body)
    };

    let context = WebContext {
        base_content_type,
        text,
        gzip,
    };
    (Request::from_parts(parts, body), context)
}

/// Translates a plain gRPC response back into the negotiated gRPC-Web form.
///
/// The body always ends with a trailer frame, even if the inner response carried
/// no trailers.
pub fn wrap_response(response: Response<Body>, context: &WebContext) -> Response<Body> {
    let (mut parts, body) = response.into_parts();

    let current = content_type(&parts.headers);
    if current == CONTENT_TYPE_GRPC || current.starts_with("application/grpc+") {
        let translated = current.replacen(CONTENT_TYPE_GRPC, context.base_content_type, 1);
        if let Ok(value) = HeaderValue::try_from(translated) {
            parts.headers.insert(CONTENT_TYPE, value);
        }
    }
    // Trailers travel in the body frame, the HTTP declaration no longer applies.
    parts.headers.remove(TRAILER);
    parts.headers.remove(CONTENT_LENGTH);
    if context.gzip {
        parts
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }

    let framed = TrailerFrameBody::new(body);
    let body = match (context.text, context.gzip) {
        (true, true) => Body::new(GzipBody::new(Base64EncodeBody::new(framed))),
        (true, false) => Body::new(Base64EncodeBody::new(framed)),
        (false, true) => Body::new(GzipBody::new(framed)),
        (false, false) => Body::new(framed),
    };

    Response::from_parts(parts, body)
}

fn content_type(headers: &http::HeaderMap) -> &str {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}
