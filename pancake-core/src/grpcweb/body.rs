//! Streaming body adapters for the gRPC-Web bridge.
//!
//! Each adapter wraps an inner [`http_body::Body`] and rewrites its frames on the
//! fly, so responses stream through the proxy without per-request buffering.
use crate::BoxError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::HeaderMap;
use http_body::{Body, Frame};
use std::io::Write;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// The frame flag marking a gRPC-Web trailer frame.
pub const TRAILER_FRAME_FLAG: u8 = 0b1000_0000;

/// Serializes trailers into a length-prefixed gRPC-Web trailer frame.
///
/// The payload is the HTTP/1.1 header block form, `name: value\r\n` per entry.
pub fn encode_trailer_frame(trailers: &HeaderMap) -> Bytes {
    let mut block = Vec::new();
    for (name, value) in trailers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }

    let mut frame = Vec::with_capacity(5 + block.len());
    frame.push(TRAILER_FRAME_FLAG);
    frame.extend_from_slice(&(block.len() as u32).to_be_bytes());
    frame.extend_from_slice(&block);
    frame.into()
}

/// Turns HTTP/2 trailers into the gRPC-Web end-of-stream trailer frame.
///
/// Data frames pass through untouched. When the inner body ends, a trailer frame
/// is emitted exactly once, empty if the inner body produced no trailers.
pub struct TrailerFrameBody<B> {
    inner: B,
    finished: bool,
}

impl<B> TrailerFrameBody<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            finished: false,
        }
    }
}

impl<B> Body for TrailerFrameBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if frame.is_data() {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                    if let Ok(trailers) = frame.into_trailers() {
                        this.finished = true;
                        return Poll::Ready(Some(Ok(Frame::data(encode_trailer_frame(
                            &trailers,
                        )))));
                    }
                }
                Some(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                None => {
                    this.finished = true;
                    return Poll::Ready(Some(Ok(Frame::data(encode_trailer_frame(
                        &HeaderMap::new(),
                    )))));
                }
            }
        }
    }
}

/// Base64-encodes every data frame for the `grpc-web-text` variant.
///
/// Each frame is encoded and padded individually; the text protocol requires
/// every flushed chunk to be independently decodable.
pub struct Base64EncodeBody<B> {
    inner: B,
}

impl<B> Base64EncodeBody<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

impl<B> Body for Base64EncodeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        if data.is_empty() {
                            continue;
                        }
                        let encoded = STANDARD.encode(&data);
                        return Poll::Ready(Some(Ok(Frame::data(Bytes::from(encoded)))));
                    }
                }
                Some(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                None => return Poll::Ready(None),
            }
        }
    }
}

/// Streaming base64 decoder for `grpc-web-text` request bodies.
///
/// Frame boundaries are not group boundaries, so undecodable remainders carry
/// over to the next frame. Concatenated padded segments, as produced by clients
/// that encode each flush independently, decode group by group.
pub struct Base64DecodeBody<B> {
    inner: B,
    carry: Vec<u8>,
}

impl<B> Base64DecodeBody<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            carry: Vec::new(),
        }
    }
}

impl<B> Body for Base64DecodeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        this.carry
                            .extend(data.iter().copied().filter(|b| !b.is_ascii_whitespace()));
                        match decode_complete_groups(&mut this.carry) {
                            Ok(decoded) if decoded.is_empty() => continue,
                            Ok(decoded) => return Poll::Ready(Some(Ok(Frame::data(decoded)))),
                            Err(error) => return Poll::Ready(Some(Err(Box::new(error)))),
                        }
                    }
                    Err(frame) => return Poll::Ready(Some(Ok(frame))),
                },
                Some(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                None => {
                    if !this.carry.is_empty() {
                        return Poll::Ready(Some(Err("truncated base64 request body".into())));
                    }
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Decodes all complete 4-character groups in `carry`, leaving the remainder.
///
/// Groups are decoded one at a time so that mid-stream padding (a new base64
/// segment starting right after a padded one) is accepted.
fn decode_complete_groups(carry: &mut Vec<u8>) -> Result<Bytes, base64::DecodeError> {
    let complete = carry.len() - carry.len() % 4;
    if complete == 0 {
        return Ok(Bytes::new());
    }

    let mut decoded = Vec::with_capacity(complete / 4 * 3);
    for group in carry[..complete].chunks(4) {
        decoded.extend_from_slice(&STANDARD.decode(group)?);
    }
    carry.drain(..complete);
    Ok(decoded.into())
}

/// Gzip-compresses the byte stream, flushing the encoder after every frame so
/// that streamed responses stay incremental.
pub struct GzipBody<B> {
    inner: B,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl<B> GzipBody<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            encoder: Some(GzEncoder::new(Vec::new(), Compression::default())),
        }
    }
}

impl<B> Body for GzipBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    let Some(encoder) = this.encoder.as_mut() else {
                        continue;
                    };
                    let compressed = encoder
                        .write_all(&data)
                        .and_then(|()| encoder.flush())
                        .map(|()| std::mem::take(encoder.get_mut()));
                    match compressed {
                        Ok(compressed) if compressed.is_empty() => continue,
                        Ok(compressed) => {
                            return Poll::Ready(Some(Ok(Frame::data(compressed.into()))))
                        }
                        Err(error) => return Poll::Ready(Some(Err(Box::new(error)))),
                    }
                }
                Some(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                None => {
                    let Some(encoder) = this.encoder.take() else {
                        return Poll::Ready(None);
                    };
                    return match encoder.finish() {
                        Ok(tail) if tail.is_empty() => Poll::Ready(None),
                        Ok(tail) => Poll::Ready(Some(Ok(Frame::data(tail.into())))),
                        Err(error) => Poll::Ready(Some(Err(Box::new(error)))),
                    };
                }
            }
        }
    }
}
