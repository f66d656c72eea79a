//! # Reflection Client
//!
//! A client for the gRPC Server Reflection protocol, one per upstream server.
//!
//! The client keeps a single long-lived bidirectional stream open and multiplexes
//! all lookups over it. The protocol carries no correlation ids, so requests are
//! issued strictly one at a time under an internal mutex and responses are matched
//! FIFO: a background task pumps the response stream into a capacity-1 buffer, and
//! a server that sends an unsolicited message poisons the stream.
//!
//! Version negotiation happens at stream-open time: `grpc.reflection.v1` is tried
//! first and `v1alpha` is used as a transparent fallback, with messages converted
//! through [`super::adapter`] so callers only ever see `v1` shapes. Whatever the
//! reason a stream ends, the [`ReflectionClient::disconnected`] token fires exactly
//! once; the next call lazily reconnects.
//!
//! ## References
//!
//! * [gRPC Server Reflection Protocol](https://github.com/grpc/grpc/blob/master/doc/server-reflection.md)
use super::adapter;
use crate::BoxError;
use http_body::Body as HttpBody;
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{client::GrpcService, Status, Streaming};
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient as V1Client;
use tonic_reflection::pb::v1::{
    server_reflection_request::MessageRequest, server_reflection_response::MessageResponse,
    ServerReflectionRequest, ServerReflectionResponse,
};
use tonic_reflection::pb::v1alpha::server_reflection_client::ServerReflectionClient as V1AlphaClient;
use tracing::debug;

/// Errors that can occur while talking to an upstream reflection service.
#[derive(Debug, thiserror::Error)]
pub enum ReflectionClientError {
    #[error(
        "failed to start a stream to the reflection server, reflection might not be supported: '{0}'"
    )]
    StreamInitFailed(#[source] tonic::Status),

    #[error("the reflection stream returned an error status: '{0}'")]
    StreamFailure(#[source] tonic::Status),

    #[error("reflection stream closed unexpectedly")]
    StreamClosed,

    #[error("internal error: failed to send request to stream")]
    SendFailed,

    #[error("server returned reflection error code {code}: {message}")]
    Server { code: i32, message: String },

    #[error("protocol error: received unexpected response type: {0}")]
    UnexpectedResponse(String),

    #[error("failed to decode FileDescriptorProto: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to link file descriptors: {0}")]
    Link(#[from] prost_reflect::DescriptorError),
}

/// A version-neutral client for an upstream's Server Reflection service.
pub struct ReflectionClient<S = Channel> {
    inner: Mutex<Inner<S>>,
    disconnected: StdMutex<CancellationToken>,
}

struct Inner<S> {
    v1: V1Client<S>,
    v1alpha: V1AlphaClient<S>,
    stream: Option<ActiveStream>,
}

struct ActiveStream {
    requests: mpsc::Sender<ServerReflectionRequest>,
    responses: mpsc::Receiver<Result<ServerReflectionResponse, Status>>,
    token: CancellationToken,
}

impl<S> ReflectionClient<S>
where
    S: GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    /// Creates a new `ReflectionClient` using the provided gRPC service (e.g., a `Channel`).
    ///
    /// No stream is opened until the first request.
    pub fn new(channel: S) -> Self {
        // Until the first stream opens, the client counts as disconnected.
        let token = CancellationToken::new();
        token.cancel();

        Self {
            inner: Mutex::new(Inner {
                v1: V1Client::new(channel.clone()),
                v1alpha: V1AlphaClient::new(channel),
                stream: None,
            }),
            disconnected: StdMutex::new(token),
        }
    }

    /// Returns true while the client has an open stream to the server.
    pub fn connected(&self) -> bool {
        !self.disconnected.lock().unwrap().is_cancelled()
    }

    /// Returns a token that is cancelled when the underlying stream disconnects.
    ///
    /// If no stream has been opened yet, the returned token is already cancelled.
    pub fn disconnected(&self) -> CancellationToken {
        self.disconnected.lock().unwrap().clone()
    }

    /// Lists all services exposed by the server.
    pub async fn list_services(&self) -> Result<Vec<String>, ReflectionClientError> {
        let mut inner = self.inner.lock().await;
        let response = self
            .round_trip(&mut inner, MessageRequest::ListServices(String::new()))
            .await?;

        match response {
            MessageResponse::ListServicesResponse(services) => {
                Ok(services.service.into_iter().map(|s| s.name).collect())
            }
            MessageResponse::ErrorResponse(error) => Err(ReflectionClientError::Server {
                code: error.error_code,
                message: error.error_message,
            }),
            other => Err(ReflectionClientError::UnexpectedResponse(format!(
                "{other:?}"
            ))),
        }
    }

    /// Fetches every file the server returns for the given symbol, decoded and linked.
    ///
    /// The response of a well-behaved server contains the declaring file along with
    /// its transitive dependencies; linking through a [`DescriptorPool`] tolerates
    /// imports between files of the same batch and rejects batches with dangling
    /// imports.
    pub async fn all_files_for_symbol(
        &self,
        full_name: &str,
    ) -> Result<Vec<FileDescriptorProto>, ReflectionClientError> {
        let mut inner = self.inner.lock().await;
        let response = self
            .round_trip(
                &mut inner,
                MessageRequest::FileContainingSymbol(full_name.to_owned()),
            )
            .await?;
        drop(inner);

        let encoded = match response {
            MessageResponse::FileDescriptorResponse(files) => files.file_descriptor_proto,
            MessageResponse::ErrorResponse(error) => {
                return Err(ReflectionClientError::Server {
                    code: error.error_code,
                    message: error.error_message,
                })
            }
            other => {
                return Err(ReflectionClientError::UnexpectedResponse(format!(
                    "{other:?}"
                )))
            }
        };

        let mut files = Vec::with_capacity(encoded.len());
        for raw in encoded {
            files.push(FileDescriptorProto::decode(raw.as_slice())?);
        }

        DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
            file: files.clone(),
        })?;

        Ok(files)
    }

    /// Sends one request over the shared stream and waits for its single response.
    ///
    /// Any stream-level failure closes the disconnect token and clears the stream
    /// handle, so the next call reconnects.
    async fn round_trip(
        &self,
        inner: &mut Inner<S>,
        request: MessageRequest,
    ) -> Result<MessageResponse, ReflectionClientError> {
        self.ensure_stream(inner).await?;

        let outcome = async {
            let stream = inner
                .stream
                .as_mut()
                .ok_or(ReflectionClientError::StreamClosed)?;

            let message = ServerReflectionRequest {
                host: String::new(),
                message_request: Some(request),
            };
            stream
                .requests
                .send(message)
                .await
                .map_err(|_| ReflectionClientError::SendFailed)?;

            match stream.responses.recv().await {
                Some(Ok(response)) => response.message_response.ok_or_else(|| {
                    ReflectionClientError::UnexpectedResponse("empty message".to_owned())
                }),
                Some(Err(status)) => Err(ReflectionClientError::StreamFailure(status)),
                None => Err(ReflectionClientError::StreamClosed),
            }
        }
        .await;

        if outcome.is_err() {
            if let Some(stream) = inner.stream.take() {
                stream.token.cancel();
            }
        }

        outcome
    }

    /// Opens a stream if none is active, trying v1 first and falling back to v1alpha.
    async fn ensure_stream(&self, inner: &mut Inner<S>) -> Result<(), ReflectionClientError> {
        if let Some(stream) = &inner.stream {
            if !stream.token.is_cancelled() {
                return Ok(());
            }
            // The pump ended the stream since the last call, reconnect below.
            inner.stream = None;
        }

        let token = CancellationToken::new();

        let (requests, outbound) = mpsc::channel(4);
        let (results, responses) = mpsc::channel(1);
        let stream = match inner
            .v1
            .server_reflection_info(ReceiverStream::new(outbound))
            .await
        {
            Ok(response) => {
                spawn_pump(response.into_inner(), results, token.clone(), |msg| msg);
                ActiveStream {
                    requests,
                    responses,
                    token: token.clone(),
                }
            }
            Err(status) => {
                debug!(%status, "reflection v1 unavailable, falling back to v1alpha");

                let (requests, outbound) = mpsc::channel(4);
                let (results, responses) = mpsc::channel(1);
                let alpha_requests =
                    ReceiverStream::new(outbound).map(adapter::request_to_v1alpha);
                let response = inner
                    .v1alpha
                    .server_reflection_info(alpha_requests)
                    .await
                    .map_err(ReflectionClientError::StreamInitFailed)?;
                spawn_pump(
                    response.into_inner(),
                    results,
                    token.clone(),
                    adapter::response_to_v1,
                );
                ActiveStream {
                    requests,
                    responses,
                    token: token.clone(),
                }
            }
        };

        inner.stream = Some(stream);
        *self.disconnected.lock().unwrap() = token;
        Ok(())
    }
}

/// Reads the response stream into the capacity-1 result buffer.
///
/// The buffer mirrors the strict request/response pairing of the protocol: if a
/// second message arrives before the first was consumed, the stream is poisoned
/// and the disconnect token fires.
fn spawn_pump<T, F>(
    mut stream: Streaming<T>,
    results: mpsc::Sender<Result<ServerReflectionResponse, Status>>,
    token: CancellationToken,
    convert: F,
) where
    T: Send + 'static,
    F: Fn(T) -> ServerReflectionResponse + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match stream.message().await {
                Ok(Some(message)) => {
                    if results.try_send(Ok(convert(message))).is_err() {
                        token.cancel();
                        return;
                    }
                }
                Ok(None) => {
                    let _ = results.try_send(Err(Status::aborted("reflection stream closed")));
                    token.cancel();
                    return;
                }
                Err(status) => {
                    let _ = results.try_send(Err(status));
                    token.cancel();
                    return;
                }
            }
        }
    });
}
