//! The aggregated reflection server.
//!
//! Serves `grpc.reflection.v1.ServerReflection` (and `v1alpha` through the
//! message adapter) on top of the routing table and the descriptor registry, so
//! clients see one virtual server whose descriptor set is the union of all
//! upstreams. Failures travel in-band as `ErrorResponse` messages; a registry
//! miss maps to `NOT_FOUND` and an unrecognized request variant to
//! `UNIMPLEMENTED`.
use super::Shared;
use crate::reflection::adapter;
use crate::reflection::registry::NotFound;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming};
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::{
    ErrorResponse, ExtensionNumberResponse, ExtensionRequest, FileDescriptorResponse,
    ListServiceResponse, ServerReflectionRequest, ServerReflectionResponse, ServiceResponse,
};
use tonic_reflection::pb::v1alpha;
use tonic_reflection::server::v1::ServerReflection as ServerReflectionV1;
use tonic_reflection::server::v1alpha::ServerReflection as ServerReflectionV1Alpha;

pub(crate) const REFLECTION_V1_SERVICE: &str = "grpc.reflection.v1.ServerReflection";
pub(crate) const REFLECTION_V1ALPHA_SERVICE: &str = "grpc.reflection.v1alpha.ServerReflection";

/// The `grpc.reflection.v1.ServerReflection` implementation of the proxy.
pub(crate) struct ReflectionService {
    shared: Arc<Shared>,
}

impl ReflectionService {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[tonic::async_trait]
impl ServerReflectionV1 for ReflectionService {
    type ServerReflectionInfoStream = ReceiverStream<Result<ServerReflectionResponse, Status>>;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let mut inbound = request.into_inner();
        let mut handler = ReflectionHandler::new(Arc::clone(&self.shared));
        let (responses, stream) = mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(message)) => {
                        let response = handler.handle(message);
                        if responses.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        let _ = responses.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(stream)))
    }
}

/// The `v1alpha` revision of the reflection service.
///
/// Every message is converted to the v1 shape, handled by the same
/// [`ReflectionHandler`], and converted back.
pub(crate) struct ReflectionServiceAlpha {
    shared: Arc<Shared>,
}

impl ReflectionServiceAlpha {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[tonic::async_trait]
impl ServerReflectionV1Alpha for ReflectionServiceAlpha {
    type ServerReflectionInfoStream =
        ReceiverStream<Result<v1alpha::ServerReflectionResponse, Status>>;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<v1alpha::ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let mut inbound = request.into_inner();
        let mut handler = ReflectionHandler::new(Arc::clone(&self.shared));
        let (responses, stream) = mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(message)) => {
                        let response = handler.handle(adapter::request_to_v1(message));
                        let response = adapter::response_to_v1alpha(response);
                        if responses.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        let _ = responses.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(stream)))
    }
}

/// Per-stream request handler.
///
/// Tracks which file descriptors were already sent on this stream so that
/// shared dependencies are transmitted once per stream.
struct ReflectionHandler {
    shared: Arc<Shared>,
    sent_files: HashSet<String>,
}

impl ReflectionHandler {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            sent_files: HashSet::new(),
        }
    }

    fn handle(&mut self, request: ServerReflectionRequest) -> ServerReflectionResponse {
        let Some(message) = request.message_request.clone() else {
            return error_response(Code::Unimplemented);
        };

        let result = match message {
            MessageRequest::ListServices(_) => {
                Ok(MessageResponse::ListServicesResponse(self.list_services()))
            }
            MessageRequest::FileByFilename(path) => self.file_by_filename(&path),
            MessageRequest::FileContainingSymbol(symbol) => self.file_containing_symbol(&symbol),
            MessageRequest::FileContainingExtension(extension) => {
                self.file_containing_extension(&extension)
            }
            MessageRequest::AllExtensionNumbersOfType(name) => self.all_extension_numbers(&name),
        };

        match result {
            Ok(message_response) => ServerReflectionResponse {
                valid_host: String::new(),
                original_request: Some(request),
                message_response: Some(message_response),
            },
            Err(NotFound) => error_response(Code::NotFound),
        }
    }

    /// Lists every routing-table service except the reflection services
    /// themselves, which the proxy serves in their own right.
    fn list_services(&self) -> ListServiceResponse {
        let services = self.shared.services.read().unwrap();
        let mut names: Vec<&String> = services
            .keys()
            .filter(|name| {
                name.as_str() != REFLECTION_V1_SERVICE
                    && name.as_str() != REFLECTION_V1ALPHA_SERVICE
            })
            .collect();
        names.sort();

        ListServiceResponse {
            service: names
                .into_iter()
                .map(|name| ServiceResponse { name: name.clone() })
                .collect(),
        }
    }

    fn file_by_filename(&mut self, path: &str) -> Result<MessageResponse, NotFound> {
        let file = self.shared.registry.find_file_by_path(path)?;
        self.file_with_dependencies(file.name())
    }

    fn file_containing_symbol(&mut self, symbol: &str) -> Result<MessageResponse, NotFound> {
        let file = self.shared.registry.find_file_containing_symbol(symbol)?;
        self.file_with_dependencies(file.name())
    }

    fn file_containing_extension(
        &mut self,
        extension: &ExtensionRequest,
    ) -> Result<MessageResponse, NotFound> {
        let file = self
            .shared
            .registry
            .find_file_containing_extension(&extension.containing_type, extension.extension_number)?;
        self.file_with_dependencies(file.name())
    }

    fn all_extension_numbers(&self, name: &str) -> Result<MessageResponse, NotFound> {
        let numbers = self.shared.registry.extension_numbers(name)?;
        Ok(MessageResponse::AllExtensionNumbersResponse(
            ExtensionNumberResponse {
                base_type_name: name.to_owned(),
                extension_number: numbers,
            },
        ))
    }

    fn file_with_dependencies(&mut self, path: &str) -> Result<MessageResponse, NotFound> {
        let encoded = self
            .shared
            .registry
            .files_with_dependencies(path, &mut self.sent_files)?;
        Ok(MessageResponse::FileDescriptorResponse(
            FileDescriptorResponse {
                file_descriptor_proto: encoded,
            },
        ))
    }
}

fn error_response(code: Code) -> ServerReflectionResponse {
    ServerReflectionResponse {
        valid_host: String::new(),
        original_request: None,
        message_response: Some(MessageResponse::ErrorResponse(ErrorResponse {
            error_code: code as i32,
            error_message: String::new(),
        })),
    }
}
