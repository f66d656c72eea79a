//! Conversions between the `v1` and `v1alpha` revisions of the reflection protocol.
//!
//! The two revisions are wire-compatible field-by-field; only the protobuf package
//! differs. These functions copy every request and response variant across so that
//! both the client fallback and the served `v1alpha` endpoint can reuse the `v1`
//! code paths. Unknown variants map to an empty message.
use tonic_reflection::pb::{v1, v1alpha};

pub fn request_to_v1(src: v1alpha::ServerReflectionRequest) -> v1::ServerReflectionRequest {
    use v1::server_reflection_request::MessageRequest as V1;
    use v1alpha::server_reflection_request::MessageRequest as Alpha;

    let message_request = src.message_request.map(|request| match request {
        Alpha::FileByFilename(filename) => V1::FileByFilename(filename),
        Alpha::FileContainingSymbol(symbol) => V1::FileContainingSymbol(symbol),
        Alpha::FileContainingExtension(ext) => V1::FileContainingExtension(v1::ExtensionRequest {
            containing_type: ext.containing_type,
            extension_number: ext.extension_number,
        }),
        Alpha::AllExtensionNumbersOfType(name) => V1::AllExtensionNumbersOfType(name),
        Alpha::ListServices(filter) => V1::ListServices(filter),
    });

    v1::ServerReflectionRequest {
        host: src.host,
        message_request,
    }
}

pub fn request_to_v1alpha(src: v1::ServerReflectionRequest) -> v1alpha::ServerReflectionRequest {
    use v1::server_reflection_request::MessageRequest as V1;
    use v1alpha::server_reflection_request::MessageRequest as Alpha;

    let message_request = src.message_request.map(|request| match request {
        V1::FileByFilename(filename) => Alpha::FileByFilename(filename),
        V1::FileContainingSymbol(symbol) => Alpha::FileContainingSymbol(symbol),
        V1::FileContainingExtension(ext) => Alpha::FileContainingExtension(v1alpha::ExtensionRequest {
            containing_type: ext.containing_type,
            extension_number: ext.extension_number,
        }),
        V1::AllExtensionNumbersOfType(name) => Alpha::AllExtensionNumbersOfType(name),
        V1::ListServices(filter) => Alpha::ListServices(filter),
    });

    v1alpha::ServerReflectionRequest {
        host: src.host,
        message_request,
    }
}

pub fn response_to_v1(src: v1alpha::ServerReflectionResponse) -> v1::ServerReflectionResponse {
    use v1::server_reflection_response::MessageResponse as V1;
    use v1alpha::server_reflection_response::MessageResponse as Alpha;

    let message_response = src.message_response.map(|response| match response {
        Alpha::FileDescriptorResponse(files) => V1::FileDescriptorResponse(v1::FileDescriptorResponse {
            file_descriptor_proto: files.file_descriptor_proto,
        }),
        Alpha::AllExtensionNumbersResponse(numbers) => {
            V1::AllExtensionNumbersResponse(v1::ExtensionNumberResponse {
                base_type_name: numbers.base_type_name,
                extension_number: numbers.extension_number,
            })
        }
        Alpha::ListServicesResponse(services) => V1::ListServicesResponse(v1::ListServiceResponse {
            service: services
                .service
                .into_iter()
                .map(|service| v1::ServiceResponse { name: service.name })
                .collect(),
        }),
        Alpha::ErrorResponse(error) => V1::ErrorResponse(v1::ErrorResponse {
            error_code: error.error_code,
            error_message: error.error_message,
        }),
    });

    v1::ServerReflectionResponse {
        valid_host: src.valid_host,
        original_request: src.original_request.map(request_to_v1),
        message_response,
    }
}

pub fn response_to_v1alpha(src: v1::ServerReflectionResponse) -> v1alpha::ServerReflectionResponse {
    use v1::server_reflection_response::MessageResponse as V1;
    use v1alpha::server_reflection_response::MessageResponse as Alpha;

    let message_response = src.message_response.map(|response| match response {
        V1::FileDescriptorResponse(files) => Alpha::FileDescriptorResponse(v1alpha::FileDescriptorResponse {
            file_descriptor_proto: files.file_descriptor_proto,
        }),
        V1::AllExtensionNumbersResponse(numbers) => {
            Alpha::AllExtensionNumbersResponse(v1alpha::ExtensionNumberResponse {
                base_type_name: numbers.base_type_name,
                extension_number: numbers.extension_number,
            })
        }
        V1::ListServicesResponse(services) => Alpha::ListServicesResponse(v1alpha::ListServiceResponse {
            service: services
                .service
                .into_iter()
                .map(|service| v1alpha::ServiceResponse { name: service.name })
                .collect(),
        }),
        V1::ErrorResponse(error) => Alpha::ErrorResponse(v1alpha::ErrorResponse {
            error_code: error.error_code,
            error_message: error.error_message,
        }),
    });

    v1alpha::ServerReflectionResponse {
        valid_host: src.valid_host,
        original_request: src.original_request.map(request_to_v1alpha),
        message_response,
    }
}
