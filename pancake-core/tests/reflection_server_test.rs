//! Tests for the aggregated reflection server, driven through the proxy's HTTP
//! handler with hand-framed reflection streams.
mod common;

use common::{collect_response, grpc_frame, grpc_request, plain_file, reflect, service_file, split_frames};
use pancake_core::proxy::{Proxy, ProxyConfig};
use prost::Message;
use prost_types::{FieldDescriptorProto, FileDescriptorProto};
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ExtensionRequest;
use tonic_reflection::pb::v1alpha;

fn seeded_proxy() -> Proxy {
    let proxy = Proxy::new(ProxyConfig::default());
    proxy.registry().register_files([
        service_file("svc_a.proto", "svc.a", "Echo", &["common.proto"]),
        service_file("svc_b.proto", "svc.b", "Echo", &["common.proto"]),
        plain_file("common.proto", "common"),
    ]);
    proxy
}

fn file_names(response: &MessageResponse) -> Vec<String> {
    let MessageResponse::FileDescriptorResponse(files) = response else {
        panic!("expected a file descriptor response, got {response:?}");
    };
    files
        .file_descriptor_proto
        .iter()
        .map(|raw| {
            FileDescriptorProto::decode(raw.as_slice())
                .expect("invalid file descriptor")
                .name()
                .to_owned()
        })
        .collect()
}

#[tokio::test]
async fn file_containing_symbol_returns_transitive_imports() {
    let proxy = seeded_proxy();

    let responses = reflect(
        &proxy,
        vec![MessageRequest::FileContainingSymbol("svc.a.Echo".into())],
    )
    .await;

    let names = file_names(responses[0].message_response.as_ref().unwrap());
    assert_eq!(names, vec!["svc_a.proto", "common.proto"]);
}

#[tokio::test]
async fn already_sent_files_are_suppressed_within_one_stream() {
    let proxy = seeded_proxy();

    let responses = reflect(
        &proxy,
        vec![
            MessageRequest::FileContainingSymbol("svc.a.Echo".into()),
            MessageRequest::FileContainingSymbol("svc.b.Echo".into()),
            // The root file is always included, even when already sent.
            MessageRequest::FileByFilename("svc_a.proto".into()),
        ],
    )
    .await;
    assert_eq!(responses.len(), 3);

    let first = file_names(responses[0].message_response.as_ref().unwrap());
    assert_eq!(first, vec!["svc_a.proto", "common.proto"]);

    let second = file_names(responses[1].message_response.as_ref().unwrap());
    assert_eq!(second, vec!["svc_b.proto"]);

    let third = file_names(responses[2].message_response.as_ref().unwrap());
    assert_eq!(third, vec!["svc_a.proto"]);
}

#[tokio::test]
async fn sent_sets_are_not_shared_between_streams() {
    let proxy = seeded_proxy();

    for _ in 0..2 {
        let responses = reflect(
            &proxy,
            vec![MessageRequest::FileContainingSymbol("svc.b.Echo".into())],
        )
        .await;
        let names = file_names(responses[0].message_response.as_ref().unwrap());
        assert_eq!(names, vec!["svc_b.proto", "common.proto"]);
    }
}

#[tokio::test]
async fn resolves_extensions_of_a_message() {
    let proxy = Proxy::new(ProxyConfig::default());

    let mut base = plain_file("base.proto", "pkg");
    base.message_type.push(prost_types::DescriptorProto {
        name: Some("Base".to_owned()),
        ..Default::default()
    });
    let mut extensions = plain_file("exts.proto", "other");
    extensions.dependency.push("base.proto".to_owned());
    for (name, number) in [("second", 200), ("first", 100)] {
        extensions.extension.push(FieldDescriptorProto {
            name: Some(name.to_owned()),
            extendee: Some(".pkg.Base".to_owned()),
            number: Some(number),
            ..Default::default()
        });
    }
    proxy.registry().register_files([base, extensions]);

    let responses = reflect(
        &proxy,
        vec![
            MessageRequest::AllExtensionNumbersOfType("pkg.Base".into()),
            MessageRequest::FileContainingExtension(ExtensionRequest {
                containing_type: "pkg.Base".into(),
                extension_number: 100,
            }),
        ],
    )
    .await;

    match responses[0].message_response.as_ref().unwrap() {
        MessageResponse::AllExtensionNumbersResponse(numbers) => {
            assert_eq!(numbers.base_type_name, "pkg.Base");
            assert_eq!(numbers.extension_number, vec![100, 200]);
        }
        other => panic!("expected extension numbers, got {other:?}"),
    }

    let names = file_names(responses[1].message_response.as_ref().unwrap());
    assert_eq!(names, vec!["exts.proto", "base.proto"]);
}

#[tokio::test]
async fn unknown_lookups_return_not_found_in_band() {
    let proxy = seeded_proxy();

    let responses = reflect(
        &proxy,
        vec![
            MessageRequest::FileContainingSymbol("no.such.Symbol".into()),
            MessageRequest::FileByFilename("no_such.proto".into()),
            MessageRequest::AllExtensionNumbersOfType("no.such.Message".into()),
        ],
    )
    .await;

    for response in responses {
        match response.message_response.unwrap() {
            MessageResponse::ErrorResponse(error) => {
                assert_eq!(error.error_code, tonic::Code::NotFound as i32);
            }
            other => panic!("expected an error response, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn empty_request_variant_is_unimplemented() {
    let proxy = seeded_proxy();

    let message = tonic_reflection::pb::v1::ServerReflectionRequest {
        host: String::new(),
        message_request: None,
    };
    let request = grpc_request(
        "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo",
        grpc_frame(&message),
    );
    let (_headers, bytes, _trailers) = collect_response(proxy.handle_request(request).await).await;

    let frames = split_frames(&bytes);
    let response =
        tonic_reflection::pb::v1::ServerReflectionResponse::decode(frames[0].1.clone()).unwrap();
    match response.message_response.unwrap() {
        MessageResponse::ErrorResponse(error) => {
            assert_eq!(error.error_code, tonic::Code::Unimplemented as i32);
        }
        other => panic!("expected an error response, got {other:?}"),
    }
}

#[tokio::test]
async fn v1alpha_requests_are_served_through_the_adapter() {
    let proxy = seeded_proxy();

    let message = v1alpha::ServerReflectionRequest {
        host: String::new(),
        message_request: Some(
            v1alpha::server_reflection_request::MessageRequest::FileContainingSymbol(
                "svc.a.Echo".into(),
            ),
        ),
    };
    let request = grpc_request(
        "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo",
        grpc_frame(&message),
    );
    let (_headers, bytes, trailers) = collect_response(proxy.handle_request(request).await).await;
    assert_eq!(trailers.get("grpc-status").unwrap(), "0");

    let frames = split_frames(&bytes);
    let response = v1alpha::ServerReflectionResponse::decode(frames[0].1.clone()).unwrap();
    match response.message_response.unwrap() {
        v1alpha::server_reflection_response::MessageResponse::FileDescriptorResponse(files) => {
            let names: Vec<String> = files
                .file_descriptor_proto
                .iter()
                .map(|raw| {
                    FileDescriptorProto::decode(raw.as_slice())
                        .unwrap()
                        .name()
                        .to_owned()
                })
                .collect();
            assert_eq!(names, vec!["svc_a.proto", "common.proto"]);
        }
        other => panic!("expected a file descriptor response, got {other:?}"),
    }

    // The adapter echoes the original request back in the v1alpha shape.
    let original = response.original_request.unwrap();
    assert!(matches!(
        original.message_request,
        Some(v1alpha::server_reflection_request::MessageRequest::FileContainingSymbol(symbol))
            if symbol == "svc.a.Echo"
    ));
}

#[tokio::test]
async fn disabled_reflection_returns_unimplemented() {
    let proxy = Proxy::new(ProxyConfig {
        disable_reflection: true,
        ..ProxyConfig::default()
    });
    proxy
        .registry()
        .register_files([service_file("svc_a.proto", "svc.a", "Echo", &[])]);

    for service in [
        "grpc.reflection.v1.ServerReflection",
        "grpc.reflection.v1alpha.ServerReflection",
    ] {
        let request = grpc_request(
            &format!("/{service}/ServerReflectionInfo"),
            bytes::Bytes::new(),
        );
        let (_headers, bytes, trailers) =
            collect_response(proxy.handle_request(request).await).await;
        assert!(bytes.is_empty());
        assert_eq!(
            trailers.get("grpc-status").unwrap(),
            &(tonic::Code::Unimplemented as i32).to_string()
        );
    }
}
