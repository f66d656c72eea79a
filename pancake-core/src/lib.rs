//! # Pancake Core
//!
//! `pancake-core` is the library behind the pancake proxy binary. It implements an
//! aggregating reverse proxy for gRPC and gRPC-Web traffic: clients talk to a single
//! endpoint, and pancake discovers which upstream server implements the requested
//! service using the gRPC Server Reflection protocol.
//!
//! ## Key Components
//!
//! * **[`proxy::Proxy`]:** The proxy handle. It owns the routing table, accepts HTTP
//!   requests, forwards them to upstream servers and serves the aggregated reflection
//!   service.
//! * **[`reflection::client::ReflectionClient`]:** A reflection client speaking
//!   `grpc.reflection.v1` with a transparent `v1alpha` fallback, used to discover the
//!   services and descriptors of each upstream.
//! * **[`reflection::registry::DescriptorRegistry`]:** The merged descriptor store that
//!   backs the proxy's own reflection service.
//! * **[`providers`]:** The contract through which discovery providers push upstream
//!   configurations into the proxy, plus a static provider implementation.
//! * **[`grpcweb`]:** Translation between `application/grpc-web[-text]` and plain gRPC,
//!   including the end-of-stream trailer frame.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect` and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod grpcweb;
pub mod providers;
pub mod proxy;
pub mod reflection;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
