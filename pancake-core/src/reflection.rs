//! # Server Reflection
//!
//! Everything pancake needs to speak the gRPC Server Reflection protocol on both
//! sides of the proxy:
//!
//! * [`client::ReflectionClient`] queries upstream servers for their services and
//!   file descriptors over a single long-lived bidirectional stream.
//! * [`registry::DescriptorRegistry`] stores the union of every descriptor learned
//!   from every upstream and answers the lookups of the proxy's own reflection
//!   service.
//! * [`adapter`] converts between the `v1` and `v1alpha` revisions of the protocol
//!   so that the rest of the crate only ever handles `v1` messages.
pub mod adapter;
pub mod client;
pub mod registry;
