//! # Canopy
//!
//! A capability-oriented RPC runtime. Object references cross **zone**
//! boundaries - a zone being an isolated execution context with its own
//! registry - and are invoked transparently as if local. The runtime keeps
//! a reference-counted object graph consistent across any number of
//! hop-connected zones, survives disconnects by synthesising the releases
//! a silent zone will never send, and multiplexes calls over pluggable
//! transports.
//!
//! The pieces, leaves first: typed identifiers and error codes, the wire
//! envelope, the [`marshaller::Marshaller`] call surface, remote pointers
//! ([`pointers::Shared`] / [`pointers::Optimistic`]), the server-side stub
//! pair, the client-side proxy pair, the per-zone [`service::Service`]
//! registry, the per-destination [`service_proxy::ServiceProxy`], the
//! multi-hop [`pass_through::PassThrough`] router, and the transport layer
//! with in-process, SPSC-queue and TCP implementations.

pub mod bindings;
pub mod error;
pub mod marshaller;
pub mod pass_through;
pub mod pointers;
pub mod proxy;
pub mod service;
pub mod service_proxy;
pub mod stub;
pub mod sync;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod wire;

pub use bindings::RemoteInterface;
pub use error::{RpcError, RpcResult};
pub use marshaller::{BackChannel, BackChannelEntry, CallOutput, Marshaller};
pub use pointers::{Optimistic, Shared, WeakHandle};
pub use proxy::{ObjectProxy, ObjectProxyCreationRule};
pub use service::Service;
pub use service_proxy::ServiceProxy;
pub use stub::{InterfaceStub, ObjectStub};
pub use telemetry::ServiceObserver;
pub use transport::{LocalTransport, SpscTransport, TcpTransport, Transport};
pub use types::{
    AddRefOptions, CallerZoneId, DestinationZoneId, Encoding, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZoneId, MessageDirection, MethodId, ObjectId,
    PassThroughStatus, ReleaseOptions, TransportStatus, ZoneId,
};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The protocol version this build speaks natively.
pub const PROTOCOL_VERSION: u64 = 2;

/// The oldest protocol version the downgrade loop will fall back to.
pub const LOWEST_SUPPORTED_VERSION: u64 = 1;
