//! # The Marshaller Contract
//!
//! `Marshaller` is the single call surface every routing component speaks:
//! services, pass-throughs and transports all implement it. A call entering
//! a zone is handed to a `Marshaller` and the implementation decides whether
//! to dispatch locally, forward along the chain, or fail.
//!
//! Operations mirror the wire: `send` expects a reply, `post` is
//! fire-and-forget, `try_cast` queries interface support, `add_ref` and
//! `release` walk the distributed reference count, and `object_released` /
//! `transport_down` are lifecycle notifications synthesised during teardown.

use crate::error::RpcResult;
use crate::types::{
    AddRefOptions, CallerZoneId, DestinationZoneId, Encoding, InterfaceOrdinal,
    KnownDirectionZoneId, MethodId, ObjectId, ReleaseOptions,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One opaque `(tag, bytes)` entry riding alongside a call. Derived services
/// piggy-back cross-cutting state here without altering operation
/// signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackChannelEntry {
    pub tag: u64,
    pub data: Vec<u8>,
}

/// The auxiliary payload vector carried in each direction of a call.
pub type BackChannel = Vec<BackChannelEntry>;

/// Reply of a completed `send`: the encoded out-parameters plus whatever the
/// callee put on the back channel.
#[derive(Debug, Clone, Default)]
pub struct CallOutput {
    pub data: Vec<u8>,
    pub back_channel: BackChannel,
}

/// The zone-to-zone call surface.
///
/// Ordering contract: requests sharing `(destination, object)` may be
/// reordered freely, except that a `release` never overtakes a prior
/// `add_ref` for the same `(destination, object, caller)`.
#[allow(clippy::too_many_arguments)]
#[async_trait]
pub trait Marshaller: Send + Sync {
    /// Invoke a method and wait for the reply.
    async fn send(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_zone: CallerZoneId,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        in_data: &[u8],
        in_back_channel: &BackChannel,
    ) -> RpcResult<CallOutput>;

    /// Invoke a method without expecting a reply. Truly lossy: no delivery
    /// receipt exists.
    async fn post(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_zone: CallerZoneId,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        in_data: &[u8],
        in_back_channel: &BackChannel,
    );

    /// Query whether an object implements an interface.
    async fn try_cast(
        &self,
        protocol_version: u64,
        caller_zone: CallerZoneId,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        interface: InterfaceOrdinal,
        in_back_channel: &BackChannel,
    ) -> RpcResult<BackChannel>;

    /// Add ownership of an object for a caller (shared) or prop up the
    /// transport chain (optimistic). Returns the new count where the
    /// terminal stub is reachable.
    async fn add_ref(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        known_direction_zone: KnownDirectionZoneId,
        options: AddRefOptions,
        in_back_channel: &BackChannel,
    ) -> RpcResult<u64>;

    /// Drop a previously added reference. Returns the remaining count where
    /// the terminal stub is reachable.
    async fn release(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        options: ReleaseOptions,
        in_back_channel: &BackChannel,
    ) -> RpcResult<u64>;

    /// Unidirectional notification that an object's stub is gone, or that a
    /// caller pre-released an optimistic handle.
    async fn object_released(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    );

    /// Unidirectional notification that a transport along the chain went
    /// down; receivers synthesise the releases the silent zone will never
    /// send.
    async fn transport_down(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    );
}
