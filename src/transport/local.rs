//! In-process transport pair. The two halves are linked directly: an
//! outbound operation on one half is delivered straight into the peer
//! half's inbound router with no serialisation. Used to link zones living
//! in the same process, typically a parent zone and a subordinate child
//! zone.

use super::{ConnectionHandler, Transport, TransportCore};
use crate::error::{RpcError, RpcResult};
use crate::marshaller::{BackChannel, CallOutput, Marshaller};
use crate::types::{
    AddRefOptions, CallerZoneId, DestinationZoneId, Encoding, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZoneId, MethodId, ObjectId, ReleaseOptions, TransportStatus,
    ZoneId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

/// One half of an in-process transport pair.
pub struct LocalTransport {
    core: TransportCore,
    peer: Mutex<Weak<LocalTransport>>,
    connection_handler: Mutex<Option<ConnectionHandler>>,
    self_weak: Weak<LocalTransport>,
}

impl LocalTransport {
    /// Create a linked pair of halves. `zone_a` sees `zone_b` as adjacent
    /// and vice versa. Local edges carry no handshake latency and start
    /// out CONNECTED.
    pub fn pair(
        name: &str,
        zone_a: ZoneId,
        zone_b: ZoneId,
    ) -> (Arc<LocalTransport>, Arc<LocalTransport>) {
        let a = Arc::new_cyclic(|self_weak| LocalTransport {
            core: TransportCore::new(&format!("{name}:{zone_a}->{zone_b}"), zone_a, zone_b),
            peer: Mutex::new(Weak::new()),
            connection_handler: Mutex::new(None),
            self_weak: self_weak.clone(),
        });
        let b = Arc::new_cyclic(|self_weak| LocalTransport {
            core: TransportCore::new(&format!("{name}:{zone_b}->{zone_a}"), zone_b, zone_a),
            peer: Mutex::new(Weak::new()),
            connection_handler: Mutex::new(None),
            self_weak: self_weak.clone(),
        });
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        a.core.set_status(TransportStatus::Connected);
        b.core.set_status(TransportStatus::Connected);
        (a, b)
    }

    pub fn set_connection_handler(&self, handler: ConnectionHandler) {
        *self.connection_handler.lock() = Some(handler);
    }

    fn peer(&self) -> RpcResult<Arc<dyn Transport>> {
        let peer = self.peer.lock().upgrade().ok_or(RpcError::ZoneNotFound)?;
        Ok(peer)
    }

    /// Tear down both halves of the pair.
    pub async fn close(&self) {
        if let Some(this) = self.self_weak.upgrade() {
            let this: Arc<dyn Transport> = this;
            super::shutdown(&this).await;
        }
        if let Some(peer) = self.peer.lock().upgrade() {
            let peer: Arc<dyn Transport> = peer;
            super::shutdown(&peer).await;
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn inner_connect(
        &self,
        input_descriptor: InterfaceDescriptor,
    ) -> RpcResult<InterfaceDescriptor> {
        let peer = self.peer()?;
        let handler = peer
            .connection_handler()
            .ok_or(RpcError::ZoneNotSupported)?;
        debug!(transport = self.core.name(), "running in-process handshake");
        let output = handler(input_descriptor, peer.clone()).await?;
        peer.core().set_status(TransportStatus::Connected);
        self.core.set_status(TransportStatus::Connected);
        Ok(output)
    }

    fn connection_handler(&self) -> Option<ConnectionHandler> {
        self.connection_handler.lock().clone()
    }
}

#[async_trait]
impl Marshaller for LocalTransport {
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
    ) -> RpcResult<CallOutput> {
        if self.core.status() != TransportStatus::Connected {
            return Err(RpcError::TransportError);
        }
        let peer = self.peer()?;
        super::inbound_send(
            &peer,
            protocol_version,
            encoding,
            tag,
            caller_zone,
            destination_zone,
            object,
            interface,
            method,
            in_data,
            in_back_channel,
        )
        .await
    }

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
    ) {
        let Ok(peer) = self.peer() else {
            return;
        };
        super::inbound_post(
            &peer,
            protocol_version,
            encoding,
            tag,
            caller_zone,
            destination_zone,
            object,
            interface,
            method,
            in_data,
            in_back_channel,
        )
        .await;
    }

    async fn try_cast(
        &self,
        protocol_version: u64,
        caller_zone: CallerZoneId,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        interface: InterfaceOrdinal,
        in_back_channel: &BackChannel,
    ) -> RpcResult<BackChannel> {
        if self.core.status() != TransportStatus::Connected {
            return Err(RpcError::TransportError);
        }
        let peer = self.peer()?;
        super::inbound_try_cast(
            &peer,
            protocol_version,
            caller_zone,
            destination_zone,
            object,
            interface,
            in_back_channel,
        )
        .await
    }

    async fn add_ref(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        known_direction_zone: KnownDirectionZoneId,
        options: AddRefOptions,
        in_back_channel: &BackChannel,
    ) -> RpcResult<u64> {
        if self.core.status() != TransportStatus::Connected {
            return Err(RpcError::TransportError);
        }
        let peer = self.peer()?;
        super::inbound_add_ref(
            &peer,
            protocol_version,
            destination_zone,
            object,
            caller_zone,
            known_direction_zone,
            options,
            in_back_channel,
        )
        .await
    }

    async fn release(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        options: ReleaseOptions,
        in_back_channel: &BackChannel,
    ) -> RpcResult<u64> {
        if self.core.status() != TransportStatus::Connected {
            return Err(RpcError::TransportError);
        }
        let peer = self.peer()?;
        super::inbound_release(
            &peer,
            protocol_version,
            destination_zone,
            object,
            caller_zone,
            options,
            in_back_channel,
        )
        .await
    }

    async fn object_released(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    ) {
        let Ok(peer) = self.peer() else {
            return;
        };
        super::inbound_object_released(
            &peer,
            protocol_version,
            destination_zone,
            object,
            caller_zone,
            in_back_channel,
        )
        .await;
    }

    async fn transport_down(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    ) {
        let Ok(peer) = self.peer() else {
            return;
        };
        super::inbound_transport_down(
            &peer,
            protocol_version,
            destination_zone,
            caller_zone,
            in_back_channel,
        )
        .await;
    }
}
