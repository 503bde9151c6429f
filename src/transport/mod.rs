//! # Transport Abstraction
//!
//! A transport is the edge carrying envelopes between two adjacent zones.
//! Every transport implements the [`Marshaller`] contract twice over:
//! outbound operations (the trait impl) move a call away from this zone,
//! and the inbound router in this module delivers calls arriving from the
//! peer - either into the local service, or into the pass-through
//! registered for the `(destination, caller)` pair, creating one on demand.
//!
//! The shared [`TransportCore`] holds the pieces every edge needs: the
//! destination table, outbound-proxy and inbound-stub counts, and the
//! status machine. Entry into the terminal DISCONNECTED state walks the
//! destination table and synthesises `transport_down` to every registered
//! handler so no registry entry is left orphaned.

use crate::error::{RpcError, RpcResult};
use crate::marshaller::{BackChannel, CallOutput, Marshaller};
use crate::pass_through::PassThrough;
use crate::types::{
    CallerZoneId, DestinationZoneId, Encoding, InterfaceDescriptor, InterfaceOrdinal,
    KnownDirectionZoneId, MethodId, ObjectId, TransportStatus, ZoneId,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub mod local;
pub mod spsc;
pub mod tcp;

pub use local::LocalTransport;
pub use spsc::SpscTransport;
pub use tcp::TcpTransport;

use crate::service::Service;

/// Callback a transport runs when the peer initiates the handshake: it
/// receives the peer's input descriptor and must produce this side's output
/// descriptor, typically by calling `Service::attach_remote_zone`.
pub type ConnectionHandler = Arc<
    dyn Fn(
            InterfaceDescriptor,
            Arc<dyn Transport>,
        ) -> Pin<Box<dyn Future<Output = RpcResult<InterfaceDescriptor>> + Send>>
        + Send
        + Sync,
>;

/// An edge between two adjacent zones. The trait impl is the outbound
/// direction; inbound delivery goes through [`inbound_send`] and friends.
#[async_trait]
pub trait Transport: Marshaller {
    fn core(&self) -> &TransportCore;

    /// Run the connect side of the handshake: deliver `input_descriptor`
    /// to the peer's connection handler and return the peer's output
    /// descriptor.
    async fn inner_connect(
        &self,
        input_descriptor: InterfaceDescriptor,
    ) -> RpcResult<InterfaceDescriptor>;

    /// Handler invoked when the peer initiates the handshake. Transports
    /// that never accept connections leave the default.
    fn connection_handler(&self) -> Option<ConnectionHandler> {
        None
    }
}

/// State shared by every transport implementation.
pub struct TransportCore {
    name: String,
    zone_id: ZoneId,
    adjacent_zone_id: Mutex<ZoneId>,
    service: Mutex<Weak<Service>>,
    // Pass-throughs for zone pairs whose route crosses this edge. Local
    // traffic never lands here: the inbound router dispatches it to the
    // service directly.
    destinations: RwLock<HashMap<(DestinationZoneId, CallerZoneId), Weak<PassThrough>>>,
    outbound_proxy_count: Mutex<HashMap<DestinationZoneId, u64>>,
    inbound_stub_count: Mutex<HashMap<CallerZoneId, u64>>,
    destination_count: AtomicI64,
    status: AtomicU8,
    // Serialises pass-through creation for this edge.
    passthrough_create: Mutex<()>,
}

impl TransportCore {
    pub fn new(name: &str, zone_id: ZoneId, adjacent_zone_id: ZoneId) -> Self {
        Self {
            name: name.to_string(),
            zone_id,
            adjacent_zone_id: Mutex::new(adjacent_zone_id),
            service: Mutex::new(Weak::new()),
            destinations: RwLock::new(HashMap::new()),
            outbound_proxy_count: Mutex::new(HashMap::new()),
            inbound_stub_count: Mutex::new(HashMap::new()),
            destination_count: AtomicI64::new(0),
            status: AtomicU8::new(TransportStatus::Connecting as u8),
            passthrough_create: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    pub fn adjacent_zone_id(&self) -> ZoneId {
        *self.adjacent_zone_id.lock()
    }

    /// Learned from the handshake on accepting transports.
    pub fn set_adjacent_zone_id(&self, zone_id: ZoneId) {
        *self.adjacent_zone_id.lock() = zone_id;
    }

    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.lock().upgrade()
    }

    pub fn set_service(&self, service: &Arc<Service>) {
        *self.service.lock() = Arc::downgrade(service);
    }

    pub fn status(&self) -> TransportStatus {
        TransportStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move the status machine. DISCONNECTED is terminal: attempts to leave
    /// it are ignored. Returns the previous status.
    pub fn set_status(&self, new_status: TransportStatus) -> TransportStatus {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if TransportStatus::from_u8(current) == TransportStatus::Disconnected {
                return TransportStatus::Disconnected;
            }
            match self.status.compare_exchange(
                current,
                new_status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return TransportStatus::from_u8(previous),
                Err(observed) => current = observed,
            }
        }
    }

    /// Register a handler for a zone pair. Returns false when the pair was
    /// already present.
    pub fn add_destination(
        &self,
        destination: DestinationZoneId,
        caller: CallerZoneId,
        handler: Weak<PassThrough>,
    ) -> bool {
        let mut destinations = self.destinations.write();
        match destinations.entry((destination, caller)) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if entry.get().strong_count() == 0 {
                    entry.insert(handler);
                    true
                } else {
                    false
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(handler);
                self.destination_count.fetch_add(1, Ordering::AcqRel);
                true
            }
        }
    }

    pub fn get_destination_handler(
        &self,
        destination: DestinationZoneId,
        caller: CallerZoneId,
    ) -> Option<Arc<PassThrough>> {
        self.destinations
            .read()
            .get(&(destination, caller))
            .and_then(Weak::upgrade)
    }

    /// Any live pass-through touching `destination`, regardless of caller.
    /// Used to route pure-transit traffic whose endpoints coincide.
    pub fn find_any_handler_for_destination(
        &self,
        destination: DestinationZoneId,
    ) -> Option<Arc<PassThrough>> {
        self.destinations
            .read()
            .iter()
            .find_map(|((dest, _), weak)| {
                if *dest == destination {
                    weak.upgrade()
                } else {
                    None
                }
            })
    }

    pub fn remove_destination(&self, destination: DestinationZoneId, caller: CallerZoneId) {
        if self
            .destinations
            .write()
            .remove(&(destination, caller))
            .is_some()
        {
            self.destination_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Deregister both orientations of a pass-through's zone pair.
    pub fn remove_destination_pair(&self, a: DestinationZoneId, b: DestinationZoneId) {
        self.remove_destination(a, b.as_caller());
        self.remove_destination(b, a.as_caller());
    }

    pub fn increment_outbound_proxy_count(&self, destination: DestinationZoneId) {
        *self
            .outbound_proxy_count
            .lock()
            .entry(destination)
            .or_insert(0) += 1;
        self.destination_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_outbound_proxy_count(&self, destination: DestinationZoneId) {
        let mut counts = self.outbound_proxy_count.lock();
        match counts.get_mut(&destination) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&destination);
                }
                self.destination_count.fetch_sub(1, Ordering::AcqRel);
            }
            _ => warn!(
                transport = %self.name,
                %destination,
                "outbound proxy count underflow"
            ),
        }
    }

    pub fn increment_inbound_stub_count(&self, caller: CallerZoneId) {
        *self.inbound_stub_count.lock().entry(caller).or_insert(0) += 1;
        self.destination_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_inbound_stub_count(&self, caller: CallerZoneId) {
        let mut counts = self.inbound_stub_count.lock();
        match counts.get_mut(&caller) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&caller);
                }
                self.destination_count.fetch_sub(1, Ordering::AcqRel);
            }
            _ => warn!(
                transport = %self.name,
                %caller,
                "inbound stub count underflow"
            ),
        }
    }

    pub fn destination_count(&self) -> i64 {
        self.destination_count.load(Ordering::Acquire)
    }

    /// Live pass-through handlers registered on this edge.
    pub fn pass_through_entries(
        &self,
    ) -> Vec<(DestinationZoneId, CallerZoneId, Arc<PassThrough>)> {
        self.destinations
            .read()
            .iter()
            .filter_map(|((dest, caller), weak)| {
                weak.upgrade().map(|handler| (*dest, *caller, handler))
            })
            .collect()
    }

    /// Number of distinct live handlers (a pass-through registers both
    /// orientations, so two table entries may share one handler).
    pub fn live_pass_through_count(&self) -> usize {
        let mut seen: Vec<*const ()> = Vec::new();
        for (_, _, handler) in self.pass_through_entries() {
            let ptr = Arc::as_ptr(&handler) as *const ();
            if !seen.contains(&ptr) {
                seen.push(ptr);
            }
        }
        seen.len()
    }
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Find the handler for a transit pair, wiring a new pass-through between
/// this transport and the next hop when none is registered yet.
async fn resolve_transit_handler(
    transport: &Arc<dyn Transport>,
    destination: DestinationZoneId,
    caller: CallerZoneId,
) -> RpcResult<Arc<PassThrough>> {
    let core = transport.core();
    if let Some(handler) = core.get_destination_handler(destination, caller) {
        return Ok(handler);
    }

    if destination.as_caller() == caller {
        // Pure transit for an out-parameter back-pointer: both endpoints
        // are the same zone, so any pass-through touching it can carry the
        // traffic without installing a counted pair of its own.
        if let Some(handler) = core.find_any_handler_for_destination(destination) {
            return Ok(handler);
        }
    }

    let service = core.service().ok_or(RpcError::ZoneNotFound)?;

    let _guard = core.passthrough_create.lock();
    if let Some(handler) = core.get_destination_handler(destination, caller) {
        return Ok(handler);
    }

    let destination_route = service
        .route_transport(destination, KnownDirectionZoneId::NULL)
        .ok_or(RpcError::ZoneNotFound)?;

    // The arriving edge serves whichever endpoint the message came from:
    // a call travelling toward the destination arrived on the caller-facing
    // edge, a return-path message arrived on the destination-facing edge.
    let (forward, reverse) = if same_transport(&destination_route, transport) {
        let caller_route = service
            .route_transport(caller.as_destination(), KnownDirectionZoneId::NULL)
            .ok_or(RpcError::ZoneNotFound)?;
        if same_transport(&caller_route, transport) {
            // Both directions resolve to the edge the message arrived on;
            // forwarding would loop.
            return Err(RpcError::ZoneNotFound);
        }
        (transport.clone(), caller_route)
    } else {
        (destination_route, transport.clone())
    };

    let pass_through = PassThrough::create(
        forward.clone(),
        reverse.clone(),
        service,
        destination,
        caller.as_destination(),
    );
    let weak = Arc::downgrade(&pass_through);

    if !core.add_destination(destination, caller, weak.clone()) {
        // Lost a cross-edge race; use the winner and abandon ours.
        pass_through.abandon();
        return core
            .get_destination_handler(destination, caller)
            .ok_or(RpcError::ZoneNotFound);
    }
    core.add_destination(caller.as_destination(), destination.as_caller(), weak.clone());
    for other in [&forward, &reverse] {
        if !same_transport(other, transport) {
            other.core().add_destination(destination, caller, weak.clone());
            other
                .core()
                .add_destination(caller.as_destination(), destination.as_caller(), weak.clone());
        }
    }

    debug!(
        transport = core.name(),
        %destination,
        %caller,
        "created pass_through for transit pair"
    );
    Ok(pass_through)
}

/// Deliver an inbound `send` arriving on this transport.
#[allow(clippy::too_many_arguments)]
pub async fn inbound_send(
    transport: &Arc<dyn Transport>,
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
    let core = transport.core();
    if destination_zone.as_zone() == core.zone_id() {
        let service = core.service().ok_or(RpcError::ZoneNotFound)?;
        return service
            .send(
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
    let handler = resolve_transit_handler(transport, destination_zone, caller_zone).await?;
    handler
        .send(
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

#[allow(clippy::too_many_arguments)]
pub async fn inbound_post(
    transport: &Arc<dyn Transport>,
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
    let core = transport.core();
    if destination_zone.as_zone() == core.zone_id() {
        if let Some(service) = core.service() {
            service
                .post(
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
        return;
    }
    if let Ok(handler) = resolve_transit_handler(transport, destination_zone, caller_zone).await {
        handler
            .post(
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
}

pub async fn inbound_try_cast(
    transport: &Arc<dyn Transport>,
    protocol_version: u64,
    caller_zone: CallerZoneId,
    destination_zone: DestinationZoneId,
    object: ObjectId,
    interface: InterfaceOrdinal,
    in_back_channel: &BackChannel,
) -> RpcResult<BackChannel> {
    let core = transport.core();
    if destination_zone.as_zone() == core.zone_id() {
        let service = core.service().ok_or(RpcError::ZoneNotFound)?;
        return service
            .try_cast(
                protocol_version,
                caller_zone,
                destination_zone,
                object,
                interface,
                in_back_channel,
            )
            .await;
    }
    let handler = resolve_transit_handler(transport, destination_zone, caller_zone).await?;
    handler
        .try_cast(
            protocol_version,
            caller_zone,
            destination_zone,
            object,
            interface,
            in_back_channel,
        )
        .await
}

#[allow(clippy::too_many_arguments)]
pub async fn inbound_add_ref(
    transport: &Arc<dyn Transport>,
    protocol_version: u64,
    destination_zone: DestinationZoneId,
    object: ObjectId,
    caller_zone: CallerZoneId,
    known_direction_zone: KnownDirectionZoneId,
    options: crate::types::AddRefOptions,
    in_back_channel: &BackChannel,
) -> RpcResult<u64> {
    let core = transport.core();
    // Terminal either at the stub's zone or, for a caller-route add_ref
    // walking the return path, at the caller's own zone.
    if destination_zone.as_zone() == core.zone_id() || caller_zone.as_zone() == core.zone_id() {
        let service = core.service().ok_or(RpcError::ZoneNotFound)?;
        return service
            .add_ref(
                protocol_version,
                destination_zone,
                object,
                caller_zone,
                known_direction_zone,
                options,
                in_back_channel,
            )
            .await;
    }
    let handler = resolve_transit_handler(transport, destination_zone, caller_zone).await?;
    handler
        .add_ref(
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

pub async fn inbound_release(
    transport: &Arc<dyn Transport>,
    protocol_version: u64,
    destination_zone: DestinationZoneId,
    object: ObjectId,
    caller_zone: CallerZoneId,
    options: crate::types::ReleaseOptions,
    in_back_channel: &BackChannel,
) -> RpcResult<u64> {
    let core = transport.core();
    if destination_zone.as_zone() == core.zone_id() {
        let service = core.service().ok_or(RpcError::ZoneNotFound)?;
        return service
            .release(
                protocol_version,
                destination_zone,
                object,
                caller_zone,
                options,
                in_back_channel,
            )
            .await;
    }
    let handler = resolve_transit_handler(transport, destination_zone, caller_zone).await?;
    handler
        .release(
            protocol_version,
            destination_zone,
            object,
            caller_zone,
            options,
            in_back_channel,
        )
        .await
}

pub async fn inbound_object_released(
    transport: &Arc<dyn Transport>,
    protocol_version: u64,
    destination_zone: DestinationZoneId,
    object: ObjectId,
    caller_zone: CallerZoneId,
    in_back_channel: &BackChannel,
) {
    let core = transport.core();
    // The notification terminates at the stub's zone (a pre-released
    // optimistic handle) or at the caller's zone (the stub is gone).
    if destination_zone.as_zone() == core.zone_id() || caller_zone.as_zone() == core.zone_id() {
        if let Some(service) = core.service() {
            service
                .object_released(
                    protocol_version,
                    destination_zone,
                    object,
                    caller_zone,
                    in_back_channel,
                )
                .await;
        }
        return;
    }
    if let Ok(handler) = resolve_transit_handler(transport, destination_zone, caller_zone).await {
        handler
            .object_released(
                protocol_version,
                destination_zone,
                object,
                caller_zone,
                in_back_channel,
            )
            .await;
    }
}

pub async fn inbound_transport_down(
    transport: &Arc<dyn Transport>,
    protocol_version: u64,
    destination_zone: DestinationZoneId,
    caller_zone: CallerZoneId,
    in_back_channel: &BackChannel,
) {
    let core = transport.core();
    if destination_zone.as_zone() == core.zone_id() {
        if let Some(service) = core.service() {
            service
                .transport_down(
                    protocol_version,
                    destination_zone,
                    caller_zone,
                    in_back_channel,
                )
                .await;
        }
        return;
    }
    if let Some(handler) = core.get_destination_handler(destination_zone, caller_zone) {
        handler
            .transport_down(
                protocol_version,
                destination_zone,
                caller_zone,
                in_back_channel,
            )
            .await;
    }
}

/// Listener a wire transport parks while waiting for the reply frame that
/// carries its sequence number.
pub(crate) struct ResultListener {
    event: crate::sync::Event,
    payload: Mutex<Option<crate::wire::EnvelopePayload>>,
    error: Mutex<Option<RpcError>>,
}

impl ResultListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            event: crate::sync::Event::new(),
            payload: Mutex::new(None),
            error: Mutex::new(None),
        })
    }

    pub(crate) fn complete(&self, payload: crate::wire::EnvelopePayload) {
        *self.payload.lock() = Some(payload);
        self.event.set();
    }

    pub(crate) fn fail(&self, error: RpcError) {
        *self.error.lock() = Some(error);
        self.event.set();
    }

    /// Wait for the reply, converting expiry of the per-call timeout into
    /// `TRANSPORT_ERROR`.
    pub(crate) async fn wait(
        &self,
        timeout: std::time::Duration,
    ) -> RpcResult<crate::wire::EnvelopePayload> {
        if tokio::time::timeout(timeout, self.event.wait()).await.is_err() {
            return Err(RpcError::TransportError);
        }
        if let Some(error) = *self.error.lock() {
            return Err(error);
        }
        self.payload
            .lock()
            .take()
            .ok_or(RpcError::ProxyDeserialisationError)
    }
}

/// Decode one inbound send-direction frame and route it through the
/// transport's inbound surface, emitting the reply frame where the
/// operation has one. Shared by the wire transports; each passes its own
/// frame sink.
pub(crate) async fn dispatch_frame(
    transport: Arc<dyn Transport>,
    prefix: crate::wire::EnvelopePrefix,
    envelope: crate::wire::EnvelopePayload,
    send_frame: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
) {
    use crate::types::{AddRefOptions, MessageDirection, ReleaseOptions};
    use crate::wire;

    let version = prefix.version;
    let sequence = prefix.sequence_number;
    let fingerprint = envelope.payload_fingerprint;

    let reply = |payload_fingerprint: u64, payload: Vec<u8>| {
        match wire::build_frame(
            version,
            MessageDirection::Reply,
            sequence,
            payload_fingerprint,
            payload,
        ) {
            Ok(frame) => send_frame(frame),
            Err(e) => warn!(error = %e, "failed to build reply frame"),
        }
    };

    if fingerprint == wire::CallSend::fingerprint(version) {
        let Ok(request) = wire::decode::<wire::CallSend>(Encoding::Binary, &envelope.payload)
        else {
            warn!("undecodable call frame dropped");
            return;
        };
        let result = inbound_send(
            &transport,
            version,
            request.encoding,
            request.tag,
            request.caller_zone,
            request.destination_zone,
            request.object,
            request.interface,
            request.method,
            &request.data,
            &request.back_channel,
        )
        .await;
        let response = match result {
            Ok(output) => wire::CallReply {
                err_code: crate::error::OK,
                data: output.data,
                back_channel: output.back_channel,
            },
            Err(e) => wire::CallReply {
                err_code: e.code(),
                data: Vec::new(),
                back_channel: BackChannel::new(),
            },
        };
        if let Ok(payload) = wire::encode(Encoding::Binary, &response) {
            reply(wire::CallReply::fingerprint(version), payload);
        }
    } else if fingerprint == wire::PostSend::fingerprint(version) {
        let Ok(request) = wire::decode::<wire::PostSend>(Encoding::Binary, &envelope.payload)
        else {
            warn!("undecodable post frame dropped");
            return;
        };
        inbound_post(
            &transport,
            version,
            request.encoding,
            request.tag,
            request.caller_zone,
            request.destination_zone,
            request.object,
            request.interface,
            request.method,
            &request.data,
            &request.back_channel,
        )
        .await;
    } else if fingerprint == wire::TryCastSend::fingerprint(version) {
        let Ok(request) = wire::decode::<wire::TryCastSend>(Encoding::Binary, &envelope.payload)
        else {
            warn!("undecodable try_cast frame dropped");
            return;
        };
        let result = inbound_try_cast(
            &transport,
            version,
            request.caller_zone,
            request.destination_zone,
            request.object,
            request.interface,
            &request.back_channel,
        )
        .await;
        let response = match result {
            Ok(back_channel) => wire::TryCastReply {
                err_code: crate::error::OK,
                back_channel,
            },
            Err(e) => wire::TryCastReply {
                err_code: e.code(),
                back_channel: BackChannel::new(),
            },
        };
        if let Ok(payload) = wire::encode(Encoding::Binary, &response) {
            reply(wire::TryCastReply::fingerprint(version), payload);
        }
    } else if fingerprint == wire::AddRefSend::fingerprint(version) {
        let Ok(request) = wire::decode::<wire::AddRefSend>(Encoding::Binary, &envelope.payload)
        else {
            warn!("undecodable add_ref frame dropped");
            return;
        };
        let result = inbound_add_ref(
            &transport,
            version,
            request.destination_zone,
            request.object,
            request.caller_zone,
            KnownDirectionZoneId(request.known_direction_zone),
            AddRefOptions(request.options),
            &request.back_channel,
        )
        .await;
        let response = match result {
            Ok(reference_count) => wire::AddRefReply {
                err_code: crate::error::OK,
                reference_count,
                back_channel: BackChannel::new(),
            },
            Err(e) => wire::AddRefReply {
                err_code: e.code(),
                reference_count: 0,
                back_channel: BackChannel::new(),
            },
        };
        if let Ok(payload) = wire::encode(Encoding::Binary, &response) {
            reply(wire::AddRefReply::fingerprint(version), payload);
        }
    } else if fingerprint == wire::ReleaseSend::fingerprint(version) {
        let Ok(request) = wire::decode::<wire::ReleaseSend>(Encoding::Binary, &envelope.payload)
        else {
            warn!("undecodable release frame dropped");
            return;
        };
        let result = inbound_release(
            &transport,
            version,
            request.destination_zone,
            request.object,
            request.caller_zone,
            ReleaseOptions(request.options),
            &request.back_channel,
        )
        .await;
        let response = match result {
            Ok(reference_count) => wire::ReleaseReply {
                err_code: crate::error::OK,
                reference_count,
                back_channel: BackChannel::new(),
            },
            Err(e) => wire::ReleaseReply {
                err_code: e.code(),
                reference_count: 0,
                back_channel: BackChannel::new(),
            },
        };
        if let Ok(payload) = wire::encode(Encoding::Binary, &response) {
            reply(wire::ReleaseReply::fingerprint(version), payload);
        }
    } else if fingerprint == wire::ObjectReleasedSend::fingerprint(version) {
        let Ok(request) =
            wire::decode::<wire::ObjectReleasedSend>(Encoding::Binary, &envelope.payload)
        else {
            warn!("undecodable object_released frame dropped");
            return;
        };
        inbound_object_released(
            &transport,
            version,
            request.destination_zone,
            request.object,
            request.caller_zone,
            &request.back_channel,
        )
        .await;
    } else if fingerprint == wire::TransportDownSend::fingerprint(version) {
        let Ok(request) =
            wire::decode::<wire::TransportDownSend>(Encoding::Binary, &envelope.payload)
        else {
            warn!("undecodable transport_down frame dropped");
            return;
        };
        inbound_transport_down(
            &transport,
            version,
            request.destination_zone,
            request.caller_zone,
            &request.back_channel,
        )
        .await;
    } else if fingerprint == wire::CreateStubSend::fingerprint(version) {
        let Ok(request) =
            wire::decode::<wire::CreateStubSend>(Encoding::Binary, &envelope.payload)
        else {
            warn!("undecodable create_stub frame dropped");
            return;
        };
        let core = transport.core();
        core.set_adjacent_zone_id(request.caller_zone_id);
        let response = match transport.connection_handler() {
            Some(handler) => {
                match handler(request.input_descriptor, transport.clone()).await {
                    Ok(output_descriptor) => {
                        core.set_status(TransportStatus::Connected);
                        wire::CreateStubReply {
                            err_code: crate::error::OK,
                            responder_zone_id: core.zone_id(),
                            output_descriptor,
                        }
                    }
                    Err(e) => wire::CreateStubReply {
                        err_code: e.code(),
                        responder_zone_id: core.zone_id(),
                        output_descriptor: InterfaceDescriptor::NULL,
                    },
                }
            }
            None => {
                warn!(transport = core.name(), "handshake received but no connection handler set");
                wire::CreateStubReply {
                    err_code: RpcError::ZoneNotSupported.code(),
                    responder_zone_id: core.zone_id(),
                    output_descriptor: InterfaceDescriptor::NULL,
                }
            }
        };
        if let Ok(payload) = wire::encode(Encoding::Binary, &response) {
            reply(wire::CreateStubReply::fingerprint(version), payload);
        }
    } else {
        warn!(fingerprint, "unknown payload fingerprint dropped");
    }
}

/// Drive a transport into its terminal state: flip to DISCONNECTED, then
/// synthesise `transport_down` to every registered handler and let the
/// local service release everything the silent peer held.
pub async fn shutdown(transport: &Arc<dyn Transport>) {
    let core = transport.core();
    let previous = core.set_status(TransportStatus::Disconnected);
    if previous == TransportStatus::Disconnected {
        return;
    }
    info!(
        transport = core.name(),
        zone = %core.zone_id(),
        adjacent = %core.adjacent_zone_id(),
        "transport disconnected, notifying destinations"
    );

    for (destination, caller, handler) in core.pass_through_entries() {
        handler
            .transport_down(
                crate::PROTOCOL_VERSION,
                destination,
                caller,
                &BackChannel::new(),
            )
            .await;
    }

    if let Some(service) = core.service() {
        service.transport_lost(transport).await;
    }
}
