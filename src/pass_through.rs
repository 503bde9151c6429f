//! # Pass-Through Router
//!
//! When a call's route traverses a zone that owns neither endpoint, the
//! transport pair registers a `PassThrough` for the `(destination, caller)`
//! pair. It forwards every marshaller operation verbatim to the transport
//! matching the requested direction and keeps its own shared/optimistic
//! counts: the stake this hop holds in keeping both transports alive.
//!
//! A function-count gate tracks in-flight calls. Releases arriving while a
//! call is in flight are coalesced into a pending queue and flushed once
//! the gate drains, so a stub can never be freed mid-call and a release
//! never overtakes the add_ref that preceded it. The pass-through keeps
//! itself alive through a self-reference and deletes itself when its counts
//! reach zero or either transport disconnects, once no call is in flight.

use crate::error::{RpcError, RpcResult};
use crate::marshaller::{BackChannel, CallOutput, Marshaller};
use crate::service::Service;
use crate::transport::Transport;
use crate::types::{
    AddRefOptions, CallerZoneId, DestinationZoneId, Encoding, InterfaceOrdinal,
    KnownDirectionZoneId, MethodId, ObjectId, PassThroughStatus, ReleaseOptions, ZoneId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRelease {
    protocol_version: u64,
    destination_zone: DestinationZoneId,
    object: ObjectId,
    caller_zone: CallerZoneId,
    options: ReleaseOptions,
    count: u64,
}

/// Transit router installed in an intermediate zone.
pub struct PassThrough {
    zone_id: ZoneId,
    forward_destination: DestinationZoneId,
    reverse_destination: DestinationZoneId,
    forward_transport: Mutex<Option<Arc<dyn Transport>>>,
    reverse_transport: Mutex<Option<Arc<dyn Transport>>>,
    service: Mutex<Option<Arc<Service>>>,
    // The only place a component keeps itself alive: released when counts
    // and the function gate both reach zero.
    self_ref: Mutex<Option<Arc<PassThrough>>>,
    shared_count: AtomicU64,
    optimistic_count: AtomicU64,
    status: AtomicU8,
    function_count: AtomicU64,
    pending_releases: Mutex<Vec<PendingRelease>>,
    draining_pending: AtomicBool,
}

impl PassThrough {
    pub fn create(
        forward: Arc<dyn Transport>,
        reverse: Arc<dyn Transport>,
        service: Arc<Service>,
        forward_destination: DestinationZoneId,
        reverse_destination: DestinationZoneId,
    ) -> Arc<Self> {
        let zone_id = service.zone_id();
        let pt = Arc::new(Self {
            zone_id,
            forward_destination,
            reverse_destination,
            forward_transport: Mutex::new(Some(forward)),
            reverse_transport: Mutex::new(Some(reverse)),
            service: Mutex::new(Some(service.clone())),
            self_ref: Mutex::new(None),
            shared_count: AtomicU64::new(0),
            optimistic_count: AtomicU64::new(0),
            status: AtomicU8::new(PassThroughStatus::Connected as u8),
            function_count: AtomicU64::new(0),
            pending_releases: Mutex::new(Vec::new()),
            draining_pending: AtomicBool::new(false),
        });
        *pt.self_ref.lock() = Some(pt.clone());
        service.observers_pass_through_created(forward_destination, reverse_destination);
        pt
    }

    pub fn status(&self) -> PassThroughStatus {
        PassThroughStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn shared_count(&self) -> u64 {
        self.shared_count.load(Ordering::Acquire)
    }

    pub fn optimistic_count(&self) -> u64 {
        self.optimistic_count.load(Ordering::Acquire)
    }

    pub fn function_count(&self) -> u64 {
        self.function_count.load(Ordering::Acquire)
    }

    pub fn forward_destination(&self) -> DestinationZoneId {
        self.forward_destination
    }

    pub fn reverse_destination(&self) -> DestinationZoneId {
        self.reverse_destination
    }

    fn directional_transport(&self, destination: DestinationZoneId) -> Option<Arc<dyn Transport>> {
        if destination == self.forward_destination {
            self.forward_transport.lock().clone()
        } else if destination == self.reverse_destination {
            self.reverse_transport.lock().clone()
        } else {
            None
        }
    }

    fn is_disconnected(&self) -> bool {
        self.status() == PassThroughStatus::Disconnected
    }

    fn enter_call(&self) {
        self.function_count.fetch_add(1, Ordering::AcqRel);
    }

    fn exit_call(&self) -> u64 {
        self.function_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Post-call maintenance: run deferred teardown or flush queued
    /// releases once the function gate drained.
    async fn after_call(&self, protocol_version: u64, remaining: u64) {
        if remaining != 0 {
            return;
        }
        if self.is_disconnected() {
            self.trigger_self_destruction();
        } else if !self.draining_pending.load(Ordering::Acquire) {
            self.drain_pending_releases(protocol_version).await;
        }
    }

    fn queue_pending_release(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        options: ReleaseOptions,
    ) {
        let mut pending = self.pending_releases.lock();
        for entry in pending.iter_mut() {
            if entry.protocol_version == protocol_version
                && entry.destination_zone == destination_zone
                && entry.object == object
                && entry.caller_zone == caller_zone
                && entry.options == options
            {
                entry.count += 1;
                return;
            }
        }
        pending.push(PendingRelease {
            protocol_version,
            destination_zone,
            object,
            caller_zone,
            options,
            count: 1,
        });
    }

    async fn drain_pending_releases(&self, protocol_version: u64) {
        if self.draining_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.function_count.load(Ordering::Acquire) != 0 {
            self.draining_pending.store(false, Ordering::Release);
            return;
        }

        let pending: Vec<PendingRelease> = std::mem::take(&mut *self.pending_releases.lock());
        for entry in &pending {
            for _ in 0..entry.count {
                let version = if entry.protocol_version != 0 {
                    entry.protocol_version
                } else {
                    protocol_version
                };
                let _ = self
                    .release(
                        version,
                        entry.destination_zone,
                        entry.object,
                        entry.caller_zone,
                        entry.options,
                        &BackChannel::new(),
                    )
                    .await;
            }
        }

        self.draining_pending.store(false, Ordering::Release);
    }

    /// Discard a pass-through that lost a creation race before it carried
    /// any traffic. No table entries are touched.
    pub(crate) fn abandon(&self) {
        if let Some(service) = self.service.lock().take() {
            service
                .observers_pass_through_deleted(self.forward_destination, self.reverse_destination);
        }
        self.status
            .store(PassThroughStatus::Disconnected as u8, Ordering::Release);
        self.forward_transport.lock().take();
        self.reverse_transport.lock().take();
        self.self_ref.lock().take();
    }

    /// Flip to DISCONNECTED and, once no call is in flight, deregister from
    /// both transports and drop the self-reference. Idempotent: the
    /// self-reference acts as the cleanup gate.
    fn trigger_self_destruction(&self) {
        let old = PassThroughStatus::from_u8(
            self.status
                .swap(PassThroughStatus::Disconnected as u8, Ordering::AcqRel),
        );
        if old != PassThroughStatus::Disconnected {
            info!(
                zone = %self.zone_id,
                forward = %self.forward_destination,
                reverse = %self.reverse_destination,
                shared = self.shared_count(),
                optimistic = self.optimistic_count(),
                active = self.function_count(),
                "pass_through disconnecting"
            );
        }

        if self.function_count.load(Ordering::Acquire) > 0 {
            // Active calls still running; cleanup re-triggers when the gate
            // drains.
            return;
        }

        let Some(self_ref) = self.self_ref.lock().take() else {
            return;
        };

        if let Some(service) = self.service.lock().take() {
            service
                .observers_pass_through_deleted(self.forward_destination, self.reverse_destination);
        }
        if let Some(forward) = self.forward_transport.lock().take() {
            forward
                .core()
                .remove_destination_pair(self.forward_destination, self.reverse_destination);
        }
        if let Some(reverse) = self.reverse_transport.lock().take() {
            reverse
                .core()
                .remove_destination_pair(self.forward_destination, self.reverse_destination);
        }

        drop(self_ref);
    }
}

#[async_trait]
impl Marshaller for PassThrough {
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
        if self.is_disconnected() {
            return Err(RpcError::TransportError);
        }
        let transport = self
            .directional_transport(destination_zone)
            .ok_or(RpcError::ZoneNotFound)?;
        if transport.core().status() != crate::types::TransportStatus::Connected {
            self.trigger_self_destruction();
            return Err(RpcError::TransportError);
        }

        self.enter_call();
        let result = transport
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
        let remaining = self.exit_call();

        if matches!(result, Err(RpcError::TransportError)) {
            self.trigger_self_destruction();
        } else {
            self.after_call(protocol_version, remaining).await;
        }
        result
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
        if self.is_disconnected() {
            return;
        }
        let Some(transport) = self.directional_transport(destination_zone) else {
            return;
        };

        self.enter_call();
        transport
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
        let remaining = self.exit_call();
        self.after_call(protocol_version, remaining).await;
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
        if self.is_disconnected() {
            return Err(RpcError::TransportError);
        }
        let transport = self
            .directional_transport(destination_zone)
            .ok_or(RpcError::ZoneNotFound)?;
        if transport.core().status() != crate::types::TransportStatus::Connected {
            self.trigger_self_destruction();
            return Err(RpcError::TransportError);
        }

        self.enter_call();
        let result = transport
            .try_cast(
                protocol_version,
                caller_zone,
                destination_zone,
                object,
                interface,
                in_back_channel,
            )
            .await;
        let remaining = self.exit_call();

        if matches!(result, Err(RpcError::TransportError)) {
            self.trigger_self_destruction();
        } else {
            self.after_call(protocol_version, remaining).await;
        }
        result
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
        // When both route flags are set the add_ref is maintaining an
        // out-parameter's bidirectional chain; each flag is masked off
        // before forwarding so it traverses only its own route.
        let no_local_count = options.contains(AddRefOptions::BUILD_CALLER_ROUTE)
            && options.contains(AddRefOptions::BUILD_DESTINATION_ROUTE);
        let build_caller_route = options.contains(AddRefOptions::BUILD_CALLER_ROUTE);
        let build_destination_route = options.contains(AddRefOptions::BUILD_DESTINATION_ROUTE)
            || options == AddRefOptions::NORMAL
            || options == AddRefOptions::OPTIMISTIC;

        debug!(
            zone = %self.zone_id,
            forward = %self.forward_destination,
            reverse = %self.reverse_destination,
            destination = %destination_zone,
            caller = %caller_zone,
            options = options.0,
            build_destination_route,
            build_caller_route,
            no_local_count,
            "pass_through add_ref"
        );

        let destination_transport = if build_destination_route {
            let transport = self
                .directional_transport(destination_zone)
                .ok_or(RpcError::ZoneNotFound)?;
            if transport.core().status() != crate::types::TransportStatus::Connected {
                self.trigger_self_destruction();
                return Err(RpcError::TransportError);
            }
            Some(transport)
        } else {
            None
        };
        let caller_transport = if build_caller_route {
            let transport = self
                .directional_transport(caller_zone.as_destination())
                .ok_or(RpcError::ZoneNotFound)?;
            if transport.core().status() != crate::types::TransportStatus::Connected {
                self.trigger_self_destruction();
                return Err(RpcError::TransportError);
            }
            Some(transport)
        } else {
            None
        };

        if self.is_disconnected() {
            return Err(RpcError::TransportError);
        }

        self.enter_call();
        let mut reference_count = 0;

        if let Some(transport) = destination_transport {
            let result = transport
                .add_ref(
                    protocol_version,
                    destination_zone,
                    object,
                    caller_zone,
                    known_direction_zone,
                    options.without(AddRefOptions::BUILD_CALLER_ROUTE),
                    in_back_channel,
                )
                .await;
            match result {
                Ok(count) => reference_count = count,
                Err(e) => {
                    self.exit_call();
                    self.trigger_self_destruction();
                    return Err(e);
                }
            }
        }

        if let Some(transport) = caller_transport {
            let result = transport
                .add_ref(
                    protocol_version,
                    destination_zone,
                    object,
                    caller_zone,
                    known_direction_zone,
                    options.without(AddRefOptions::BUILD_DESTINATION_ROUTE),
                    in_back_channel,
                )
                .await;
            if let Err(e) = result {
                self.exit_call();
                self.trigger_self_destruction();
                return Err(e);
            }
        }

        let remaining = self.exit_call();

        if no_local_count && destination_zone.as_caller() == caller_zone {
            // Pure transit for an out-parameter back-pointer; counted on
            // neither tally.
        } else if options.is_optimistic() {
            self.optimistic_count.fetch_add(1, Ordering::AcqRel);
        } else {
            self.shared_count.fetch_add(1, Ordering::AcqRel);
        }

        self.after_call(protocol_version, remaining).await;
        Ok(reference_count)
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
        debug!(
            zone = %self.zone_id,
            forward = %self.forward_destination,
            reverse = %self.reverse_destination,
            destination = %destination_zone,
            caller = %caller_zone,
            options = options.0,
            "pass_through release"
        );

        if self.is_disconnected() {
            return Err(RpcError::TransportError);
        }

        // Never free a stub while a call is in flight: coalesce and flush
        // when the function gate drains.
        if self.function_count.load(Ordering::Acquire) > 0 {
            self.queue_pending_release(
                protocol_version,
                destination_zone,
                object,
                caller_zone,
                options,
            );
            return Ok(0);
        }

        let transport = self
            .directional_transport(destination_zone)
            .ok_or(RpcError::ZoneNotFound)?;
        if transport.core().status() != crate::types::TransportStatus::Connected {
            self.trigger_self_destruction();
            return Err(RpcError::TransportError);
        }

        self.enter_call();
        let result = transport
            .release(
                protocol_version,
                destination_zone,
                object,
                caller_zone,
                options,
                in_back_channel,
            )
            .await;
        let remaining = self.exit_call();

        let count = match result {
            Ok(count) => count,
            Err(e) => {
                self.trigger_self_destruction();
                return Err(e);
            }
        };

        let mut should_delete = false;
        if options.is_optimistic() {
            match self
                .optimistic_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            {
                Ok(previous) => {
                    if previous == 1 && self.shared_count.load(Ordering::Acquire) == 0 {
                        should_delete = true;
                    }
                }
                Err(_) => {
                    error!(
                        zone = %self.zone_id,
                        code = RpcError::ReferenceCountError.code(),
                        "optimistic release with no outstanding pass_through count"
                    );
                }
            }
        } else {
            match self
                .shared_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            {
                Ok(previous) => {
                    if previous == 1 && self.optimistic_count.load(Ordering::Acquire) == 0 {
                        should_delete = true;
                    }
                }
                Err(_) => {
                    error!(
                        zone = %self.zone_id,
                        code = RpcError::ReferenceCountError.code(),
                        "shared release with no outstanding pass_through count"
                    );
                }
            }
        }

        if should_delete {
            self.trigger_self_destruction();
        } else {
            self.after_call(protocol_version, remaining).await;
        }

        Ok(count)
    }

    async fn object_released(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    ) {
        if self.is_disconnected() {
            return;
        }

        self.enter_call();

        // The notification travels toward the caller side.
        if let Some(transport) = self.directional_transport(caller_zone.as_destination()) {
            if transport.core().status() != crate::types::TransportStatus::Connected {
                self.exit_call();
                self.trigger_self_destruction();
                return;
            }
            transport
                .object_released(
                    protocol_version,
                    destination_zone,
                    object,
                    caller_zone,
                    in_back_channel,
                )
                .await;
        }

        let remaining = self.exit_call();

        match self
            .optimistic_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(previous) => {
                if previous == 1
                    && self.shared_count.load(Ordering::Acquire) == 0
                    && remaining == 0
                {
                    self.trigger_self_destruction();
                    return;
                }
            }
            Err(_) => {
                error!(
                    zone = %self.zone_id,
                    code = RpcError::ReferenceCountError.code(),
                    "object_released with no outstanding optimistic count"
                );
            }
        }

        self.after_call(protocol_version, remaining).await;
    }

    async fn transport_down(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    ) {
        // Propagate first so downstream zones learn of the failure, then
        // tear down this hop.
        if let Some(transport) = self.directional_transport(destination_zone) {
            transport
                .transport_down(
                    protocol_version,
                    destination_zone,
                    caller_zone,
                    in_back_channel,
                )
                .await;
        }

        self.status
            .store(PassThroughStatus::Disconnected as u8, Ordering::Release);

        if self.function_count.load(Ordering::Acquire) == 0 {
            self.trigger_self_destruction();
        }
    }
}
