//! # Service: the Per-Zone Registry
//!
//! One `Service` exists per zone. It owns the stub table (and the reverse
//! table keyed by implementation address), tracks the service proxies and
//! transports that reach other zones, and is the inbound [`Marshaller`]
//! entry every transport delivers local traffic to.
//!
//! A service's lifetime is jointly pinned by every stub it owns and every
//! service proxy that references it. A child zone is an ordinary service
//! whose `parent_transport` field is set: the strong link keeps the parent
//! zone reachable for as long as the child exists.

use crate::bindings::{self, RemoteInterface};
use crate::error::{RpcError, RpcResult};
use crate::marshaller::{BackChannel, CallOutput, Marshaller};
use crate::pointers::Shared;
use crate::service_proxy::ServiceProxy;
use crate::stub::{InterfaceStub, ObjectStub};
use crate::telemetry::ServiceObserver;
use crate::transport::Transport;
use crate::types::{
    AddRefOptions, CallerZoneId, DestinationZoneId, Encoding, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZoneId, MethodId, ObjectId, ReleaseOptions, ZoneId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

static ZONE_ID_GENERATOR: AtomicU64 = AtomicU64::new(1);

/// Factory producing a sibling interface stub from an existing one, as
/// registered by generated `register_stubs` code.
pub type StubCastFactory =
    Arc<dyn Fn(&Arc<dyn InterfaceStub>) -> Option<Arc<dyn InterfaceStub>> + Send + Sync>;

/// The per-zone registry and inbound marshaller.
pub struct Service {
    name: String,
    zone_id: ZoneId,
    object_id_generator: AtomicU64,
    // Interop knob: the highest protocol version this zone will accept.
    max_protocol_version: AtomicU64,
    stubs: Mutex<HashMap<ObjectId, Weak<ObjectStub>>>,
    // Reverse table: implementation address -> stub, so binding the same
    // object twice reuses its stub.
    wrapped_objects: Mutex<HashMap<usize, Weak<ObjectStub>>>,
    other_zones: Mutex<HashMap<DestinationZoneId, Weak<ServiceProxy>>>,
    // Route table: destination -> edge. Adjacent zones are entered
    // explicitly; farther destinations are learned as routes get built.
    transports: Mutex<HashMap<DestinationZoneId, Weak<dyn Transport>>>,
    observers: Mutex<Vec<Weak<dyn ServiceObserver>>>,
    // Interface-stub factories registered by generated code; consulted
    // when try_cast needs an interface a stub does not carry yet.
    stub_factories: Mutex<HashMap<InterfaceOrdinal, StubCastFactory>>,
    // Set on child zones: keeps the parent zone reachable.
    parent_transport: Mutex<Option<Arc<dyn Transport>>>,
    parent_zone_id: Mutex<Option<DestinationZoneId>>,
    self_weak: Weak<Service>,
}

impl Service {
    pub fn new(name: &str, zone_id: ZoneId) -> Arc<Self> {
        debug!(%zone_id, name, "service created");
        Arc::new_cyclic(|self_weak| Self {
            name: name.to_string(),
            zone_id,
            object_id_generator: AtomicU64::new(1),
            max_protocol_version: AtomicU64::new(crate::PROTOCOL_VERSION),
            stubs: Mutex::new(HashMap::new()),
            wrapped_objects: Mutex::new(HashMap::new()),
            other_zones: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            stub_factories: Mutex::new(HashMap::new()),
            parent_transport: Mutex::new(None),
            parent_zone_id: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    /// Hand out a federation-unique zone id.
    pub fn generate_zone_id() -> ZoneId {
        ZoneId(ZONE_ID_GENERATOR.fetch_add(1, Ordering::AcqRel))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    pub fn generate_object_id(&self) -> ObjectId {
        ObjectId(self.object_id_generator.fetch_add(1, Ordering::AcqRel))
    }

    fn self_arc(&self) -> Arc<Service> {
        self.self_weak
            .upgrade()
            .expect("service invoked after teardown")
    }

    /// Cap the protocol version this zone accepts; used when interoperating
    /// with older peers.
    pub fn set_max_protocol_version(&self, version: u64) {
        let clamped = version.clamp(crate::LOWEST_SUPPORTED_VERSION, crate::PROTOCOL_VERSION);
        self.max_protocol_version.store(clamped, Ordering::Release);
    }

    pub fn max_protocol_version(&self) -> u64 {
        self.max_protocol_version.load(Ordering::Acquire)
    }

    fn check_version(&self, protocol_version: u64) -> RpcResult<()> {
        if protocol_version < crate::LOWEST_SUPPORTED_VERSION
            || protocol_version > self.max_protocol_version()
        {
            return Err(RpcError::InvalidVersion);
        }
        Ok(())
    }

    /// True when no stubs and no live service proxies remain.
    pub fn check_is_empty(&self) -> bool {
        let stubs_empty = self
            .stubs
            .lock()
            .values()
            .all(|weak| weak.strong_count() == 0);
        let zones_empty = self
            .other_zones
            .lock()
            .values()
            .all(|weak| weak.strong_count() == 0);
        stubs_empty && zones_empty
    }

    pub fn stub_count(&self) -> usize {
        self.stubs
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /////////////////////////////////
    // Observer notification
    /////////////////////////////////

    pub fn add_observer(&self, observer: &Arc<dyn ServiceObserver>) {
        let mut observers = self.observers.lock();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.push(Arc::downgrade(observer));
    }

    fn live_observers(&self) -> Vec<Arc<dyn ServiceObserver>> {
        self.observers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn notify_object_released_event(
        &self,
        object: ObjectId,
        destination: DestinationZoneId,
    ) {
        for observer in self.live_observers() {
            observer.on_object_released(object, destination);
        }
    }

    pub(crate) fn observers_object_proxy_created(
        &self,
        destination: DestinationZoneId,
        object: ObjectId,
    ) {
        for observer in self.live_observers() {
            observer.on_object_proxy_created(self.zone_id, destination, object);
        }
    }

    pub(crate) fn observers_pass_through_created(
        &self,
        forward: DestinationZoneId,
        reverse: DestinationZoneId,
    ) {
        for observer in self.live_observers() {
            observer.on_pass_through_created(self.zone_id, forward, reverse);
        }
    }

    pub(crate) fn observers_pass_through_deleted(
        &self,
        forward: DestinationZoneId,
        reverse: DestinationZoneId,
    ) {
        for observer in self.live_observers() {
            observer.on_pass_through_deleted(self.zone_id, forward, reverse);
        }
    }

    /////////////////////////////////
    // Transport and zone-proxy registry
    /////////////////////////////////

    pub fn add_transport(&self, destination: DestinationZoneId, transport: &Arc<dyn Transport>) {
        self.transports
            .lock()
            .insert(destination, Arc::downgrade(transport));
    }

    pub fn remove_transport(&self, destination: DestinationZoneId) {
        self.transports.lock().remove(&destination);
    }

    pub fn get_transport(&self, destination: DestinationZoneId) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .get(&destination)
            .and_then(Weak::upgrade)
    }

    /// Resolve the edge a call for `destination` should leave through.
    /// Falls back to the caller's direction hint, the parent link, then the
    /// only edge of a single-edge zone; successful fallbacks are learned
    /// into the route table.
    pub fn route_transport(
        &self,
        destination: DestinationZoneId,
        known_direction: KnownDirectionZoneId,
    ) -> Option<Arc<dyn Transport>> {
        {
            let transports = self.transports.lock();
            if let Some(transport) = transports.get(&destination).and_then(Weak::upgrade) {
                return Some(transport);
            }
        }

        let hint = DestinationZoneId(known_direction.value());
        if !known_direction.is_null() {
            let found = self
                .transports
                .lock()
                .get(&hint)
                .and_then(Weak::upgrade);
            if let Some(transport) = found {
                self.add_transport(destination, &transport);
                return Some(transport);
            }
        }

        if let Some(parent) = self.parent_transport.lock().clone() {
            self.add_transport(destination, &parent);
            return Some(parent);
        }

        let live: Vec<Arc<dyn Transport>> = {
            let transports = self.transports.lock();
            let mut live: Vec<Arc<dyn Transport>> = Vec::new();
            for transport in transports.values().filter_map(Weak::upgrade) {
                let ptr = Arc::as_ptr(&transport) as *const ();
                if !live
                    .iter()
                    .any(|t| std::ptr::eq(Arc::as_ptr(t) as *const (), ptr))
                {
                    live.push(transport);
                }
            }
            live
        };
        if live.len() == 1 {
            let only = live.into_iter().next().unwrap();
            self.add_transport(destination, &only);
            return Some(only);
        }
        None
    }

    pub fn add_zone_proxy(&self, proxy: &Arc<ServiceProxy>) {
        self.other_zones
            .lock()
            .insert(proxy.destination_zone_id(), Arc::downgrade(proxy));
    }

    pub fn get_zone_proxy(&self, destination: DestinationZoneId) -> Option<Arc<ServiceProxy>> {
        self.other_zones
            .lock()
            .get(&destination)
            .and_then(Weak::upgrade)
    }

    /// Called from `ServiceProxy::drop`; only clears an entry whose proxy
    /// is really gone, so a replacement registered in the meantime
    /// survives.
    pub(crate) fn remove_zone_proxy_if_dead(&self, destination: DestinationZoneId) {
        let mut zones = self.other_zones.lock();
        if let Some(weak) = zones.get(&destination) {
            if weak.strong_count() == 0 {
                zones.remove(&destination);
            }
        }
    }

    /// Find the service proxy for a destination, creating one routed over
    /// the right edge when this zone has none yet.
    pub fn get_or_create_zone_proxy(
        &self,
        destination: DestinationZoneId,
        known_direction: KnownDirectionZoneId,
    ) -> RpcResult<(Arc<ServiceProxy>, bool)> {
        if let Some(existing) = self.get_zone_proxy(destination) {
            return Ok((existing, false));
        }
        let transport = self
            .route_transport(destination, known_direction)
            .ok_or(RpcError::ZoneNotFound)?;
        let proxy = ServiceProxy::create("inferred", self.self_arc(), &transport, destination);
        self.add_zone_proxy(&proxy);
        debug!(zone = %self.zone_id, %destination, "created inferred service proxy");
        Ok((proxy, true))
    }

    /////////////////////////////////
    // Parent linkage (child zones)
    /////////////////////////////////

    pub fn set_parent_transport(
        &self,
        transport: &Arc<dyn Transport>,
        parent_zone: DestinationZoneId,
    ) {
        *self.parent_transport.lock() = Some(transport.clone());
        *self.parent_zone_id.lock() = Some(parent_zone);
    }

    pub fn parent_transport(&self) -> Option<Arc<dyn Transport>> {
        self.parent_transport.lock().clone()
    }

    pub fn parent_zone_id(&self) -> Option<DestinationZoneId> {
        *self.parent_zone_id.lock()
    }

    /////////////////////////////////
    // Stub registry
    /////////////////////////////////

    /// Register a factory able to cast existing stubs to `interface`.
    /// Called by generated registration code at service construction; not
    /// intended for use once traffic is flowing.
    pub fn add_interface_stub_factory(
        &self,
        interface: InterfaceOrdinal,
        factory: StubCastFactory,
    ) {
        self.stub_factories.lock().insert(interface, factory);
    }

    pub(crate) fn cast_with_factories(
        &self,
        interface: InterfaceOrdinal,
        existing: &Arc<dyn InterfaceStub>,
    ) -> Option<Arc<dyn InterfaceStub>> {
        let factory = self.stub_factories.lock().get(&interface).cloned();
        factory.and_then(|factory| factory(existing))
    }

    pub fn get_object(&self, object: ObjectId) -> Option<Arc<ObjectStub>> {
        self.stubs.lock().get(&object).and_then(Weak::upgrade)
    }

    /// Find or create the stub wrapping `target_address`, add the caller's
    /// reference, and produce the on-wire descriptor. With `outcall` set
    /// the reference is an out-parameter and the return-path route is built
    /// before the descriptor leaves.
    pub async fn get_proxy_stub_descriptor(
        &self,
        caller_zone: CallerZoneId,
        target_address: usize,
        factory: &(dyn Fn(&Arc<ObjectStub>) -> Arc<dyn InterfaceStub> + Sync),
        outcall: bool,
    ) -> RpcResult<(Arc<ObjectStub>, InterfaceDescriptor)> {
        let (stub, created) = {
            let mut wrapped = self.wrapped_objects.lock();
            match wrapped.get(&target_address).and_then(Weak::upgrade) {
                Some(existing) => (existing, false),
                None => {
                    let id = self.generate_object_id();
                    let stub = ObjectStub::new(id, self.self_arc());
                    let interface = factory(&stub);
                    stub.add_interface(interface);
                    wrapped.insert(target_address, Arc::downgrade(&stub));
                    self.stubs.lock().insert(id, Arc::downgrade(&stub));
                    stub.keep_self_alive();
                    (stub, true)
                }
            }
        };
        if created {
            for observer in self.live_observers() {
                observer.on_stub_created(self.zone_id, stub.id());
            }
        }

        if let Err(e) = stub.add_ref(false, outcall, caller_zone).await {
            if stub.shared_count() == 0 {
                self.remove_stub(&stub);
            }
            return Err(e);
        }

        let descriptor = InterfaceDescriptor::new(stub.id(), self.zone_id.as_destination());
        Ok((stub, descriptor))
    }

    fn remove_stub(&self, stub: &Arc<ObjectStub>) {
        self.stubs.lock().remove(&stub.id());
        if let Some(interface) = stub.first_interface() {
            self.wrapped_objects.lock().remove(&interface.target_address());
        }
        stub.reset_self();
        for observer in self.live_observers() {
            observer.on_stub_deleted(self.zone_id, stub.id());
        }
        debug!(zone = %self.zone_id, object = %stub.id(), "stub removed");
    }

    /// Release one reference on a local stub, tearing the stub down when
    /// its shared total reaches zero. Callers still holding optimistic
    /// handles are notified that the object is gone.
    pub fn release_local_stub(
        &self,
        stub: &Arc<ObjectStub>,
        is_optimistic: bool,
        caller_zone: CallerZoneId,
    ) -> RpcResult<u64> {
        let count = stub.release(is_optimistic, caller_zone)?;
        if !is_optimistic && count == 0 {
            let optimistic_callers = stub.optimistic_callers();
            let object = stub.id();
            let destination = self.zone_id.as_destination();
            for optimistic_caller in optimistic_callers {
                if optimistic_caller.as_zone() == self.zone_id {
                    continue;
                }
                if let Some(transport) = self
                    .route_transport(optimistic_caller.as_destination(), KnownDirectionZoneId::NULL)
                {
                    crate::sync::spawn(async move {
                        transport
                            .object_released(
                                crate::PROTOCOL_VERSION,
                                destination,
                                object,
                                optimistic_caller,
                                &BackChannel::new(),
                            )
                            .await;
                    });
                }
            }
            self.remove_stub(stub);
        }
        Ok(count)
    }

    /////////////////////////////////
    // Bootstrap
    /////////////////////////////////

    /// Connect this zone to a peer over `transport`: bind `input_interface`
    /// into a descriptor, run the transport handshake, and demarshal the
    /// peer's output descriptor. Registration is undone on failure.
    pub async fn connect_to_zone<TIn, TOut>(
        &self,
        name: &str,
        transport: Arc<dyn Transport>,
        input_interface: Option<&Shared<TIn>>,
    ) -> RpcResult<Option<Shared<TOut>>>
    where
        TIn: RemoteInterface + ?Sized,
        TOut: RemoteInterface + ?Sized,
    {
        let adjacent = transport.core().adjacent_zone_id();
        self.add_transport(adjacent.as_destination(), &transport);

        let mut input_descriptor = InterfaceDescriptor::NULL;
        let mut bound_stub = None;
        if let Some(input) = input_interface {
            match bindings::create_interface_stub(&self.self_arc(), input, adjacent.as_caller())
                .await
            {
                Ok((stub, descriptor)) => {
                    input_descriptor = descriptor;
                    bound_stub = Some(stub);
                }
                Err(e) => {
                    self.remove_transport(adjacent.as_destination());
                    return Err(e);
                }
            }
        }

        let output_descriptor = match transport.inner_connect(input_descriptor).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(zone = %self.zone_id, error = %e, "zone connection handshake failed");
                if let Some(stub) = bound_stub {
                    let _ = self.release_local_stub(&stub, false, adjacent.as_caller());
                }
                self.remove_transport(adjacent.as_destination());
                return Err(e);
            }
        };

        // The accept side may only have learned our identity during the
        // handshake and vice versa.
        let adjacent = transport.core().adjacent_zone_id();
        self.add_transport(adjacent.as_destination(), &transport);

        let proxy = ServiceProxy::create(
            name,
            self.self_arc(),
            &transport,
            adjacent.as_destination(),
        );
        self.add_zone_proxy(&proxy);

        if output_descriptor.is_null() {
            return Ok(None);
        }
        bindings::demarshal_interface_proxy::<TOut>(
            crate::PROTOCOL_VERSION,
            &proxy,
            output_descriptor,
        )
        .await
    }

    /// Peer side of the bootstrap: demarshal the caller's input descriptor,
    /// run the user factory, and marshal the factory's result into the
    /// output descriptor.
    pub async fn attach_remote_zone<TParent, TChild, F, Fut>(
        &self,
        name: &str,
        transport: Arc<dyn Transport>,
        input_descriptor: InterfaceDescriptor,
        factory: F,
    ) -> RpcResult<InterfaceDescriptor>
    where
        TParent: RemoteInterface + ?Sized,
        TChild: RemoteInterface + ?Sized,
        F: FnOnce(Option<Shared<TParent>>, Arc<Service>) -> Fut,
        Fut: Future<Output = RpcResult<Shared<TChild>>>,
    {
        let adjacent = transport.core().adjacent_zone_id();
        let transport_key = if input_descriptor.is_null() {
            adjacent.as_destination()
        } else {
            input_descriptor.destination_zone
        };

        let parent = if !input_descriptor.is_null() {
            self.add_transport(transport_key, &transport);
            let proxy =
                ServiceProxy::create(name, self.self_arc(), &transport, transport_key);
            self.add_zone_proxy(&proxy);
            match bindings::demarshal_interface_proxy::<TParent>(
                crate::PROTOCOL_VERSION,
                &proxy,
                input_descriptor,
            )
            .await
            {
                Ok(parent) => parent,
                Err(e) => {
                    self.remove_transport(transport_key);
                    return Err(e);
                }
            }
        } else {
            self.add_transport(transport_key, &transport);
            None
        };

        let child = match factory(parent, self.self_arc()).await {
            Ok(child) => child,
            Err(e) => {
                self.remove_transport(transport_key);
                return Err(e);
            }
        };
        if !child.is_local() {
            // Remote pointers cannot represent a subordinate zone that has
            // not been registered yet.
            error!(zone = %self.zone_id, "attach factory returned a non-local interface");
            return Err(RpcError::InvalidData);
        }

        let (_stub, descriptor) =
            bindings::create_interface_stub(&self.self_arc(), &child, adjacent.as_caller()).await?;
        Ok(descriptor)
    }

    /// Bootstrap a subordinate zone pinned to a parent transport.
    pub async fn create_child_zone<TParent, TChild, F, Fut>(
        name: &str,
        parent_transport: Arc<dyn Transport>,
        input_descriptor: InterfaceDescriptor,
        factory: F,
    ) -> RpcResult<(Arc<Service>, InterfaceDescriptor)>
    where
        TParent: RemoteInterface + ?Sized,
        TChild: RemoteInterface + ?Sized,
        F: FnOnce(Option<Shared<TParent>>, Arc<Service>) -> Fut,
        Fut: Future<Output = RpcResult<Shared<TChild>>>,
    {
        let zone_id = parent_transport.core().zone_id();
        let parent_zone = if input_descriptor.is_null() {
            parent_transport.core().adjacent_zone_id().as_destination()
        } else {
            input_descriptor.destination_zone
        };

        let child = Service::new(name, zone_id);
        parent_transport.core().set_service(&child);
        child.set_parent_transport(&parent_transport, parent_zone);

        let proxy = ServiceProxy::create("parent", child.clone(), &parent_transport, parent_zone);
        child.add_transport(parent_zone, &parent_transport);
        child.add_zone_proxy(&proxy);

        let parent = if !input_descriptor.is_null() {
            bindings::demarshal_interface_proxy::<TParent>(
                crate::PROTOCOL_VERSION,
                &proxy,
                input_descriptor,
            )
            .await?
        } else {
            None
        };

        let child_interface = factory(parent, child.clone()).await?;
        if !child_interface.is_local() {
            error!(zone = %child.zone_id, "child factory returned a non-local interface");
            return Err(RpcError::InvalidData);
        }

        let caller = parent_transport.core().adjacent_zone_id().as_caller();
        let (_stub, descriptor) =
            bindings::create_interface_stub(&child.self_arc(), &child_interface, caller).await?;
        Ok((child, descriptor))
    }

    /////////////////////////////////
    // Disconnect handling
    /////////////////////////////////

    /// React to the loss of one of this zone's edges: every destination
    /// routed over it becomes unreachable, its service proxies are
    /// poisoned, and stub references held by the silent zones are
    /// synthesised away.
    pub async fn transport_lost(&self, transport: &Arc<dyn Transport>) {
        let transport_ptr = Arc::as_ptr(transport) as *const () as usize;
        let mut lost: Vec<DestinationZoneId> = Vec::new();
        {
            let transports = self.transports.lock();
            for (destination, weak) in transports.iter() {
                let same = weak
                    .upgrade()
                    .map(|t| Arc::as_ptr(&t) as *const () as usize == transport_ptr)
                    .unwrap_or(false);
                if same {
                    lost.push(*destination);
                }
            }
        }
        let adjacent = transport.core().adjacent_zone_id().as_destination();
        if !adjacent.is_null() && !lost.contains(&adjacent) {
            lost.push(adjacent);
        }

        warn!(
            zone = %self.zone_id,
            ?lost,
            "transport lost, cleaning up unreachable destinations"
        );

        for destination in &lost {
            self.remove_transport(*destination);
            if let Some(proxy) = self.get_zone_proxy(*destination) {
                proxy.mark_remote_gone();
            }
        }

        {
            let parent = self.parent_transport.lock().clone();
            if let Some(parent) = parent {
                if Arc::as_ptr(&parent) as *const () as usize == transport_ptr {
                    self.parent_transport.lock().take();
                    self.parent_zone_id.lock().take();
                }
            }
        }

        for destination in lost {
            self.transport_down(
                crate::PROTOCOL_VERSION,
                self.zone_id.as_destination(),
                destination.as_caller(),
                &BackChannel::new(),
            )
            .await;
        }
    }

    /////////////////////////////////
    // Outbound extension points
    /////////////////////////////////
    // Derived services may intercept these to add or consume back-channel
    // state; the base implementations forward to the transport unchanged.

    #[allow(clippy::too_many_arguments)]
    pub async fn outbound_send(
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
        transport: &Arc<dyn Transport>,
    ) -> RpcResult<CallOutput> {
        transport
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
    pub async fn outbound_post(
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
        transport: &Arc<dyn Transport>,
    ) {
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
            .await
    }

    pub async fn outbound_try_cast(
        &self,
        protocol_version: u64,
        caller_zone: CallerZoneId,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        interface: InterfaceOrdinal,
        in_back_channel: &BackChannel,
        transport: &Arc<dyn Transport>,
    ) -> RpcResult<BackChannel> {
        transport
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
    pub async fn outbound_add_ref(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        known_direction_zone: KnownDirectionZoneId,
        options: AddRefOptions,
        in_back_channel: &BackChannel,
        transport: &Arc<dyn Transport>,
    ) -> RpcResult<u64> {
        transport
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

    #[allow(clippy::too_many_arguments)]
    pub async fn outbound_release(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        options: ReleaseOptions,
        in_back_channel: &BackChannel,
        transport: &Arc<dyn Transport>,
    ) -> RpcResult<u64> {
        transport
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
}

#[async_trait]
impl Marshaller for Service {
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
        if destination_zone.as_zone() == self.zone_id {
            self.check_version(protocol_version)?;
            let stub = self.get_object(object).ok_or(RpcError::ObjectNotFound)?;
            let data = stub
                .call(
                    protocol_version,
                    encoding,
                    caller_zone,
                    interface,
                    method,
                    in_data,
                )
                .await?;
            return Ok(CallOutput {
                data,
                back_channel: BackChannel::new(),
            });
        }

        let transport = self
            .route_transport(destination_zone, KnownDirectionZoneId::NULL)
            .ok_or(RpcError::ZoneNotFound)?;
        transport
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
        if destination_zone.as_zone() == self.zone_id {
            if self.check_version(protocol_version).is_err() {
                return;
            }
            let Some(stub) = self.get_object(object) else {
                debug!(%object, "post for unknown object dropped");
                return;
            };
            let _ = stub
                .call(
                    protocol_version,
                    encoding,
                    caller_zone,
                    interface,
                    method,
                    in_data,
                )
                .await;
            return;
        }

        if let Some(transport) =
            self.route_transport(destination_zone, KnownDirectionZoneId::NULL)
        {
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
        }
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
        if destination_zone.as_zone() == self.zone_id {
            self.check_version(protocol_version)?;
            let stub = self.get_object(object).ok_or(RpcError::ObjectNotFound)?;
            stub.try_cast(interface)?;
            return Ok(BackChannel::new());
        }

        let transport = self
            .route_transport(destination_zone, KnownDirectionZoneId::NULL)
            .ok_or(RpcError::ZoneNotFound)?;
        transport
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
        // A caller-route-only add_ref terminates at the caller's own zone
        // as a pure route acknowledgement: the intermediate hops have
        // installed their entries and nothing is counted at the ends. This
        // is checked before local dispatch so a back-pointer whose
        // destination and caller coincide is not double-counted.
        if caller_zone.as_zone() == self.zone_id
            && options.contains(AddRefOptions::BUILD_CALLER_ROUTE)
            && !options.contains(AddRefOptions::BUILD_DESTINATION_ROUTE)
        {
            self.check_version(protocol_version)?;
            debug!(
                zone = %self.zone_id,
                %destination_zone,
                "return-path route established"
            );
            return Ok(0);
        }

        if destination_zone.as_zone() == self.zone_id {
            self.check_version(protocol_version)?;
            let stub = self.get_object(object).ok_or(RpcError::ObjectNotFound)?;
            // A caller-route flag at the stub's zone means this reference is
            // an out-parameter: walk the return path now so it exists before
            // the call completes.
            let outcall = options.contains(AddRefOptions::BUILD_CALLER_ROUTE);
            return stub
                .add_ref(options.is_optimistic(), outcall, caller_zone)
                .await;
        }

        let transport = self
            .route_transport(destination_zone, known_direction_zone)
            .ok_or(RpcError::ZoneNotFound)?;
        transport
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

    async fn release(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        options: ReleaseOptions,
        in_back_channel: &BackChannel,
    ) -> RpcResult<u64> {
        if destination_zone.as_zone() == self.zone_id {
            self.check_version(protocol_version)?;
            let stub = self.get_object(object).ok_or(RpcError::ObjectNotFound)?;
            return self.release_local_stub(&stub, options.is_optimistic(), caller_zone);
        }

        let transport = self
            .route_transport(destination_zone, KnownDirectionZoneId::NULL)
            .ok_or(RpcError::ZoneNotFound)?;
        transport
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

    async fn object_released(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    ) {
        if destination_zone.as_zone() == self.zone_id {
            // A caller zone pre-released an optimistic handle on one of our
            // stubs.
            match self.get_object(object) {
                Some(stub) => stub.optimistic_released_from(caller_zone),
                None => debug!(%object, "object_released for unknown stub"),
            }
            return;
        }

        if caller_zone.as_zone() == self.zone_id {
            // A stub this zone observed is gone; poison the proxy so
            // optimistic handles see OBJECT_GONE locally.
            if let Some(proxy) = self.get_zone_proxy(destination_zone) {
                proxy.mark_object_gone(object);
            }
            self.notify_object_released_event(object, destination_zone);
            return;
        }

        if let Some(transport) =
            self.route_transport(caller_zone.as_destination(), KnownDirectionZoneId::NULL)
        {
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
    }

    async fn transport_down(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    ) {
        if destination_zone.as_zone() == self.zone_id {
            debug!(zone = %self.zone_id, caller = %caller_zone, "processing transport_down");
            let stubs: Vec<Arc<ObjectStub>> = self
                .stubs
                .lock()
                .values()
                .filter_map(Weak::upgrade)
                .collect();
            for stub in stubs {
                if stub.has_references_from_zone(caller_zone)
                    && stub.release_all_from_zone(caller_zone)
                {
                    self.remove_stub(&stub);
                }
            }
            if let Some(proxy) = self.get_zone_proxy(caller_zone.as_destination()) {
                proxy.mark_remote_gone();
            }
            return;
        }

        if let Some(transport) =
            self.route_transport(destination_zone, KnownDirectionZoneId::NULL)
        {
            transport
                .transport_down(
                    protocol_version,
                    destination_zone,
                    caller_zone,
                    in_back_channel,
                )
                .await;
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        debug!(zone = %self.zone_id, name = %self.name, "service destroyed");
    }
}
