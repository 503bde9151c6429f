//! # Server Side: Object and Interface Stubs
//!
//! An `ObjectStub` wraps one local implementation and owns everything the
//! zone needs to serve it remotely: the interface stubs that decode and
//! dispatch calls, the shared and optimistic reference totals, and the
//! per-caller-zone breakdown of those totals that makes `transport_down`
//! cleanup possible.
//!
//! Invariants:
//! - `shared_count == Σ shared_references[caller]`, likewise optimistic;
//! - a stub with `shared_count == 0` is removed from its service's stub map
//!   and torn down;
//! - the stub keeps its service alive (strong reference) while it exists.

use crate::error::{RpcError, RpcResult};
use crate::service::Service;
use crate::types::{
    AddRefOptions, CallerZoneId, Encoding, InterfaceOrdinal, KnownDirectionZoneId, MethodId,
    ObjectId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Contract of a generated interface stub: decode an inbound call envelope,
/// invoke the wrapped implementation, encode the reply.
///
/// One `ObjectStub` holds one of these per interface the object serves;
/// `cast` produces a sibling stub when the implementation supports another
/// interface contract.
#[async_trait]
pub trait InterfaceStub: Send + Sync {
    /// Interface ordinal at the given protocol version.
    fn interface_id(&self, protocol_version: u64) -> InterfaceOrdinal;

    /// Dispatch a decoded call to the wrapped implementation.
    async fn call(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        caller_zone: CallerZoneId,
        method: MethodId,
        in_data: &[u8],
    ) -> RpcResult<Vec<u8>>;

    /// Produce a stub for a sibling interface, if the implementation
    /// supports it.
    fn cast(&self, interface: InterfaceOrdinal) -> RpcResult<Option<Arc<dyn InterfaceStub>>>;

    /// Address of the wrapped implementation, used for reverse lookup so
    /// binding the same object twice reuses its stub.
    fn target_address(&self) -> usize;

    /// Downcast support for same-zone descriptor resolution.
    fn as_any(&self) -> &dyn Any;
}

/// Server-side endpoint for one local object.
pub struct ObjectStub {
    id: ObjectId,
    // Keeps the service alive while any stub it hosts exists.
    service: Arc<Service>,
    stub_map: Mutex<HashMap<InterfaceOrdinal, Arc<dyn InterfaceStub>>>,
    // Self-reference: the stub owns itself while shared_count > 0; the
    // service map only holds a weak edge.
    self_ref: Mutex<Option<Arc<ObjectStub>>>,
    self_weak: Weak<ObjectStub>,
    shared_count: AtomicU64,
    optimistic_count: AtomicU64,
    shared_references: Mutex<HashMap<CallerZoneId, u64>>,
    optimistic_references: Mutex<HashMap<CallerZoneId, u64>>,
}

impl ObjectStub {
    pub fn new(id: ObjectId, service: Arc<Service>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            id,
            service,
            stub_map: Mutex::new(HashMap::new()),
            self_ref: Mutex::new(None),
            self_weak: self_weak.clone(),
            shared_count: AtomicU64::new(0),
            optimistic_count: AtomicU64::new(0),
            shared_references: Mutex::new(HashMap::new()),
            optimistic_references: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn shared_count(&self) -> u64 {
        self.shared_count.load(Ordering::Acquire)
    }

    pub fn optimistic_count(&self) -> u64 {
        self.optimistic_count.load(Ordering::Acquire)
    }

    /// Activate lifetime management once the stub has been inserted into the
    /// service map.
    pub fn keep_self_alive(&self) {
        *self.self_ref.lock() = self.self_weak.upgrade();
    }

    /// Drop the self-reference; the stub dies when the last external handle
    /// goes.
    pub fn reset_self(&self) {
        self.self_ref.lock().take();
    }

    pub fn add_interface(&self, iface: Arc<dyn InterfaceStub>) {
        let id = iface.interface_id(crate::PROTOCOL_VERSION);
        self.stub_map.lock().insert(id, iface);
    }

    pub fn get_interface(&self, interface: InterfaceOrdinal) -> Option<Arc<dyn InterfaceStub>> {
        self.stub_map.lock().get(&interface).cloned()
    }

    /// Any interface stub of this object; used for same-zone descriptor
    /// resolution and casting.
    pub fn first_interface(&self) -> Option<Arc<dyn InterfaceStub>> {
        self.stub_map.lock().values().next().cloned()
    }

    /// Dispatch an inbound call to the right interface stub.
    pub async fn call(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        caller_zone: CallerZoneId,
        interface: InterfaceOrdinal,
        method: MethodId,
        in_data: &[u8],
    ) -> RpcResult<Vec<u8>> {
        let stub = self.get_interface(interface);
        match stub {
            Some(stub) => {
                stub.call(protocol_version, encoding, caller_zone, method, in_data)
                    .await
            }
            None => {
                error!(object = %self.id, %interface, "invalid interface id in stub call");
                Err(RpcError::InvalidInterfaceId)
            }
        }
    }

    /// Check whether this object supports an interface. When it is not in
    /// the map yet, an existing stub is asked to cast, falling back to the
    /// service's registered stub factories.
    pub fn try_cast(&self, interface: InterfaceOrdinal) -> RpcResult<()> {
        let mut map = self.stub_map.lock();
        if map.contains_key(&interface) {
            return Ok(());
        }
        let existing = map.values().next().cloned().ok_or(RpcError::InvalidInterfaceId)?;
        let new_stub = match existing.cast(interface)? {
            Some(new_stub) => Some(new_stub),
            None => self.service.cast_with_factories(interface, &existing),
        };
        match new_stub {
            Some(new_stub) => {
                map.insert(new_stub.interface_id(crate::PROTOCOL_VERSION), new_stub);
                Ok(())
            }
            None => Err(RpcError::InvalidInterfaceId),
        }
    }

    /// Bump the relevant total and per-caller counter. When `outcall` is
    /// set the reference is an out-parameter being handed back through the
    /// chain, so a `build_caller_route` add_ref is propagated toward the
    /// caller to ensure the return path exists before the call completes.
    pub async fn add_ref(
        &self,
        is_optimistic: bool,
        outcall: bool,
        caller_zone: CallerZoneId,
    ) -> RpcResult<u64> {
        let count = if is_optimistic {
            *self
                .optimistic_references
                .lock()
                .entry(caller_zone)
                .or_insert(0) += 1;
            self.optimistic_count.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            *self.shared_references.lock().entry(caller_zone).or_insert(0) += 1;
            self.shared_count.fetch_add(1, Ordering::AcqRel) + 1
        };

        if caller_zone.as_zone() != self.service.zone_id() {
            let transport = self
                .service
                .route_transport(caller_zone.as_destination(), KnownDirectionZoneId::NULL);
            if let Some(transport) = transport {
                transport.core().increment_inbound_stub_count(caller_zone);
                if outcall {
                    transport
                        .add_ref(
                            crate::PROTOCOL_VERSION,
                            self.service.zone_id().as_destination(),
                            self.id,
                            caller_zone,
                            self.service.zone_id().as_known_direction(),
                            AddRefOptions::BUILD_CALLER_ROUTE,
                            &Vec::new(),
                        )
                        .await?;
                }
            } else {
                debug!(
                    caller = %caller_zone,
                    object = %self.id,
                    "no transport toward caller while adding stub reference"
                );
            }
        }

        Ok(count)
    }

    /// Decrement the relevant total and per-caller counter. The caller's
    /// map entry is erased when it reaches zero. Returns the remaining
    /// total of the released kind.
    pub fn release(&self, is_optimistic: bool, caller_zone: CallerZoneId) -> RpcResult<u64> {
        let (references, total) = if is_optimistic {
            (&self.optimistic_references, &self.optimistic_count)
        } else {
            (&self.shared_references, &self.shared_count)
        };

        {
            let mut refs = references.lock();
            match refs.get_mut(&caller_zone) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        refs.remove(&caller_zone);
                    }
                }
                _ => {
                    error!(
                        caller = %caller_zone,
                        object = %self.id,
                        "stub has no recorded reference for releasing zone"
                    );
                }
            }
        }

        let count = total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .map_err(|_| RpcError::ReferenceCountError)?
            - 1;

        if caller_zone.as_zone() != self.service.zone_id() {
            if let Some(transport) = self
                .service
                .route_transport(caller_zone.as_destination(), KnownDirectionZoneId::NULL)
            {
                transport.core().decrement_inbound_stub_count(caller_zone);
            }
        }

        Ok(count)
    }

    /// Guarded decrement used when a caller zone notifies that it
    /// pre-released an optimistic handle. An unknown caller leaves the
    /// counts untouched instead of underflowing.
    pub fn optimistic_released_from(&self, caller_zone: CallerZoneId) {
        let mut refs = self.optimistic_references.lock();
        match refs.get_mut(&caller_zone) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    refs.remove(&caller_zone);
                }
                drop(refs);
                self.optimistic_count.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {
                error!(
                    caller = %caller_zone,
                    object = %self.id,
                    code = RpcError::ReferenceCountError.code(),
                    "object_released from a zone holding no optimistic reference"
                );
            }
        }
    }

    pub fn has_references_from_zone(&self, caller_zone: CallerZoneId) -> bool {
        if self
            .shared_references
            .lock()
            .get(&caller_zone)
            .is_some_and(|c| *c > 0)
        {
            return true;
        }
        self.optimistic_references
            .lock()
            .get(&caller_zone)
            .is_some_and(|c| *c > 0)
    }

    /// Synthesise the releases a silent zone will never send. Returns true
    /// when the shared total reached zero and the stub should be removed.
    pub fn release_all_from_zone(&self, caller_zone: CallerZoneId) -> bool {
        let shared_refs = self
            .shared_references
            .lock()
            .remove(&caller_zone)
            .unwrap_or(0);
        let optimistic_refs = self
            .optimistic_references
            .lock()
            .remove(&caller_zone)
            .unwrap_or(0);

        if shared_refs > 0 {
            self.shared_count.fetch_sub(shared_refs, Ordering::AcqRel);
            debug!(
                released = shared_refs,
                caller = %caller_zone,
                object = %self.id,
                "released shared references from disconnected zone"
            );
        }
        if optimistic_refs > 0 {
            self.optimistic_count
                .fetch_sub(optimistic_refs, Ordering::AcqRel);
            debug!(
                released = optimistic_refs,
                caller = %caller_zone,
                object = %self.id,
                "released optimistic references from disconnected zone"
            );
        }

        self.shared_count.load(Ordering::Acquire) == 0
    }

    /// Callers holding optimistic references, for object_released
    /// notifications at stub death.
    pub fn optimistic_callers(&self) -> Vec<CallerZoneId> {
        self.optimistic_references.lock().keys().copied().collect()
    }
}

impl Drop for ObjectStub {
    fn drop(&mut self) {
        debug_assert_eq!(self.shared_count.load(Ordering::Acquire), 0);
    }
}
