//! # Service Proxy
//!
//! One `ServiceProxy` exists per `<this_zone, destination_zone>` pair: it is
//! the handle a zone holds to the reachable registry of another zone. It
//! owns the object-proxy table for that destination, remembers the
//! negotiated protocol version, and stamps version and encoding onto every
//! outbound operation.
//!
//! Version negotiation is a pure downward loop: an operation is attempted
//! at the current version; `INVALID_VERSION` / `INCOMPATIBLE_SERVICE`
//! retries one version lower until `LOWEST_SUPPORTED_VERSION`. The agreed
//! version is persisted atomically and never increases.

use crate::error::{RpcError, RpcResult};
use crate::marshaller::{BackChannel, CallOutput};
use crate::proxy::{ObjectProxy, ObjectProxyCreationRule, ProxyHandle};
use crate::service::Service;
use crate::transport::Transport;
use crate::types::{
    AddRefOptions, DestinationZoneId, Encoding, InterfaceOrdinal, KnownDirectionZoneId, MethodId,
    ObjectId, ReleaseOptions, ZoneId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Per-destination handle: routes calls, negotiates versions, owns the
/// object proxies pointing at that zone.
pub struct ServiceProxy {
    name: String,
    zone_id: ZoneId,
    destination_zone_id: DestinationZoneId,
    service: Arc<Service>,
    transport: Weak<dyn Transport>,
    version: AtomicU64,
    encoding: Encoding,
    proxies: Mutex<HashMap<ObjectId, Weak<ObjectProxy>>>,
    // Set when the destination became unreachable; object proxies are
    // marked so calls fail fast with OBJECT_GONE.
    remote_gone: AtomicBool,
    self_weak: Weak<ServiceProxy>,
}

impl ServiceProxy {
    pub fn create(
        name: &str,
        service: Arc<Service>,
        transport: &Arc<dyn Transport>,
        destination_zone_id: DestinationZoneId,
    ) -> Arc<Self> {
        transport
            .core()
            .increment_outbound_proxy_count(destination_zone_id);
        let zone_id = service.zone_id();
        Arc::new_cyclic(|self_weak| Self {
            name: name.to_string(),
            zone_id,
            destination_zone_id,
            service,
            transport: Arc::downgrade(transport),
            version: AtomicU64::new(crate::PROTOCOL_VERSION),
            encoding: Encoding::default(),
            proxies: Mutex::new(HashMap::new()),
            remote_gone: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    pub fn destination_zone_id(&self) -> DestinationZoneId {
        self.destination_zone_id
    }

    pub fn operating_service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.upgrade()
    }

    /// The currently negotiated protocol version. Monotone non-increasing.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.lock().len()
    }

    /// Mark the destination unreachable and poison every live object proxy.
    pub fn mark_remote_gone(&self) {
        self.remote_gone.store(true, Ordering::Release);
        let proxies: Vec<_> = self
            .proxies
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for proxy in proxies {
            proxy.mark_remote_gone();
        }
    }

    pub fn is_remote_gone(&self) -> bool {
        self.remote_gone.load(Ordering::Acquire)
    }

    /// Poison a single object proxy after an object_released notification.
    pub fn mark_object_gone(&self, object: ObjectId) {
        let proxy = self.proxies.lock().get(&object).and_then(Weak::upgrade);
        if let Some(proxy) = proxy {
            proxy.mark_remote_gone();
        }
    }

    fn persist_version(&self, original: u64, negotiated: u64) {
        if negotiated != original {
            let _ = self.version.compare_exchange(
                original,
                negotiated,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Send a call at an explicit protocol version, persisting any downgrade
    /// the caller has already negotiated.
    pub async fn send_from_this_zone(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        in_data: &[u8],
    ) -> RpcResult<CallOutput> {
        if protocol_version < crate::LOWEST_SUPPORTED_VERSION
            || protocol_version > crate::PROTOCOL_VERSION
        {
            return Err(RpcError::InvalidVersion);
        }
        let current = self.version.load(Ordering::Acquire);
        if protocol_version > current {
            return Err(RpcError::InvalidVersion);
        }
        if protocol_version < current {
            self.version.store(protocol_version, Ordering::Release);
        }

        let transport = self.transport.upgrade().ok_or(RpcError::TransportError)?;
        self.service
            .outbound_send(
                protocol_version,
                encoding,
                tag,
                self.zone_id.as_caller(),
                self.destination_zone_id,
                object,
                interface,
                method,
                in_data,
                &BackChannel::new(),
                &transport,
            )
            .await
    }

    /// Send with the downward negotiation loop. The interface ordinal is
    /// re-derived per attempted version, since ordinals are versioned.
    pub async fn sp_send(
        &self,
        tag: u64,
        object: ObjectId,
        interface_for_version: &(dyn Fn(u64) -> InterfaceOrdinal + Sync),
        method: MethodId,
        in_data: &[u8],
    ) -> RpcResult<CallOutput> {
        let original = self.version.load(Ordering::Acquire);
        let mut version = original;
        loop {
            let interface = interface_for_version(version);
            let result = self
                .send_from_this_zone(
                    version,
                    self.encoding,
                    tag,
                    object,
                    interface,
                    method,
                    in_data,
                )
                .await;
            match result {
                Err(RpcError::InvalidVersion) | Err(RpcError::IncompatibleService)
                    if version > crate::LOWEST_SUPPORTED_VERSION =>
                {
                    version -= 1;
                }
                other => {
                    if !matches!(
                        other,
                        Err(RpcError::InvalidVersion) | Err(RpcError::IncompatibleService)
                    ) {
                        self.persist_version(original, version);
                    }
                    return other;
                }
            }
        }
    }

    pub async fn sp_try_cast(
        &self,
        object: ObjectId,
        interface_for_version: &(dyn Fn(u64) -> InterfaceOrdinal + Sync),
    ) -> RpcResult<()> {
        let transport = self.transport.upgrade().ok_or(RpcError::TransportError)?;
        let original = self.version.load(Ordering::Acquire);
        let mut version = original;
        loop {
            let interface = interface_for_version(version);
            let result = self
                .service
                .outbound_try_cast(
                    version,
                    self.zone_id.as_caller(),
                    self.destination_zone_id,
                    object,
                    interface,
                    &BackChannel::new(),
                    &transport,
                )
                .await;
            match result {
                Err(RpcError::InvalidVersion) | Err(RpcError::IncompatibleService)
                    if version > crate::LOWEST_SUPPORTED_VERSION =>
                {
                    version -= 1;
                }
                other => {
                    if !matches!(
                        other,
                        Err(RpcError::InvalidVersion) | Err(RpcError::IncompatibleService)
                    ) {
                        self.persist_version(original, version);
                    }
                    return other.map(|_| ());
                }
            }
        }
    }

    pub async fn sp_add_ref(
        &self,
        object: ObjectId,
        options: AddRefOptions,
        known_direction_zone: KnownDirectionZoneId,
    ) -> RpcResult<u64> {
        let transport = self.transport.upgrade().ok_or(RpcError::TransportError)?;
        let original = self.version.load(Ordering::Acquire);
        let mut version = original;
        loop {
            let result = self
                .service
                .outbound_add_ref(
                    version,
                    self.destination_zone_id,
                    object,
                    self.zone_id.as_caller(),
                    known_direction_zone,
                    options,
                    &BackChannel::new(),
                    &transport,
                )
                .await;
            match result {
                Err(RpcError::InvalidVersion) | Err(RpcError::IncompatibleService)
                    if version > crate::LOWEST_SUPPORTED_VERSION =>
                {
                    version -= 1;
                }
                other => {
                    if !matches!(
                        other,
                        Err(RpcError::InvalidVersion) | Err(RpcError::IncompatibleService)
                    ) {
                        self.persist_version(original, version);
                    }
                    return other;
                }
            }
        }
    }

    pub async fn sp_release(&self, object: ObjectId, options: ReleaseOptions) -> RpcResult<u64> {
        let transport = self.transport.upgrade().ok_or(RpcError::TransportError)?;
        let original = self.version.load(Ordering::Acquire);
        let mut version = original;
        loop {
            let result = self
                .service
                .outbound_release(
                    version,
                    self.destination_zone_id,
                    object,
                    self.zone_id.as_caller(),
                    options,
                    &BackChannel::new(),
                    &transport,
                )
                .await;
            match result {
                Err(RpcError::InvalidVersion) | Err(RpcError::IncompatibleService)
                    if version > crate::LOWEST_SUPPORTED_VERSION =>
                {
                    version -= 1;
                }
                other => {
                    if !matches!(
                        other,
                        Err(RpcError::InvalidVersion) | Err(RpcError::IncompatibleService)
                    ) {
                        self.persist_version(original, version);
                    }
                    return other;
                }
            }
        }
    }

    /// Find or create the object proxy for a demarshalled descriptor,
    /// applying the creation rule's refcount accounting. Returns the proxy
    /// and a live acquisition of it.
    pub async fn get_or_create_object_proxy(
        &self,
        object: ObjectId,
        rule: ObjectProxyCreationRule,
        known_direction_zone: KnownDirectionZoneId,
        is_optimistic: bool,
    ) -> RpcResult<(Arc<ObjectProxy>, Arc<ProxyHandle>)> {
        let self_arc = self.self_weak.upgrade().ok_or(RpcError::ZoneNotFound)?;

        let (proxy, is_new) = {
            let mut proxies = self.proxies.lock();
            match proxies.get(&object).and_then(Weak::upgrade) {
                Some(existing) => (existing, false),
                None => {
                    let created = ObjectProxy::new(object, self_arc);
                    proxies.insert(object, Arc::downgrade(&created));
                    (created, true)
                }
            }
        };
        if is_new {
            self.service
                .observers_object_proxy_created(self.destination_zone_id, object);
        }

        // Count the acquisition before any remote traffic so a concurrent
        // drop cannot race the map entry away.
        let handle = ProxyHandle::acquire(&proxy, is_optimistic);

        if is_new && rule == ObjectProxyCreationRule::AddRefIfNew {
            let options = if is_optimistic {
                AddRefOptions::OPTIMISTIC
            } else {
                AddRefOptions::NORMAL
            };
            if let Err(e) = self
                .sp_add_ref(object, options, known_direction_zone)
                .await
            {
                error!(object = %object, error = %e, "add_ref for new object proxy failed");
                proxy.mark_remote_gone();
                self.proxies.lock().remove(&object);
                return Err(e);
            }
        }
        if !is_new && rule == ObjectProxyCreationRule::ReleaseIfNotNew {
            debug!(object = %object, "out-parameter descriptor matched existing proxy, releasing the extra reference");
            let options = if is_optimistic {
                ReleaseOptions::OPTIMISTIC
            } else {
                ReleaseOptions::NORMAL
            };
            self.sp_release(object, options).await?;
        }

        Ok((proxy, handle))
    }

    /// Last-drop path: called whenever a kind's acquisition count reaches
    /// zero. Under the table lock the entry is erased once both counts are
    /// zero; the remote release is issued outside the lock on a spawned
    /// task, followed by object-released notifications to observers.
    pub(crate) fn on_object_proxy_released(&self, proxy: &Arc<ObjectProxy>, is_optimistic: bool) {
        let object = proxy.object_id();
        {
            let mut proxies = self.proxies.lock();
            if proxy.shared_count() == 0 && proxy.optimistic_count() == 0 {
                proxies.remove(&object);
            }
        }

        if proxy.is_remote_gone() {
            // Nothing to release remotely; the stub side already cleaned up
            // (or never completed the add_ref).
            self.service
                .notify_object_released_event(object, self.destination_zone_id);
            return;
        }

        let service = self.service.clone();
        let destination = self.destination_zone_id;
        let caller = self.zone_id.as_caller();
        let version = self.version.load(Ordering::Acquire);
        let transport = self.transport.upgrade();
        let options = if is_optimistic {
            ReleaseOptions::OPTIMISTIC
        } else {
            ReleaseOptions::NORMAL
        };

        crate::sync::spawn(async move {
            let Some(transport) = transport else {
                debug!(%object, "transport already gone, skipping remote release");
                return;
            };
            let result = service
                .outbound_release(
                    version,
                    destination,
                    object,
                    caller,
                    options,
                    &BackChannel::new(),
                    &transport,
                )
                .await;
            match result {
                Ok(_) => {}
                Err(RpcError::ObjectNotFound) if is_optimistic => {
                    debug!(%object, "stub already deleted, normal for optimistic handles");
                }
                Err(RpcError::ZoneNotFound) | Err(RpcError::TransportError) => {
                    debug!(
                        %object,
                        %destination,
                        "destination unreachable during cleanup, normal during teardown"
                    );
                }
                Err(e) => {
                    error!(%object, error = %e, "remote release failed");
                }
            }
            service.notify_object_released_event(object, destination);
        });
    }
}

impl Drop for ServiceProxy {
    fn drop(&mut self) {
        debug!(
            zone = %self.zone_id,
            destination = %self.destination_zone_id,
            "service proxy dropped"
        );
        if let Some(transport) = self.transport.upgrade() {
            transport
                .core()
                .decrement_outbound_proxy_count(self.destination_zone_id);
        }
        self.service
            .remove_zone_proxy_if_dead(self.destination_zone_id);
        debug_assert!(self.proxies.lock().is_empty());
    }
}
