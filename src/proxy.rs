//! # Client Side: Object Proxies
//!
//! An `ObjectProxy` is the local stand-in for a stub living in another zone.
//! It is owned by the `ServiceProxy` for that destination and created on
//! demand when a descriptor is demarshalled; at most one live proxy exists
//! per `(service_proxy, object)` pair at any instant.
//!
//! The proxy's shared/optimistic counts track live handle acquisitions, not
//! handle clones: a proxy represents exactly one remote reference of each
//! kind while any acquisition of that kind is alive. When the last
//! acquisition drops, the remote `release` is issued on a background task so
//! handle drops never block.

use crate::error::{RpcError, RpcResult};
use crate::marshaller::CallOutput;
use crate::service_proxy::ServiceProxy;
use crate::types::{InterfaceDescriptor, InterfaceOrdinal, MethodId, ObjectId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// How `get_or_create_object_proxy` should account for the reference a
/// freshly demarshalled descriptor represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectProxyCreationRule {
    /// The caller has already accounted for the refcount.
    DoNothing,
    /// A new proxy needs an add_ref to the stub across the chain.
    AddRefIfNew,
    /// The descriptor arrived as an out-parameter: the remote side
    /// pre-added a reference for us, so an already-known proxy must release
    /// the extra.
    ReleaseIfNotNew,
}

/// Client-side handle registry entry for one remote object.
pub struct ObjectProxy {
    object_id: ObjectId,
    service_proxy: Arc<ServiceProxy>,
    shared_count: AtomicU64,
    optimistic_count: AtomicU64,
    // Set when the remote stub is known to be unreachable (transport down
    // or object_released); calls short-circuit to OBJECT_GONE.
    remote_gone: AtomicBool,
}

impl ObjectProxy {
    pub(crate) fn new(object_id: ObjectId, service_proxy: Arc<ServiceProxy>) -> Arc<Self> {
        Arc::new(Self {
            object_id,
            service_proxy,
            shared_count: AtomicU64::new(0),
            optimistic_count: AtomicU64::new(0),
            remote_gone: AtomicBool::new(false),
        })
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn service_proxy(&self) -> &Arc<ServiceProxy> {
        &self.service_proxy
    }

    pub fn shared_count(&self) -> u64 {
        self.shared_count.load(Ordering::Acquire)
    }

    pub fn optimistic_count(&self) -> u64 {
        self.optimistic_count.load(Ordering::Acquire)
    }

    pub fn descriptor(&self) -> InterfaceDescriptor {
        InterfaceDescriptor::new(self.object_id, self.service_proxy.destination_zone_id())
    }

    pub fn mark_remote_gone(&self) {
        self.remote_gone.store(true, Ordering::Release);
    }

    pub fn is_remote_gone(&self) -> bool {
        self.remote_gone.load(Ordering::Acquire)
    }

    /// True when only optimistic handles observe this proxy, in which case
    /// a vanished stub is the documented outcome rather than a bug.
    fn optimistic_only(&self) -> bool {
        self.shared_count() == 0 && self.optimistic_count() > 0
    }

    /// Forward a method call through the owning service proxy, negotiating
    /// the protocol version as needed.
    pub async fn call(
        &self,
        tag: u64,
        interface_for_version: &(dyn Fn(u64) -> InterfaceOrdinal + Sync),
        method: MethodId,
        in_data: &[u8],
    ) -> RpcResult<CallOutput> {
        if self.is_remote_gone() {
            return Err(RpcError::ObjectGone);
        }
        let result = self
            .service_proxy
            .sp_send(tag, self.object_id, interface_for_version, method, in_data)
            .await;
        match result {
            Err(RpcError::ObjectNotFound) if self.optimistic_only() => Err(RpcError::ObjectGone),
            other => other,
        }
    }

    /// Query whether the remote object supports another interface.
    pub async fn try_cast(
        &self,
        interface_for_version: &(dyn Fn(u64) -> InterfaceOrdinal + Sync),
    ) -> RpcResult<()> {
        if self.is_remote_gone() {
            return Err(RpcError::ObjectGone);
        }
        self.service_proxy
            .sp_try_cast(self.object_id, interface_for_version)
            .await
    }
}

/// Lifetime guard for one acquisition of an [`ObjectProxy`]. Cloning a
/// handle (`Shared::clone`) shares the guard; dropping the last clone of the
/// last guard of a kind schedules the remote release.
pub struct ProxyHandle {
    proxy: Arc<ObjectProxy>,
    optimistic: bool,
}

impl ProxyHandle {
    /// Record a new live acquisition of a proxy.
    pub(crate) fn acquire(proxy: &Arc<ObjectProxy>, optimistic: bool) -> Arc<ProxyHandle> {
        let counter = if optimistic {
            &proxy.optimistic_count
        } else {
            &proxy.shared_count
        };
        counter.fetch_add(1, Ordering::AcqRel);
        Arc::new(ProxyHandle {
            proxy: proxy.clone(),
            optimistic,
        })
    }

    /// Record a new optimistic acquisition, propagating an optimistic
    /// add_ref along the chain when this is the first one. Used by
    /// `Shared::make_optimistic` on remote handles.
    pub(crate) async fn acquire_optimistic(
        proxy: &Arc<ObjectProxy>,
    ) -> RpcResult<Arc<ProxyHandle>> {
        let previous = proxy.optimistic_count.fetch_add(1, Ordering::AcqRel);
        let handle = Arc::new(ProxyHandle {
            proxy: proxy.clone(),
            optimistic: true,
        });
        if previous == 0 && !proxy.is_remote_gone() {
            proxy
                .service_proxy
                .sp_add_ref(
                    proxy.object_id,
                    crate::types::AddRefOptions::OPTIMISTIC,
                    crate::types::KnownDirectionZoneId::NULL,
                )
                .await?;
        }
        Ok(handle)
    }

    pub fn proxy(&self) -> &Arc<ObjectProxy> {
        &self.proxy
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let counter = if self.optimistic {
            &self.proxy.optimistic_count
        } else {
            &self.proxy.shared_count
        };
        let remaining = counter.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(
            object = %self.proxy.object_id,
            optimistic = self.optimistic,
            remaining,
            "proxy handle dropped"
        );
        if remaining == 0 {
            self.proxy
                .service_proxy
                .on_object_proxy_released(&self.proxy, self.optimistic);
        }
    }
}
