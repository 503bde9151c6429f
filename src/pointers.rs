//! # Remote Pointers
//!
//! Three smart-pointer flavours with distinct ownership semantics, never
//! interchangeable with plain `Arc`/`Weak`:
//!
//! - [`Shared`]: owning. Dropping the last remote handle walks the transport
//!   chain to release a shared count. If the target dies while a shared
//!   handle exists, calls return `OBJECT_NOT_FOUND` - that is a bug.
//! - [`Optimistic`]: observing. Does not keep the target alive; if the
//!   target dies, calls return `OBJECT_GONE` - that is expected. Optimistic
//!   handles cannot be serialised across a zone boundary: there is
//!   deliberately no binding function for them, so encoding one is a
//!   generator-time error rather than a runtime one.
//! - [`WeakHandle`]: local observation that expires when the last shared
//!   handle drops.
//!
//! Conversions: shared → optimistic via [`Shared::make_optimistic`];
//! optimistic → shared is not defined - obtain a fresh shared handle from
//! the original source.

use crate::error::{RpcError, RpcResult};
use crate::proxy::ProxyHandle;
use crate::types::InterfaceDescriptor;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Owning handle to a local object or a remote proxy.
pub struct Shared<T: ?Sized> {
    inner: Arc<T>,
    // Present on remote handles: ties this handle to the distributed
    // refcount of the object proxy behind it.
    handle: Option<Arc<ProxyHandle>>,
}

impl<T: ?Sized> Shared<T> {
    /// Wrap a local implementation. Purely local until bound out through a
    /// service.
    pub fn local(inner: Arc<T>) -> Self {
        Self {
            inner,
            handle: None,
        }
    }

    pub(crate) fn remote(inner: Arc<T>, handle: Arc<ProxyHandle>) -> Self {
        Self {
            inner,
            handle: Some(handle),
        }
    }

    pub fn is_local(&self) -> bool {
        self.handle.is_none()
    }

    pub fn as_arc(&self) -> &Arc<T> {
        &self.inner
    }

    pub(crate) fn proxy_handle(&self) -> Option<&Arc<ProxyHandle>> {
        self.handle.as_ref()
    }

    /// The on-wire descriptor of a remote handle; `None` for local ones.
    pub fn remote_descriptor(&self) -> Option<InterfaceDescriptor> {
        self.handle.as_ref().map(|h| h.proxy().descriptor())
    }

    /// Derive an observing handle. Same-zone operation: a local handle
    /// simply downgrades; a remote handle bumps the optimistic count on the
    /// stub through the chain.
    pub async fn make_optimistic(&self) -> RpcResult<Optimistic<T>> {
        match &self.handle {
            None => Ok(Optimistic {
                inner: OptimisticInner::Local(Arc::downgrade(&self.inner)),
            }),
            Some(handle) => {
                let optimistic_handle = ProxyHandle::acquire_optimistic(handle.proxy()).await?;
                Ok(Optimistic {
                    inner: OptimisticInner::Remote {
                        proxy: self.inner.clone(),
                        _handle: optimistic_handle,
                    },
                })
            }
        }
    }

    pub fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle {
            inner: Arc::downgrade(&self.inner),
            handle: self.handle.as_ref().map(Arc::downgrade),
        }
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("remote", &self.handle.is_some())
            .finish()
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

enum OptimisticInner<T: ?Sized> {
    Local(Weak<T>),
    Remote {
        proxy: Arc<T>,
        _handle: Arc<ProxyHandle>,
    },
}

/// Observing handle. Never keeps its target alive and never crosses a zone
/// boundary.
pub struct Optimistic<T: ?Sized> {
    inner: OptimisticInner<T>,
}

impl<T: ?Sized> Optimistic<T> {
    /// Access the target for a call. Returns `OBJECT_GONE` when the target
    /// has died - the expected outcome for this handle flavour. A remote
    /// optimistic handle returns the proxy here and learns of the target's
    /// death from the call itself.
    pub fn get(&self) -> RpcResult<Arc<T>> {
        match &self.inner {
            OptimisticInner::Local(weak) => weak.upgrade().ok_or(RpcError::ObjectGone),
            OptimisticInner::Remote { proxy, _handle } => {
                if _handle.proxy().is_remote_gone() {
                    return Err(RpcError::ObjectGone);
                }
                Ok(proxy.clone())
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        match &self.inner {
            OptimisticInner::Local(weak) => weak.strong_count() > 0,
            OptimisticInner::Remote { _handle, .. } => !_handle.proxy().is_remote_gone(),
        }
    }
}

impl<T: ?Sized> Clone for Optimistic<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            OptimisticInner::Local(weak) => OptimisticInner::Local(weak.clone()),
            OptimisticInner::Remote { proxy, _handle } => OptimisticInner::Remote {
                proxy: proxy.clone(),
                _handle: _handle.clone(),
            },
        };
        Self { inner }
    }
}

/// Non-owning local handle that expires when the last [`Shared`] drops.
pub struct WeakHandle<T: ?Sized> {
    inner: Weak<T>,
    handle: Option<Weak<ProxyHandle>>,
}

impl<T: ?Sized> WeakHandle<T> {
    pub fn upgrade(&self) -> Option<Shared<T>> {
        let inner = self.inner.upgrade()?;
        match &self.handle {
            None => Some(Shared {
                inner,
                handle: None,
            }),
            Some(weak_handle) => {
                let handle = weak_handle.upgrade()?;
                Some(Shared {
                    inner,
                    handle: Some(handle),
                })
            }
        }
    }
}

impl<T: ?Sized> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handle: self.handle.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_optimistic_expires_with_last_shared() {
        let shared = Shared::local(Arc::new(42u32));
        let optimistic = shared.make_optimistic().await.unwrap();
        assert_eq!(*optimistic.get().unwrap(), 42);

        let clone = shared.clone();
        drop(shared);
        assert!(optimistic.is_alive());
        drop(clone);
        assert_eq!(optimistic.get().unwrap_err(), RpcError::ObjectGone);
        assert!(!optimistic.is_alive());
    }

    #[test]
    fn weak_handle_round_trip() {
        let shared = Shared::local(Arc::new("hello".to_string()));
        let weak = shared.downgrade();
        assert_eq!(*weak.upgrade().unwrap(), "hello");
        drop(shared);
        assert!(weak.upgrade().is_none());
    }
}
