//! # Parameter Binding
//!
//! The entry points generated proxy/stub code calls to move interface
//! references across a zone boundary. Four directions exist:
//!
//! - `proxy_bind_in_param`: caller side, sending a reference as an input
//!   parameter;
//! - `stub_bind_in_param`: callee side, receiving that reference;
//! - `stub_bind_out_param`: callee side, sending a reference back as an
//!   out-parameter (pre-adds the receiver's reference and builds the
//!   return-path route);
//! - `proxy_bind_out_param`: caller side, receiving an out-parameter
//!   (releases the pre-added reference when the proxy already existed).
//!
//! `RemoteInterface` is the seam the interface generator targets: one impl
//! per interface trait object wiring ordinals, proxy construction, stub
//! construction and stub downcasting together. Only `Shared` handles can be
//! bound; optimistic handles deliberately have no binding functions.

use crate::error::{RpcError, RpcResult};
use crate::pointers::Shared;
use crate::proxy::{ObjectProxy, ObjectProxyCreationRule};
use crate::service::Service;
use crate::service_proxy::ServiceProxy;
use crate::stub::{InterfaceStub, ObjectStub};
use crate::types::{
    AddRefOptions, CallerZoneId, InterfaceDescriptor, InterfaceOrdinal, KnownDirectionZoneId,
};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Generated-code contract for one interface type. Implemented for the
/// trait object (`impl RemoteInterface for dyn MyInterface`) by the code
/// the IDL generator emits.
pub trait RemoteInterface: Send + Sync + 'static {
    /// Interface ordinal at a protocol version.
    fn interface_id(protocol_version: u64) -> InterfaceOrdinal;

    /// Wrap an object proxy in this interface's generated proxy type.
    fn create_proxy(object: Arc<ObjectProxy>) -> Arc<Self>;

    /// Wrap a local implementation in this interface's generated stub type.
    fn create_stub(target: Arc<Self>, object: Weak<ObjectStub>) -> Arc<dyn InterfaceStub>;

    /// Recover the wrapped implementation from a stub of this interface.
    fn from_stub(stub: &Arc<dyn InterfaceStub>) -> Option<Arc<Self>>;
}

/// Bind a local interface into a descriptor, creating or reusing its stub
/// and adding the caller zone's reference.
pub async fn create_interface_stub<T>(
    service: &Arc<Service>,
    iface: &Shared<T>,
    caller_zone: CallerZoneId,
) -> RpcResult<(Arc<ObjectStub>, InterfaceDescriptor)>
where
    T: RemoteInterface + ?Sized,
{
    if !iface.is_local() {
        error!("attempted to bind a remote handle as a local stub");
        return Err(RpcError::InvalidData);
    }
    let target = iface.as_arc().clone();
    let address = Arc::as_ptr(&target) as *const () as usize;
    let factory =
        move |stub: &Arc<ObjectStub>| T::create_stub(target.clone(), Arc::downgrade(stub));
    service
        .get_proxy_stub_descriptor(caller_zone, address, &factory, false)
        .await
}

/// Callee side, out-parameter direction: produce a descriptor whose
/// receiver-owned reference is pre-added. For a reference that lives in a
/// third zone, the chain reference is added with both route flags so each
/// route is built independently.
pub async fn stub_bind_out_param<T>(
    service: &Arc<Service>,
    caller_zone: CallerZoneId,
    iface: Option<&Shared<T>>,
) -> RpcResult<InterfaceDescriptor>
where
    T: RemoteInterface + ?Sized,
{
    let Some(iface) = iface else {
        return Ok(InterfaceDescriptor::NULL);
    };

    if let Some(descriptor) = iface.remote_descriptor() {
        // The reference points at another zone's stub: walk the chain once
        // on the receiver's behalf, building both routes.
        let handle = iface.proxy_handle().expect("remote handle");
        let service_proxy = handle.proxy().service_proxy();
        let transport = service_proxy.transport().ok_or(RpcError::TransportError)?;
        service
            .outbound_add_ref(
                service_proxy.version(),
                descriptor.destination_zone,
                descriptor.object,
                caller_zone,
                service.zone_id().as_known_direction(),
                AddRefOptions::BUILD_CALLER_ROUTE | AddRefOptions::BUILD_DESTINATION_ROUTE,
                &Vec::new(),
                &transport,
            )
            .await?;
        return Ok(descriptor);
    }

    let target = iface.as_arc().clone();
    let address = Arc::as_ptr(&target) as *const () as usize;
    let factory =
        move |stub: &Arc<ObjectStub>| T::create_stub(target.clone(), Arc::downgrade(stub));
    let (_stub, descriptor) = service
        .get_proxy_stub_descriptor(caller_zone, address, &factory, true)
        .await?;
    Ok(descriptor)
}

/// A call-scoped reference created for an input parameter. The sender
/// releases it once the call has returned; if the receiver kept the
/// reference alive, the stub's count stays positive through its own
/// add_ref.
pub struct InParamBinding {
    service: Arc<Service>,
    stub: Arc<ObjectStub>,
    caller_zone: CallerZoneId,
}

impl InParamBinding {
    /// Drop the call-scoped reference after the call completed.
    pub fn release(self) {
        if let Err(e) =
            self.service
                .release_local_stub(&self.stub, false, self.caller_zone)
        {
            error!(error = %e, "failed to release call-scoped in-parameter binding");
        }
    }
}

/// Caller side, input-parameter direction. A reference belonging to a zone
/// other than the operating zone is passed through by descriptor alone;
/// a local reference is bound into a stub with a call-scoped reference the
/// generated code releases after the call.
pub async fn proxy_bind_in_param<T>(
    service_proxy: &Arc<ServiceProxy>,
    iface: Option<&Shared<T>>,
) -> RpcResult<(InterfaceDescriptor, Option<InParamBinding>)>
where
    T: RemoteInterface + ?Sized,
{
    let Some(iface) = iface else {
        return Ok((InterfaceDescriptor::NULL, None));
    };

    if let Some(descriptor) = iface.remote_descriptor() {
        return Ok((descriptor, None));
    }

    let service = service_proxy.operating_service().clone();
    let caller_zone = service_proxy.destination_zone_id().as_caller();
    let target = iface.as_arc().clone();
    let address = Arc::as_ptr(&target) as *const () as usize;
    let factory =
        move |stub: &Arc<ObjectStub>| T::create_stub(target.clone(), Arc::downgrade(stub));
    let (stub, descriptor) = service
        .get_proxy_stub_descriptor(caller_zone, address, &factory, false)
        .await?;
    Ok((
        descriptor,
        Some(InParamBinding {
            service,
            stub,
            caller_zone,
        }),
    ))
}

/// Callee side, input-parameter direction: resolve a received descriptor
/// into a usable handle.
pub async fn stub_bind_in_param<T>(
    service: &Arc<Service>,
    caller_zone: CallerZoneId,
    descriptor: InterfaceDescriptor,
) -> RpcResult<Option<Shared<T>>>
where
    T: RemoteInterface + ?Sized,
{
    if descriptor.is_null() {
        return Ok(None);
    }

    if descriptor.destination_zone.as_zone() == service.zone_id() {
        // The reference came home: resolve straight to the implementation.
        let stub = service
            .get_object(descriptor.object)
            .ok_or(RpcError::ObjectNotFound)?;
        return resolve_local::<T>(&stub).map(Some);
    }

    let (service_proxy, _new) = service
        .get_or_create_zone_proxy(descriptor.destination_zone, caller_zone.as_known_direction())?;
    let (proxy, handle) = service_proxy
        .get_or_create_object_proxy(
            descriptor.object,
            ObjectProxyCreationRule::AddRefIfNew,
            caller_zone.as_known_direction(),
            false,
        )
        .await?;
    let typed = T::create_proxy(proxy);
    Ok(Some(Shared::remote(typed, handle)))
}

/// Caller side, out-parameter direction: adopt a descriptor whose
/// reference the callee pre-added for us.
pub async fn proxy_bind_out_param<T>(
    service_proxy: &Arc<ServiceProxy>,
    descriptor: InterfaceDescriptor,
) -> RpcResult<Option<Shared<T>>>
where
    T: RemoteInterface + ?Sized,
{
    if descriptor.is_null() {
        return Ok(None);
    }

    let service = service_proxy.operating_service();

    if descriptor.destination_zone.as_zone() == service.zone_id() {
        // One of our own objects came back: fold the pre-added reference
        // away and hand out the local implementation.
        let stub = service
            .get_object(descriptor.object)
            .ok_or(RpcError::ObjectNotFound)?;
        let resolved = resolve_local::<T>(&stub)?;
        let count = service.release_local_stub(&stub, false, service.zone_id().as_caller())?;
        debug!(object = %descriptor.object, count, "folded returned local reference");
        return Ok(Some(resolved));
    }

    let owning_proxy = if service_proxy.destination_zone_id() == descriptor.destination_zone {
        service_proxy.clone()
    } else {
        let (proxy, _new) = service
            .get_or_create_zone_proxy(descriptor.destination_zone, KnownDirectionZoneId::NULL)?;
        proxy
    };

    let (proxy, handle) = owning_proxy
        .get_or_create_object_proxy(
            descriptor.object,
            ObjectProxyCreationRule::ReleaseIfNotNew,
            KnownDirectionZoneId::NULL,
            false,
        )
        .await?;
    let typed = T::create_proxy(proxy);
    Ok(Some(Shared::remote(typed, handle)))
}

/// Demarshal a descriptor whose reference the caller has already accounted
/// for - the bootstrap path.
pub async fn demarshal_interface_proxy<T>(
    protocol_version: u64,
    service_proxy: &Arc<ServiceProxy>,
    descriptor: InterfaceDescriptor,
) -> RpcResult<Option<Shared<T>>>
where
    T: RemoteInterface + ?Sized,
{
    if protocol_version > crate::PROTOCOL_VERSION {
        error!("incompatible protocol version in demarshal");
        return Err(RpcError::IncompatibleService);
    }
    if descriptor.is_null() {
        return Ok(None);
    }
    if descriptor.destination_zone != service_proxy.destination_zone_id() {
        return proxy_bind_out_param(service_proxy, descriptor).await;
    }
    if descriptor.destination_zone.as_zone() == service_proxy.operating_service().zone_id() {
        error!("descriptor claims to live in the demarshalling zone");
        return Err(RpcError::InvalidData);
    }

    let (proxy, handle) = service_proxy
        .get_or_create_object_proxy(
            descriptor.object,
            ObjectProxyCreationRule::DoNothing,
            KnownDirectionZoneId::NULL,
            false,
        )
        .await?;
    let typed = T::create_proxy(proxy);
    Ok(Some(Shared::remote(typed, handle)))
}

fn resolve_local<T>(stub: &Arc<ObjectStub>) -> RpcResult<Shared<T>>
where
    T: RemoteInterface + ?Sized,
{
    let ordinal = T::interface_id(crate::PROTOCOL_VERSION);
    let interface = match stub.get_interface(ordinal) {
        Some(interface) => interface,
        None => {
            stub.try_cast(ordinal)?;
            stub.get_interface(ordinal)
                .ok_or(RpcError::InvalidInterfaceId)?
        }
    };
    let target = T::from_stub(&interface).ok_or(RpcError::InvalidInterfaceId)?;
    Ok(Shared::local(target))
}
