//! Observer seam for lifecycle events. The runtime calls these hooks at the
//! points a telemetry or sequence-diagram backend would want to record; the
//! default implementations do nothing, so observers only override what they
//! care about. Observers must not block or suspend.

use crate::types::{DestinationZoneId, ObjectId, ZoneId};

/// Lifecycle observer registered with a [`crate::service::Service`].
///
/// Held weakly by the service; dropping the observer unregisters it.
pub trait ServiceObserver: Send + Sync {
    fn on_stub_created(&self, _zone: ZoneId, _object: ObjectId) {}

    fn on_stub_deleted(&self, _zone: ZoneId, _object: ObjectId) {}

    fn on_object_proxy_created(
        &self,
        _zone: ZoneId,
        _destination: DestinationZoneId,
        _object: ObjectId,
    ) {
    }

    fn on_pass_through_created(
        &self,
        _zone: ZoneId,
        _forward: DestinationZoneId,
        _reverse: DestinationZoneId,
    ) {
    }

    fn on_pass_through_deleted(
        &self,
        _zone: ZoneId,
        _forward: DestinationZoneId,
        _reverse: DestinationZoneId,
    ) {
    }

    /// A remote object this zone held handles to is gone, either through an
    /// orderly release or a transport failure.
    fn on_object_released(&self, _object: ObjectId, _destination: DestinationZoneId) {}
}
