//! Protocol version negotiation: a peer capped at an older version rejects
//! the first attempt, the service proxy walks downward, and the agreed
//! version persists monotonically.

mod common;

use anyhow::Result;
use canopy::transport::Transport;
use canopy::{Service, Shared, SpscTransport, LOWEST_SUPPORTED_VERSION, PROTOCOL_VERSION};
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn version_downgrades_and_persists() -> Result<()> {
    init_tracing();
    let zone_a = Service::generate_zone_id();
    let zone_b = Service::generate_zone_id();
    let service_a = Service::new("new_peer", zone_a);
    let service_b = Service::new("old_peer", zone_b);

    // B only speaks the previous protocol version.
    service_b.set_max_protocol_version(LOWEST_SUPPORTED_VERSION);
    assert!(LOWEST_SUPPORTED_VERSION < PROTOCOL_VERSION);

    let (transport_a, transport_b) = SpscTransport::pair("spsc", zone_a, zone_b);
    transport_a.core().set_service(&service_a);
    transport_b.core().set_service(&service_b);
    let root: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    transport_b.set_connection_handler(serve_attach(service_b.clone(), root));
    transport_a.start_pumps();
    transport_b.start_pumps();

    let calculator: Shared<dyn Calculator> = service_a
        .connect_to_zone::<dyn Calculator, dyn Calculator>("to_b", transport_a.clone(), None)
        .await?
        .expect("peer served a calculator");

    let zone_proxy = service_a
        .get_zone_proxy(zone_b.as_destination())
        .expect("zone proxy registered");
    assert_eq!(zone_proxy.version(), PROTOCOL_VERSION);

    // The first call is rejected at the native version, retried one lower,
    // and succeeds; the downgrade is persisted.
    assert_eq!(calculator.add(20, 22).await?, 42);
    assert_eq!(zone_proxy.version(), LOWEST_SUPPORTED_VERSION);

    // Subsequent traffic stays at the agreed version and never climbs
    // back up.
    assert_eq!(calculator.subtract(50, 8).await?, 42);
    assert_eq!(zone_proxy.version(), LOWEST_SUPPORTED_VERSION);

    drop(calculator);
    assert!(wait_until(|| service_b.stub_count() == 0).await);
    drop(zone_proxy);
    transport_a.close().await;
    Ok(())
}
