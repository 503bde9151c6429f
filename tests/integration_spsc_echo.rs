//! Two zones over the SPSC queue transport: bootstrap, a large binary echo
//! and lifecycle cleanup once the last handle drops.

mod common;

use anyhow::Result;
use canopy::transport::Transport;
use canopy::{Service, Shared, SpscTransport};
use common::*;
use std::sync::Arc;

struct SpscPair {
    service_a: Arc<Service>,
    service_b: Arc<Service>,
    transport_a: Arc<SpscTransport>,
    transport_b: Arc<SpscTransport>,
}

fn spsc_zones(root_for_b: Shared<dyn DataProcessor>) -> SpscPair {
    let zone_a = Service::generate_zone_id();
    let zone_b = Service::generate_zone_id();
    let service_a = Service::new("zone_a", zone_a);
    let service_b = Service::new("zone_b", zone_b);

    let (transport_a, transport_b) = SpscTransport::pair("spsc", zone_a, zone_b);
    transport_a.core().set_service(&service_a);
    transport_b.core().set_service(&service_b);
    transport_b.set_connection_handler(serve_attach(service_b.clone(), root_for_b));
    transport_a.start_pumps();
    transport_b.start_pumps();

    SpscPair {
        service_a,
        service_b,
        transport_a,
        transport_b,
    }
}

#[tokio::test]
async fn two_zone_echo_and_cleanup() -> Result<()> {
    init_tracing();
    let root: Shared<dyn DataProcessor> = Shared::local(Arc::new(DataProcessorImpl));
    let pair = spsc_zones(root);

    let processor: Shared<dyn DataProcessor> = pair
        .service_a
        .connect_to_zone::<dyn DataProcessor, dyn DataProcessor>(
            "to_b",
            pair.transport_a.clone(),
            None,
        )
        .await?
        .expect("peer served a root object");

    // One stub serving zone A.
    assert_eq!(pair.service_b.stub_count(), 1);

    // A 1 MiB blob must come back byte-identical.
    let blob: Vec<u8> = (0..(1024 * 1024)).map(|i| (i % 251) as u8).collect();
    let echoed = processor.echo_binary(blob.clone()).await?;
    assert_eq!(echoed, blob);

    let doubled = processor.process_vector(vec![1, 2, 3]).await?;
    assert_eq!(doubled, vec![2, 4, 6]);

    // Remote interface query: the served object answers for its own
    // interface and rejects one it does not implement.
    let descriptor = processor.remote_descriptor().expect("remote handle");
    let zone_proxy = pair
        .service_a
        .get_zone_proxy(pair.service_b.zone_id().as_destination())
        .expect("zone proxy registered");
    zone_proxy
        .sp_try_cast(descriptor.object, &data_processor_interface_id)
        .await?;
    assert_eq!(
        zone_proxy
            .sp_try_cast(descriptor.object, &calculator_interface_id)
            .await
            .unwrap_err(),
        canopy::RpcError::InvalidInterfaceId
    );
    drop(zone_proxy);

    // Dropping the last handle walks a release over the queue and empties
    // B's stub map.
    drop(processor);
    assert!(
        wait_until(|| pair.service_b.stub_count() == 0).await,
        "stub map should drain after the last handle dropped"
    );
    assert!(wait_until(|| pair.service_a.check_is_empty()).await);
    assert!(pair.service_b.check_is_empty());

    pair.transport_a.close().await;
    Ok(())
}

#[tokio::test]
async fn proxy_uniqueness_per_destination_object() -> Result<()> {
    init_tracing();
    let root: Shared<dyn DataProcessor> = Shared::local(Arc::new(DataProcessorImpl));
    let pair = spsc_zones(root);

    let processor: Shared<dyn DataProcessor> = pair
        .service_a
        .connect_to_zone::<dyn DataProcessor, dyn DataProcessor>(
            "to_b",
            pair.transport_a.clone(),
            None,
        )
        .await?
        .expect("peer served a root object");

    // Cloned handles share one object proxy; the service proxy table holds
    // exactly one entry for the pair.
    let clone = processor.clone();
    let zone_proxy = pair
        .service_a
        .get_zone_proxy(pair.service_b.zone_id().as_destination())
        .expect("zone proxy registered");
    assert_eq!(zone_proxy.proxy_count(), 1);

    // The remote shared count stays at one: the clone is local.
    assert_eq!(pair.service_b.stub_count(), 1);
    drop(clone);
    assert_eq!(zone_proxy.proxy_count(), 1);
    drop(processor);
    assert!(wait_until(|| pair.service_b.stub_count() == 0).await);
    drop(zone_proxy);

    pair.transport_b.close().await;
    Ok(())
}
