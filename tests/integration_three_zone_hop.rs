//! Three hop-connected zones A - B - C where B owns neither endpoint:
//! reference routing installs a pass-through at B, refcounts balance across
//! the chain, and the pass-through self-destructs when the last reference
//! drops. Also exercises the pure-transit rule for a reference that loops
//! back to its own zone.

mod common;

use anyhow::Result;
use canopy::transport::Transport;
use canopy::{Service, Shared, SpscTransport};
use common::*;
use std::sync::Arc;

struct ThreeZones {
    service_a: Arc<Service>,
    service_b: Arc<Service>,
    service_c: Arc<Service>,
    t_ab_a: Arc<SpscTransport>,
    t_ab_b: Arc<SpscTransport>,
    t_bc_b: Arc<SpscTransport>,
    t_bc_c: Arc<SpscTransport>,
}

/// Wire up A - B and B - C; C serves a calculator, B serves a directory.
async fn three_zones() -> Result<(ThreeZones, Shared<dyn Directory>, Arc<DirectoryImpl>)> {
    let zone_a = Service::generate_zone_id();
    let zone_b = Service::generate_zone_id();
    let zone_c = Service::generate_zone_id();
    let service_a = Service::new("zone_a", zone_a);
    let service_b = Service::new("zone_b", zone_b);
    let service_c = Service::new("zone_c", zone_c);

    let (t_ab_a, t_ab_b) = SpscTransport::pair("ab", zone_a, zone_b);
    let (t_bc_b, t_bc_c) = SpscTransport::pair("bc", zone_b, zone_c);
    t_ab_a.core().set_service(&service_a);
    t_ab_b.core().set_service(&service_b);
    t_bc_b.core().set_service(&service_b);
    t_bc_c.core().set_service(&service_c);

    let calculator_root: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    t_bc_c.set_connection_handler(serve_attach(service_c.clone(), calculator_root));

    for transport in [&t_ab_a, &t_ab_b, &t_bc_b, &t_bc_c] {
        transport.start_pumps();
    }

    // B obtains C's calculator, then serves it through its directory.
    let calculator_at_b: Shared<dyn Calculator> = service_b
        .connect_to_zone::<dyn Calculator, dyn Calculator>("to_c", t_bc_b.clone(), None)
        .await?
        .expect("C served a calculator");

    let directory_impl = Arc::new(DirectoryImpl::new());
    directory_impl.set(calculator_at_b);
    let directory_root: Shared<dyn Directory> =
        Shared::local(directory_impl.clone() as Arc<dyn Directory>);
    t_ab_b.set_connection_handler(serve_attach(service_b.clone(), directory_root));

    let directory: Shared<dyn Directory> = service_a
        .connect_to_zone::<dyn Directory, dyn Directory>("to_b", t_ab_a.clone(), None)
        .await?
        .expect("B served a directory");

    let zones = ThreeZones {
        service_a,
        service_b,
        service_c,
        t_ab_a,
        t_ab_b,
        t_bc_b,
        t_bc_c,
    };
    Ok((zones, directory, directory_impl))
}

#[tokio::test]
async fn pass_through_routes_and_self_destructs() -> Result<()> {
    init_tracing();
    let (zones, directory, directory_impl) = three_zones().await?;
    let zone_a = zones.service_a.zone_id();
    let zone_c = zones.service_c.zone_id();

    // B serves its directory to A; C serves its calculator to B.
    assert_eq!(zones.service_b.stub_count(), 1);

    // A obtains a handle to C's calculator through B.
    let calculator = directory
        .get_calculator()
        .await?
        .expect("directory slot populated");
    assert!(!calculator.is_local());

    // The hop installed exactly one pass-through for (C, A) at B, with one
    // shared count: A's single reference.
    let pass_through = zones
        .t_ab_b
        .core()
        .get_destination_handler(zone_c.as_destination(), zone_a.as_caller())
        .expect("pass-through registered for (C, A)");
    assert_eq!(pass_through.shared_count(), 1);
    assert_eq!(pass_through.optimistic_count(), 0);
    assert_eq!(zones.t_ab_b.core().live_pass_through_count(), 1);
    assert_eq!(zones.t_bc_b.core().live_pass_through_count(), 1);

    // Calls traverse both edges.
    assert_eq!(calculator.add(2, 40).await?, 42);
    assert_eq!(calculator.subtract(50, 8).await?, 42);

    // C's stub carries B's bootstrap reference plus A's routed one.
    assert_eq!(zones.service_c.stub_count(), 1);

    // Dropping A's handle unwinds the chain: the pass-through drains to
    // zero and removes itself from both edges.
    drop(calculator);
    drop(pass_through);
    assert!(
        wait_until(|| zones.t_ab_b.core().live_pass_through_count() == 0).await,
        "pass-through should self-destruct once its counts reach zero"
    );
    assert_eq!(zones.t_bc_b.core().live_pass_through_count(), 0);

    // B's own reference still pins C's stub.
    assert_eq!(zones.service_c.stub_count(), 1);
    directory_impl.clear();
    assert!(wait_until(|| zones.service_c.stub_count() == 0).await);

    drop(directory);
    assert!(wait_until(|| zones.service_a.check_is_empty()).await);
    zones.t_ab_a.close().await;
    zones.t_bc_c.close().await;
    Ok(())
}

#[tokio::test]
async fn returning_a_reference_to_its_home_zone_is_pure_transit() -> Result<()> {
    init_tracing();
    let (zones, directory_b, _directory_b_impl) = three_zones().await?;
    let zone_a = zones.service_a.zone_id();

    // Pull C's calculator once so the A->B->C route and its pass-through
    // exist.
    let warmup = directory_b
        .get_calculator()
        .await?
        .expect("directory slot populated");

    // C serves a directory of its own; its descriptor reaches A the way an
    // out-parameter would arrive over the established route.
    let directory_c_impl = Arc::new(DirectoryImpl::new());
    let directory_c_root: Shared<dyn Directory> =
        Shared::local(directory_c_impl.clone() as Arc<dyn Directory>);
    let c_caller = zones.service_c.zone_id().as_caller();
    let (c_stub, c_descriptor) = canopy::bindings::create_interface_stub(
        &zones.service_c,
        &directory_c_root,
        c_caller,
    )
    .await?;
    let directory_c = canopy::bindings::stub_bind_in_param::<dyn Directory>(
        &zones.service_a,
        zone_a.as_caller(),
        c_descriptor,
    )
    .await?
    .expect("descriptor resolves");

    // A registers its own local calculator with C's directory: the
    // reference travels two hops away from home, and C ends up holding one
    // reference on A's stub.
    let local_calculator: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    directory_c
        .register_calculator(Some(local_calculator.clone()))
        .await?;
    assert!(wait_until(|| zones.service_a.stub_count() == 1).await);

    let transit_counts_before: Vec<u64> = zones
        .t_ab_b
        .core()
        .pass_through_entries()
        .iter()
        .map(|(_, _, pt)| pt.shared_count())
        .collect();

    // C now returns A's own calculator to A: destination and caller
    // coincide, so the hop at B must forward without counting.
    let returned = directory_c
        .get_calculator()
        .await?
        .expect("registered calculator comes back");
    assert!(returned.is_local(), "the reference resolves to the local object");
    assert_eq!(returned.add(40, 2).await?, 42);

    let transit_counts_after: Vec<u64> = zones
        .t_ab_b
        .core()
        .pass_through_entries()
        .iter()
        .map(|(_, _, pt)| pt.shared_count())
        .collect();
    assert_eq!(
        transit_counts_before, transit_counts_after,
        "pure transit must leave pass-through counts untouched"
    );

    // Balanced refcounts: once C's directory lets go, A's stub drains even
    // though local handles to the implementation remain.
    directory_c_impl.clear();
    assert!(wait_until(|| zones.service_a.stub_count() == 0).await);
    drop(returned);
    drop(local_calculator);

    drop(directory_c);
    drop(warmup);
    drop(directory_b);
    zones.service_c.release_local_stub(&c_stub, false, c_caller)?;
    zones.t_ab_a.close().await;
    zones.t_bc_b.close().await;
    Ok(())
}
