//! Child-zone bootstrap: a subordinate service created over an in-process
//! transport, pinned to its parent, with interfaces flowing both ways
//! during the handshake.

mod common;

use anyhow::Result;
use canopy::transport::Transport;
use canopy::{LocalTransport, Service, Shared};
use common::*;
use parking_lot::Mutex;
use std::sync::Arc;

#[tokio::test]
async fn child_zone_bootstrap_links_both_ways() -> Result<()> {
    init_tracing();
    let parent_zone = Service::generate_zone_id();
    let child_zone = Service::generate_zone_id();
    let parent_service = Service::new("parent", parent_zone);

    let (parent_half, child_half) = LocalTransport::pair("local", parent_zone, child_zone);
    parent_half.core().set_service(&parent_service);

    let child_service_slot: Arc<Mutex<Option<Arc<Service>>>> = Arc::new(Mutex::new(None));
    let parent_handle_slot: Arc<Mutex<Option<Shared<dyn Calculator>>>> =
        Arc::new(Mutex::new(None));

    {
        let child_service_slot = child_service_slot.clone();
        let parent_handle_slot = parent_handle_slot.clone();
        child_half.set_connection_handler(Arc::new(move |input, transport| {
            let child_service_slot = child_service_slot.clone();
            let parent_handle_slot = parent_handle_slot.clone();
            Box::pin(async move {
                let (child_service, descriptor) =
                    Service::create_child_zone::<dyn Calculator, dyn Calculator, _, _>(
                        "child",
                        transport,
                        input,
                        move |parent, _service| async move {
                            *parent_handle_slot.lock() = parent;
                            let implementation: Arc<dyn Calculator> = Arc::new(CalculatorImpl);
                            Ok(Shared::local(implementation))
                        },
                    )
                    .await?;
                *child_service_slot.lock() = Some(child_service);
                Ok(descriptor)
            })
        }));
    }

    let parent_calculator: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    let child_calculator: Shared<dyn Calculator> = parent_service
        .connect_to_zone::<dyn Calculator, dyn Calculator>(
            "to_child",
            parent_half.clone(),
            Some(&parent_calculator),
        )
        .await?
        .expect("child factory returned an interface");

    let child_service = child_service_slot
        .lock()
        .clone()
        .expect("child service created");
    assert_eq!(child_service.zone_id(), child_zone);

    // The child pins its parent transport and knows the parent zone.
    assert!(child_service.parent_transport().is_some());
    assert_eq!(
        child_service.parent_zone_id(),
        Some(parent_zone.as_destination())
    );

    // Parent calls into the child zone.
    assert!(!child_calculator.is_local());
    assert_eq!(child_calculator.add(2, 40).await?, 42);

    // The child received the parent's interface during the handshake and
    // can call back up.
    let parent_from_child = parent_handle_slot
        .lock()
        .clone()
        .expect("parent interface delivered to factory");
    assert!(!parent_from_child.is_local());
    assert_eq!(parent_from_child.subtract(50, 8).await?, 42);

    assert_eq!(parent_service.stub_count(), 1);
    assert_eq!(child_service.stub_count(), 1);

    // Dropping the cross-zone handles drains both registries.
    drop(child_calculator);
    drop(parent_from_child);
    parent_handle_slot.lock().take();
    assert!(wait_until(|| child_service.stub_count() == 0).await);
    assert!(wait_until(|| parent_service.stub_count() == 0).await);

    parent_half.close().await;
    Ok(())
}
