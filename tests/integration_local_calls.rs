//! Single-zone behaviour: local dispatch through the service registry and
//! the optimistic handle contract.

mod common;

use anyhow::Result;
use canopy::bindings;
use canopy::{
    CallerZoneId, Encoding, Marshaller, RpcError, Service, Shared, PROTOCOL_VERSION,
};
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn local_arithmetic() -> Result<()> {
    init_tracing();
    let service = Service::new("zone", Service::generate_zone_id());
    let calculator: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));

    let caller = service.zone_id().as_caller();
    let (stub, descriptor) = bindings::create_interface_stub(&service, &calculator, caller).await?;
    assert_eq!(descriptor.destination_zone, service.zone_id().as_destination());
    assert_eq!(service.stub_count(), 1);
    assert_eq!(stub.shared_count(), 1);

    // Direct local invocation.
    assert_eq!(calculator.add(10, 20).await?, 30);
    assert_eq!(calculator.divide(1, 0).await.unwrap_err(), RpcError::InvalidData);

    // The same object dispatched through the service's inbound surface, as
    // a transport would deliver it.
    let args = canopy::wire::encode(Encoding::Binary, &(10i32, 20i32))?;
    let output = service
        .send(
            PROTOCOL_VERSION,
            Encoding::Binary,
            0,
            caller,
            service.zone_id().as_destination(),
            descriptor.object,
            CALCULATOR_INTERFACE,
            calculator_methods::ADD,
            &args,
            &Vec::new(),
        )
        .await?;
    assert_eq!(canopy::wire::decode::<i32>(Encoding::Binary, &output.data)?, 30);

    // Dropping the registration tears the stub down (stub life property).
    service.release_local_stub(&stub, false, caller)?;
    assert_eq!(service.stub_count(), 0);
    assert!(service.check_is_empty());
    Ok(())
}

#[tokio::test]
async fn binding_the_same_object_twice_reuses_the_stub() -> Result<()> {
    init_tracing();
    let service = Service::new("zone", Service::generate_zone_id());
    let calculator: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    let caller = service.zone_id().as_caller();

    let (stub_a, descr_a) = bindings::create_interface_stub(&service, &calculator, caller).await?;
    let (stub_b, descr_b) = bindings::create_interface_stub(&service, &calculator, caller).await?;
    assert_eq!(descr_a, descr_b);
    assert_eq!(stub_a.id(), stub_b.id());
    assert_eq!(service.stub_count(), 1);
    assert_eq!(stub_a.shared_count(), 2);

    service.release_local_stub(&stub_a, false, caller)?;
    assert_eq!(service.stub_count(), 1);
    service.release_local_stub(&stub_b, false, caller)?;
    assert_eq!(service.stub_count(), 0);
    Ok(())
}

#[tokio::test]
async fn same_zone_optimistic_observes_death() -> Result<()> {
    init_tracing();
    let processor: Shared<dyn DataProcessor> = Shared::local(Arc::new(DataProcessorImpl));
    let optimistic = processor.make_optimistic().await?;

    assert_eq!(
        optimistic.get()?.process_vector(vec![1, 2, 3]).await?,
        vec![2, 4, 6]
    );
    assert!(optimistic.is_alive());

    // Another shared handle keeps the target alive after the first drops.
    let second = processor.clone();
    drop(processor);
    assert!(optimistic.is_alive());

    drop(second);
    assert!(!optimistic.is_alive());
    assert_eq!(optimistic.get().unwrap_err(), RpcError::ObjectGone);
    Ok(())
}

#[tokio::test]
async fn weak_handle_expires_with_last_shared() {
    init_tracing();
    let calculator: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    let weak = calculator.downgrade();
    assert!(weak.upgrade().is_some());
    drop(calculator);
    assert!(weak.upgrade().is_none());
}

#[tokio::test]
async fn try_cast_reports_interface_support() -> Result<()> {
    init_tracing();
    let service = Service::new("zone", Service::generate_zone_id());
    let calculator: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    let caller = service.zone_id().as_caller();
    let (stub, descriptor) = bindings::create_interface_stub(&service, &calculator, caller).await?;

    service
        .try_cast(
            PROTOCOL_VERSION,
            caller,
            service.zone_id().as_destination(),
            descriptor.object,
            CALCULATOR_INTERFACE,
            &Vec::new(),
        )
        .await?;

    let err = service
        .try_cast(
            PROTOCOL_VERSION,
            caller,
            service.zone_id().as_destination(),
            descriptor.object,
            DATA_PROCESSOR_INTERFACE,
            &Vec::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::InvalidInterfaceId);

    service.release_local_stub(&stub, false, caller)?;
    Ok(())
}

#[tokio::test]
async fn post_is_fire_and_forget() -> Result<()> {
    init_tracing();
    let service = Service::new("zone", Service::generate_zone_id());
    let calculator: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    let caller = service.zone_id().as_caller();
    let (stub, descriptor) = bindings::create_interface_stub(&service, &calculator, caller).await?;

    let args = canopy::wire::encode(Encoding::Binary, &(1i32, 2i32))?;
    // A post produces no reply and no delivery receipt, for a live object
    // or a vanished one alike.
    service
        .post(
            PROTOCOL_VERSION,
            Encoding::Binary,
            0,
            caller,
            service.zone_id().as_destination(),
            descriptor.object,
            CALCULATOR_INTERFACE,
            calculator_methods::ADD,
            &args,
            &Vec::new(),
        )
        .await;
    service
        .post(
            PROTOCOL_VERSION,
            Encoding::Binary,
            0,
            caller,
            service.zone_id().as_destination(),
            canopy::ObjectId(0xDEAD),
            CALCULATOR_INTERFACE,
            calculator_methods::ADD,
            &args,
            &Vec::new(),
        )
        .await;

    service.release_local_stub(&stub, false, caller)?;
    Ok(())
}

#[tokio::test]
async fn object_released_underflow_is_guarded() -> Result<()> {
    init_tracing();
    let service = Service::new("zone", Service::generate_zone_id());
    let calculator: Shared<dyn Calculator> = Shared::local(Arc::new(CalculatorImpl));
    let caller = service.zone_id().as_caller();
    let (stub, descriptor) = bindings::create_interface_stub(&service, &calculator, caller).await?;

    // A zone that never held an optimistic reference pre-releases one:
    // the counts must not underflow.
    assert_eq!(stub.optimistic_count(), 0);
    service
        .object_released(
            PROTOCOL_VERSION,
            service.zone_id().as_destination(),
            descriptor.object,
            CallerZoneId(9999),
            &Vec::new(),
        )
        .await;
    assert_eq!(stub.optimistic_count(), 0);
    assert_eq!(stub.shared_count(), 1);

    service.release_local_stub(&stub, false, caller)?;
    Ok(())
}
