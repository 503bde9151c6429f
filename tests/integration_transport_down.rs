//! Transport failure over TCP: when the connection dies, every hop
//! synthesises the releases the silent zone will never send - the server's
//! stubs drain and the client's proxies observe OBJECT_GONE.

mod common;

use anyhow::Result;
use canopy::{RpcError, Service, Shared, TcpTransport};
use common::*;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::test]
async fn transport_down_cleans_both_sides() -> Result<()> {
    init_tracing();
    let zone_a = Service::generate_zone_id();
    let zone_b = Service::generate_zone_id();
    let service_a = Service::new("client", zone_a);
    let service_b = Service::new("server", zone_b);

    // B serves a directory whose slot holds a B-local calculator.
    let directory_impl = Arc::new(DirectoryImpl::new());
    directory_impl.set(Shared::local(Arc::new(CalculatorImpl)));
    let directory_root: Shared<dyn Directory> =
        Shared::local(directory_impl.clone() as Arc<dyn Directory>);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
    {
        let service_b = service_b.clone();
        let handler = serve_attach(service_b.clone(), directory_root);
        tokio::spawn(async move {
            if let Ok((stream, peer)) = listener.accept().await {
                tracing::debug!(%peer, "accepted test connection");
                let transport = TcpTransport::accept("server", &service_b, stream, handler);
                let _ = accepted_tx.send(transport);
            }
        });
    }

    let transport_a = TcpTransport::connect("client", &service_a, zone_b, &addr, 8192).await?;
    let directory: Shared<dyn Directory> = service_a
        .connect_to_zone::<dyn Directory, dyn Directory>("to_b", transport_a.clone(), None)
        .await?
        .expect("server served a directory");
    let transport_b = accepted_rx.await.expect("server accepted");

    // Two shared handles into B: the directory and the calculator it
    // hands out.
    let calculator = directory
        .get_calculator()
        .await?
        .expect("directory slot populated");
    assert_eq!(calculator.add(40, 2).await?, 42);
    assert_eq!(service_b.stub_count(), 2);

    // Kill the connection from the server side.
    transport_b.close().await;

    // The server synthesised transport_down for the silent client: its
    // stub map drains without a single release arriving.
    assert!(
        wait_until(|| service_b.stub_count() == 0).await,
        "server stubs must drain after transport_down"
    );

    // The client's proxies observe the loss on their next call.
    assert!(
        wait_until(|| {
            service_a
                .get_zone_proxy(zone_b.as_destination())
                .map(|proxy| proxy.is_remote_gone())
                .unwrap_or(true)
        })
        .await,
        "client zone proxy must be poisoned"
    );
    assert_eq!(calculator.add(1, 1).await.unwrap_err(), RpcError::ObjectGone);
    assert_eq!(
        directory.get_calculator().await.unwrap_err(),
        RpcError::ObjectGone
    );

    drop(calculator);
    drop(directory);
    assert!(wait_until(|| service_a.check_is_empty()).await);
    Ok(())
}
