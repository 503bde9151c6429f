//! TCP transport. Frames ride a byte stream and are delimited by the
//! envelope prefix's `payload_size`. A single writer task serves the
//! outbound queue; a single reader task parses inbound frames and
//! dispatches them, so each direction is strictly FIFO on the wire.

use super::{ConnectionHandler, ResultListener, Transport, TransportCore};
use crate::error::{result_from_code, RpcError, RpcResult};
use crate::marshaller::{BackChannel, CallOutput, Marshaller};
use crate::types::{
    AddRefOptions, CallerZoneId, DestinationZoneId, Encoding, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZoneId, MessageDirection, MethodId, ObjectId, ReleaseOptions,
    TransportStatus, ZoneId,
};
use crate::wire::{self, EnvelopePayload, EnvelopePrefix, PREFIX_SIZE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default per-call reply timeout over TCP.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single payload envelope.
const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;

/// A zone-to-zone edge over a TCP connection.
pub struct TcpTransport {
    core: TransportCore,
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending_transmits: Mutex<HashMap<u64, Arc<ResultListener>>>,
    sequence_number: AtomicU64,
    connection_handler: Mutex<Option<ConnectionHandler>>,
    call_timeout: Duration,
    self_weak: Weak<TcpTransport>,
}

impl TcpTransport {
    /// Connect to a listening peer. The adjacent zone identity is supplied
    /// by the caller and confirmed during the handshake.
    pub async fn connect(
        name: &str,
        service: &Arc<crate::service::Service>,
        adjacent_zone_id: ZoneId,
        addr: &str,
        buffer_size: usize,
    ) -> Result<Arc<Self>> {
        debug!(name, addr, "connecting TCP transport");
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        let stream = configure_socket(stream, buffer_size)?;
        Ok(Self::from_stream(
            name,
            service,
            adjacent_zone_id,
            stream,
            None,
        ))
    }

    /// Wrap an accepted connection. The adjacent zone is learned from the
    /// peer's handshake frame; `handler` runs `attach_remote_zone` when it
    /// arrives.
    pub fn accept(
        name: &str,
        service: &Arc<crate::service::Service>,
        stream: TcpStream,
        handler: ConnectionHandler,
    ) -> Arc<Self> {
        Self::from_stream(name, service, ZoneId::NULL, stream, Some(handler))
    }

    fn from_stream(
        name: &str,
        service: &Arc<crate::service::Service>,
        adjacent_zone_id: ZoneId,
        stream: TcpStream,
        handler: Option<ConnectionHandler>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let transport = Arc::new_cyclic(|self_weak| Self {
            core: TransportCore::new(name, service.zone_id(), adjacent_zone_id),
            outgoing_tx,
            pending_transmits: Mutex::new(HashMap::new()),
            sequence_number: AtomicU64::new(0),
            connection_handler: Mutex::new(handler),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            self_weak: self_weak.clone(),
        });
        transport.core.set_service(service);

        let writer = transport.clone();
        crate::sync::spawn(async move {
            writer.writer_loop(outgoing_rx, write_half).await;
        });
        let reader = transport.clone();
        crate::sync::spawn(async move {
            reader.reader_loop(read_half).await;
        });

        transport
    }

    fn self_dyn(&self) -> Option<Arc<dyn Transport>> {
        self.self_weak.upgrade().map(|t| t as Arc<dyn Transport>)
    }

    /// Single writer: the only task that touches the socket's send side.
    async fn writer_loop(
        self: Arc<Self>,
        mut outgoing_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut write_half: OwnedWriteHalf,
    ) {
        while let Some(frame) = outgoing_rx.recv().await {
            if frame.is_empty() {
                break;
            }
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(transport = self.core.name(), error = %e, "TCP write failed");
                break;
            }
            if let Err(e) = write_half.flush().await {
                debug!(transport = self.core.name(), error = %e, "TCP flush failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
        debug!(transport = self.core.name(), "writer loop finished");
    }

    /// Single reader: parses prefix-framed envelopes off the stream and
    /// dispatches them. Connection loss funnels into transport shutdown.
    async fn reader_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        loop {
            let mut prefix_bytes = [0u8; PREFIX_SIZE];
            if let Err(e) = read_half.read_exact(&mut prefix_bytes).await {
                debug!(transport = self.core.name(), error = %e, "TCP connection closed");
                break;
            }
            let prefix = match EnvelopePrefix::from_bytes(&prefix_bytes) {
                Ok(prefix) => prefix,
                Err(_) => {
                    warn!(transport = self.core.name(), "invalid frame prefix, closing");
                    break;
                }
            };
            if prefix.payload_size > MAX_PAYLOAD_SIZE {
                warn!(
                    transport = self.core.name(),
                    size = prefix.payload_size,
                    "oversized payload, closing"
                );
                break;
            }

            let mut payload = vec![0u8; prefix.payload_size as usize];
            if let Err(e) = read_half.read_exact(&mut payload).await {
                debug!(transport = self.core.name(), error = %e, "TCP connection closed mid-frame");
                break;
            }
            let envelope = match EnvelopePayload::from_bytes(&payload) {
                Ok(envelope) => envelope,
                Err(_) => {
                    warn!(transport = self.core.name(), "invalid payload envelope, closing");
                    break;
                }
            };

            match prefix.direction {
                MessageDirection::Reply => {
                    let listener = self.pending_transmits.lock().remove(&prefix.sequence_number);
                    match listener {
                        Some(listener) => listener.complete(envelope),
                        None => warn!(
                            transport = self.core.name(),
                            sequence = prefix.sequence_number,
                            "reply with no pending sender"
                        ),
                    }
                }
                MessageDirection::Send => {
                    let Some(transport) = self.self_dyn() else {
                        break;
                    };
                    let sink = self.frame_sink();
                    tokio::spawn(super::dispatch_frame(transport, prefix, envelope, sink));
                }
            }
        }

        self.cancel_pending(RpcError::CallCancelled);
        if let Some(transport) = self.self_dyn() {
            super::shutdown(&transport).await;
        }
    }

    fn frame_sink(&self) -> Arc<dyn Fn(Vec<u8>) + Send + Sync> {
        let outgoing = self.outgoing_tx.clone();
        Arc::new(move |frame| {
            let _ = outgoing.send(frame);
        })
    }

    fn cancel_pending(&self, error: RpcError) {
        let listeners: Vec<Arc<ResultListener>> =
            self.pending_transmits.lock().drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.fail(error);
        }
    }

    fn enqueue_frame(&self, frame: Vec<u8>) -> RpcResult<()> {
        self.outgoing_tx
            .send(frame)
            .map_err(|_| RpcError::TransportError)
    }

    async fn call_peer<Request, Reply>(
        &self,
        protocol_version: u64,
        request: &Request,
        request_fingerprint: u64,
    ) -> RpcResult<Reply>
    where
        Request: Serialize + Sync,
        Reply: DeserializeOwned,
    {
        let status = self.core.status();
        if status != TransportStatus::Connected && status != TransportStatus::Connecting {
            return Err(RpcError::CallCancelled);
        }

        let sequence = self.sequence_number.fetch_add(1, Ordering::AcqRel) + 1;
        let listener = ResultListener::new();
        self.pending_transmits
            .lock()
            .insert(sequence, listener.clone());

        let payload = wire::encode(Encoding::Binary, request)?;
        let frame = wire::build_frame(
            protocol_version,
            MessageDirection::Send,
            sequence,
            request_fingerprint,
            payload,
        )?;
        if let Err(e) = self.enqueue_frame(frame) {
            self.pending_transmits.lock().remove(&sequence);
            return Err(e);
        }

        let envelope = match listener.wait(self.call_timeout).await {
            Ok(envelope) => envelope,
            Err(e) => {
                self.pending_transmits.lock().remove(&sequence);
                return Err(e);
            }
        };
        wire::decode(Encoding::Binary, &envelope.payload)
            .map_err(|_| RpcError::ProxyDeserialisationError)
    }

    fn post_peer<Request: Serialize>(
        &self,
        protocol_version: u64,
        request: &Request,
        request_fingerprint: u64,
    ) {
        let sequence = self.sequence_number.fetch_add(1, Ordering::AcqRel) + 1;
        let Ok(payload) = wire::encode(Encoding::Binary, request) else {
            return;
        };
        let Ok(frame) = wire::build_frame(
            protocol_version,
            MessageDirection::Send,
            sequence,
            request_fingerprint,
            payload,
        ) else {
            return;
        };
        let _ = self.enqueue_frame(frame);
    }

    /// Graceful teardown: notify destinations, cancel in-flight calls and
    /// close the socket.
    pub async fn close(&self) {
        if let Some(transport) = self.self_dyn() {
            super::shutdown(&transport).await;
        }
        self.cancel_pending(RpcError::CallCancelled);
        let _ = self.outgoing_tx.send(Vec::new());
    }
}

/// Apply the low-latency socket options: no Nagle, explicit kernel buffer
/// sizes.
fn configure_socket(stream: TcpStream, buffer_size: usize) -> Result<TcpStream> {
    let std_stream = stream.into_std().context("detaching stream")?;
    let socket = socket2::Socket::from(std_stream.try_clone().context("cloning stream")?);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    TcpStream::from_std(std_stream).context("reattaching stream")
}

#[async_trait]
impl Transport for TcpTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn inner_connect(
        &self,
        input_descriptor: InterfaceDescriptor,
    ) -> RpcResult<InterfaceDescriptor> {
        let request = wire::CreateStubSend {
            caller_zone_id: self.core.zone_id(),
            input_descriptor,
        };
        let reply: wire::CreateStubReply = self
            .call_peer(
                crate::PROTOCOL_VERSION,
                &request,
                wire::CreateStubSend::fingerprint(crate::PROTOCOL_VERSION),
            )
            .await?;
        result_from_code(reply.err_code)?;
        self.core.set_adjacent_zone_id(reply.responder_zone_id);
        self.core.set_status(TransportStatus::Connected);
        Ok(reply.output_descriptor)
    }

    fn connection_handler(&self) -> Option<ConnectionHandler> {
        self.connection_handler.lock().clone()
    }
}

#[async_trait]
impl Marshaller for TcpTransport {
    async fn send(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_zone: CallerZoneId,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        in_data: &[u8],
        in_back_channel: &BackChannel,
    ) -> RpcResult<CallOutput> {
        let request = wire::CallSend {
            encoding,
            tag,
            caller_zone,
            destination_zone,
            object,
            interface,
            method,
            data: in_data.to_vec(),
            back_channel: in_back_channel.clone(),
        };
        let reply: wire::CallReply = self
            .call_peer(
                protocol_version,
                &request,
                wire::CallSend::fingerprint(protocol_version),
            )
            .await?;
        result_from_code(reply.err_code)?;
        Ok(CallOutput {
            data: reply.data,
            back_channel: reply.back_channel,
        })
    }

    async fn post(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_zone: CallerZoneId,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        in_data: &[u8],
        in_back_channel: &BackChannel,
    ) {
        let request = wire::PostSend {
            encoding,
            tag,
            caller_zone,
            destination_zone,
            object,
            interface,
            method,
            data: in_data.to_vec(),
            back_channel: in_back_channel.clone(),
        };
        self.post_peer(
            protocol_version,
            &request,
            wire::PostSend::fingerprint(protocol_version),
        );
    }

    async fn try_cast(
        &self,
        protocol_version: u64,
        caller_zone: CallerZoneId,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        interface: InterfaceOrdinal,
        in_back_channel: &BackChannel,
    ) -> RpcResult<BackChannel> {
        let request = wire::TryCastSend {
            caller_zone,
            destination_zone,
            object,
            interface,
            back_channel: in_back_channel.clone(),
        };
        let reply: wire::TryCastReply = self
            .call_peer(
                protocol_version,
                &request,
                wire::TryCastSend::fingerprint(protocol_version),
            )
            .await?;
        result_from_code(reply.err_code)?;
        Ok(reply.back_channel)
    }

    async fn add_ref(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        known_direction_zone: KnownDirectionZoneId,
        options: AddRefOptions,
        in_back_channel: &BackChannel,
    ) -> RpcResult<u64> {
        let request = wire::AddRefSend {
            destination_zone,
            object,
            caller_zone,
            known_direction_zone: known_direction_zone.value(),
            options: options.0,
            back_channel: in_back_channel.clone(),
        };
        let reply: wire::AddRefReply = self
            .call_peer(
                protocol_version,
                &request,
                wire::AddRefSend::fingerprint(protocol_version),
            )
            .await?;
        result_from_code(reply.err_code)?;
        Ok(reply.reference_count)
    }

    async fn release(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        options: ReleaseOptions,
        in_back_channel: &BackChannel,
    ) -> RpcResult<u64> {
        let request = wire::ReleaseSend {
            destination_zone,
            object,
            caller_zone,
            options: options.0,
            back_channel: in_back_channel.clone(),
        };
        let reply: wire::ReleaseReply = self
            .call_peer(
                protocol_version,
                &request,
                wire::ReleaseSend::fingerprint(protocol_version),
            )
            .await?;
        result_from_code(reply.err_code)?;
        Ok(reply.reference_count)
    }

    async fn object_released(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        object: ObjectId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    ) {
        let request = wire::ObjectReleasedSend {
            destination_zone,
            object,
            caller_zone,
            back_channel: in_back_channel.clone(),
        };
        self.post_peer(
            protocol_version,
            &request,
            wire::ObjectReleasedSend::fingerprint(protocol_version),
        );
    }

    async fn transport_down(
        &self,
        protocol_version: u64,
        destination_zone: DestinationZoneId,
        caller_zone: CallerZoneId,
        in_back_channel: &BackChannel,
    ) {
        let request = wire::TransportDownSend {
            destination_zone,
            caller_zone,
            back_channel: in_back_channel.clone(),
        };
        self.post_peer(
            protocol_version,
            &request,
            wire::TransportDownSend::fingerprint(protocol_version),
        );
    }
}
