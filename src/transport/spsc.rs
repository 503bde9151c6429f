//! In-process single-producer/single-consumer queue transport.
//!
//! Unlike the local transport this one carries full wire envelopes: every
//! operation is serialised into a prefix + payload frame, pushed onto the
//! outbound queue, and drained by a single producer loop into the peer's
//! receive queue, whose single consumer loop parses and dispatches frames.
//! Replies are matched to their senders by sequence number through the
//! `pending_transmits` table.
//!
//! Message-oriented: one envelope per queue message.

use super::{ConnectionHandler, ResultListener, Transport, TransportCore};
use crate::error::{result_from_code, RpcError, RpcResult};
use crate::marshaller::{BackChannel, CallOutput, Marshaller};
use crate::types::{
    AddRefOptions, CallerZoneId, DestinationZoneId, Encoding, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZoneId, MessageDirection, MethodId, ObjectId, ReleaseOptions,
    TransportStatus, ZoneId,
};
use crate::wire::{self, EnvelopePayload, EnvelopePrefix, PREFIX_SIZE};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use async_trait::async_trait;

/// Default per-call reply timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// One end of an SPSC queue pair.
pub struct SpscTransport {
    core: TransportCore,
    // Callers enqueue frames here; the producer loop is the only writer to
    // the wire.
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    wire_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    wire_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    pending_transmits: Mutex<HashMap<u64, Arc<ResultListener>>>,
    sequence_number: AtomicU64,
    connection_handler: Mutex<Option<ConnectionHandler>>,
    call_timeout: Duration,
    self_weak: Weak<SpscTransport>,
}

impl SpscTransport {
    /// Create both ends of a queue pair linking `zone_a` and `zone_b`.
    /// `start_pumps` must be called on each end before traffic flows.
    pub fn pair(
        name: &str,
        zone_a: ZoneId,
        zone_b: ZoneId,
    ) -> (Arc<SpscTransport>, Arc<SpscTransport>) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
        let a = Self::new(
            &format!("{name}:{zone_a}->{zone_b}"),
            zone_a,
            zone_b,
            a_to_b_tx,
            b_to_a_rx,
        );
        let b = Self::new(
            &format!("{name}:{zone_b}->{zone_a}"),
            zone_b,
            zone_a,
            b_to_a_tx,
            a_to_b_rx,
        );
        (a, b)
    }

    fn new(
        name: &str,
        zone_id: ZoneId,
        adjacent_zone_id: ZoneId,
        wire_tx: mpsc::UnboundedSender<Vec<u8>>,
        wire_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|self_weak| Self {
            core: TransportCore::new(name, zone_id, adjacent_zone_id),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            wire_tx: Mutex::new(Some(wire_tx)),
            wire_rx: Mutex::new(Some(wire_rx)),
            pending_transmits: Mutex::new(HashMap::new()),
            sequence_number: AtomicU64::new(0),
            connection_handler: Mutex::new(None),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            self_weak: self_weak.clone(),
        })
    }

    pub fn set_connection_handler(&self, handler: ConnectionHandler) {
        *self.connection_handler.lock() = Some(handler);
    }

    fn self_dyn(&self) -> Option<Arc<dyn Transport>> {
        self.self_weak.upgrade().map(|t| t as Arc<dyn Transport>)
    }

    /// Start the producer and consumer loops.
    pub fn start_pumps(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let Some(outgoing_rx) = self.outgoing_rx.lock().take() else {
            return;
        };
        let Some(wire_tx) = self.wire_tx.lock().take() else {
            return;
        };
        let Some(wire_rx) = self.wire_rx.lock().take() else {
            return;
        };

        let producer = this.clone();
        crate::sync::spawn(async move {
            producer.producer_loop(outgoing_rx, wire_tx).await;
        });

        crate::sync::spawn(async move {
            this.consumer_loop(wire_rx).await;
        });
    }

    /// The single writer to the wire. An empty frame is the shutdown
    /// sentinel: it closes the wire so the peer's consumer observes the
    /// disconnect.
    async fn producer_loop(
        self: Arc<Self>,
        mut outgoing_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        wire_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        while let Some(frame) = outgoing_rx.recv().await {
            if frame.is_empty() {
                break;
            }
            if wire_tx.send(frame).is_err() {
                debug!(transport = self.core.name(), "peer receive queue closed");
                break;
            }
        }
        drop(wire_tx);
        debug!(transport = self.core.name(), "producer loop finished");
    }

    /// The single reader of the wire. Frames are parsed here; send-direction
    /// frames are dispatched on their own tasks so a handler that issues
    /// nested calls cannot stall the pump.
    async fn consumer_loop(self: Arc<Self>, mut wire_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(frame) = wire_rx.recv().await {
            if frame.len() < PREFIX_SIZE {
                warn!(transport = self.core.name(), "runt frame dropped");
                continue;
            }
            let prefix = match EnvelopePrefix::from_bytes(&frame[..PREFIX_SIZE]) {
                Ok(prefix) => prefix,
                Err(_) => {
                    warn!(transport = self.core.name(), "invalid frame prefix dropped");
                    continue;
                }
            };
            let envelope = match EnvelopePayload::from_bytes(&frame[PREFIX_SIZE..]) {
                Ok(envelope) => envelope,
                Err(_) => {
                    warn!(transport = self.core.name(), "invalid payload envelope dropped");
                    continue;
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

        debug!(transport = self.core.name(), "receive queue closed");
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

    /// Send a payload and wait for the matching reply envelope.
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
                // A reply landing after expiry is logged and dropped by the
                // consumer loop.
                self.pending_transmits.lock().remove(&sequence);
                return Err(e);
            }
        };
        wire::decode(Encoding::Binary, &envelope.payload)
            .map_err(|_| RpcError::ProxyDeserialisationError)
    }

    /// Fire a payload without registering a reply listener.
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

    /// Graceful teardown of this end: notifies destinations, cancels
    /// pending calls and closes the wire so the peer observes the
    /// disconnect.
    pub async fn close(&self) {
        if let Some(transport) = self.self_dyn() {
            super::shutdown(&transport).await;
        }
        self.cancel_pending(RpcError::CallCancelled);
        let _ = self.outgoing_tx.send(Vec::new());
    }
}

#[async_trait]
impl Transport for SpscTransport {
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
impl Marshaller for SpscTransport {
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
