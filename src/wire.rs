//! # Wire Envelope and Codec Dispatch
//!
//! Every frame a remote transport carries is a fixed-size prefix followed by
//! a payload envelope:
//!
//! ```text
//! frame   := prefix || payload_envelope
//! prefix  := u64 version | u8 direction | u64 seq | u64 payload_size
//! payload_envelope := u64 fingerprint | <encoding-specific bytes>
//! ```
//!
//! Byte-stream transports (TCP) frame on the prefix's `payload_size`;
//! message-oriented transports (SPSC) carry one envelope per message. The
//! envelope itself is always binary; the declared `Encoding` applies to
//! method argument payloads inside `CallSend`/`CallReply`.
//!
//! Each payload type owns a fingerprint derived from its base constant and
//! the protocol version, so a receiver can dispatch an inbound frame without
//! per-method tables.

use crate::error::{RpcError, RpcResult};
use crate::marshaller::BackChannel;
use crate::types::{
    CallerZoneId, DestinationZoneId, Encoding, InterfaceDescriptor, InterfaceOrdinal,
    MessageDirection, MethodId, ObjectId, ZoneId,
};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Size of the fixed envelope prefix in bytes.
pub const PREFIX_SIZE: usize = 25;

/// Fixed-size frame header preceding every payload envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopePrefix {
    pub version: u64,
    pub direction: MessageDirection,
    pub sequence_number: u64,
    pub payload_size: u64,
}

impl EnvelopePrefix {
    pub fn to_bytes(&self) -> [u8; PREFIX_SIZE] {
        let mut buf = [0u8; PREFIX_SIZE];
        buf[0..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8] = self.direction as u8;
        buf[9..17].copy_from_slice(&self.sequence_number.to_le_bytes());
        buf[17..25].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> RpcResult<Self> {
        if bytes.len() < PREFIX_SIZE {
            return Err(RpcError::InvalidData);
        }
        let version = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let direction =
            MessageDirection::from_u8(bytes[8]).ok_or(RpcError::InvalidData)?;
        let sequence_number = u64::from_le_bytes(bytes[9..17].try_into().unwrap());
        let payload_size = u64::from_le_bytes(bytes[17..25].try_into().unwrap());
        Ok(Self {
            version,
            direction,
            sequence_number,
            payload_size,
        })
    }
}

/// Fingerprinted payload carried after the prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopePayload {
    pub payload_fingerprint: u64,
    pub payload: Vec<u8>,
}

impl EnvelopePayload {
    /// Serialise (always binary - the envelope is the framing layer, not the
    /// argument codec).
    pub fn to_bytes(&self) -> RpcResult<Vec<u8>> {
        bincode::serialize(self).map_err(|_| RpcError::InvalidData)
    }

    pub fn from_bytes(bytes: &[u8]) -> RpcResult<Self> {
        bincode::deserialize(bytes).map_err(|_| RpcError::ProxyDeserialisationError)
    }
}

/// Encode a value with the requested payload encoding.
pub fn encode<T: Serialize>(encoding: Encoding, value: &T) -> RpcResult<Vec<u8>> {
    match encoding {
        Encoding::Binary => bincode::serialize(value).map_err(|_| RpcError::InvalidData),
        Encoding::CompressedBinary => {
            let raw = bincode::serialize(value).map_err(|_| RpcError::InvalidData)?;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&raw)
                .and_then(|_| encoder.finish())
                .map_err(|_| RpcError::InvalidData)
        }
        Encoding::Json => serde_json::to_vec(value).map_err(|_| RpcError::InvalidData),
        Encoding::ProtocolBuffers => {
            tracing::error!("protocol buffers encoding requested but not built in");
            Err(RpcError::InvalidData)
        }
    }
}

/// Decode a value previously produced by [`encode`] with the same encoding.
pub fn decode<T: DeserializeOwned>(encoding: Encoding, bytes: &[u8]) -> RpcResult<T> {
    match encoding {
        Encoding::Binary => {
            bincode::deserialize(bytes).map_err(|_| RpcError::ProxyDeserialisationError)
        }
        Encoding::CompressedBinary => {
            let mut raw = Vec::new();
            ZlibDecoder::new(bytes)
                .read_to_end(&mut raw)
                .map_err(|_| RpcError::ProxyDeserialisationError)?;
            bincode::deserialize(&raw).map_err(|_| RpcError::ProxyDeserialisationError)
        }
        Encoding::Json => {
            serde_json::from_slice(bytes).map_err(|_| RpcError::ProxyDeserialisationError)
        }
        Encoding::ProtocolBuffers => Err(RpcError::ProxyDeserialisationError),
    }
}

/// Fold the protocol version into a payload type's base constant. One
/// fingerprint per payload type per version.
pub fn fingerprint(base: u64, protocol_version: u64) -> u64 {
    base ^ (protocol_version << 56)
}

/// Base fingerprint constants, one per payload type.
pub mod fingerprints {
    pub const CALL_SEND: u64 = 0x00C0_FFEE_0001;
    pub const CALL_REPLY: u64 = 0x00C0_FFEE_0002;
    pub const POST_SEND: u64 = 0x00C0_FFEE_0003;
    pub const TRY_CAST_SEND: u64 = 0x00C0_FFEE_0004;
    pub const TRY_CAST_REPLY: u64 = 0x00C0_FFEE_0005;
    pub const ADD_REF_SEND: u64 = 0x00C0_FFEE_0006;
    pub const ADD_REF_REPLY: u64 = 0x00C0_FFEE_0007;
    pub const RELEASE_SEND: u64 = 0x00C0_FFEE_0008;
    pub const RELEASE_REPLY: u64 = 0x00C0_FFEE_0009;
    pub const OBJECT_RELEASED_SEND: u64 = 0x00C0_FFEE_000A;
    pub const TRANSPORT_DOWN_SEND: u64 = 0x00C0_FFEE_000B;
    pub const CREATE_STUB_SEND: u64 = 0x00C0_FFEE_000C;
    pub const CREATE_STUB_REPLY: u64 = 0x00C0_FFEE_000D;
}

macro_rules! payload_type {
    ($name:ident, $base:expr) => {
        impl $name {
            pub fn fingerprint(protocol_version: u64) -> u64 {
                fingerprint($base, protocol_version)
            }
        }
    };
}

/// A method invocation expecting a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSend {
    pub encoding: Encoding,
    pub tag: u64,
    pub caller_zone: CallerZoneId,
    pub destination_zone: DestinationZoneId,
    pub object: ObjectId,
    pub interface: InterfaceOrdinal,
    pub method: MethodId,
    pub data: Vec<u8>,
    pub back_channel: BackChannel,
}
payload_type!(CallSend, fingerprints::CALL_SEND);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReply {
    pub err_code: i32,
    pub data: Vec<u8>,
    pub back_channel: BackChannel,
}
payload_type!(CallReply, fingerprints::CALL_REPLY);

/// A fire-and-forget invocation; no reply frame is ever produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSend {
    pub encoding: Encoding,
    pub tag: u64,
    pub caller_zone: CallerZoneId,
    pub destination_zone: DestinationZoneId,
    pub object: ObjectId,
    pub interface: InterfaceOrdinal,
    pub method: MethodId,
    pub data: Vec<u8>,
    pub back_channel: BackChannel,
}
payload_type!(PostSend, fingerprints::POST_SEND);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryCastSend {
    pub caller_zone: CallerZoneId,
    pub destination_zone: DestinationZoneId,
    pub object: ObjectId,
    pub interface: InterfaceOrdinal,
    pub back_channel: BackChannel,
}
payload_type!(TryCastSend, fingerprints::TRY_CAST_SEND);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryCastReply {
    pub err_code: i32,
    pub back_channel: BackChannel,
}
payload_type!(TryCastReply, fingerprints::TRY_CAST_REPLY);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRefSend {
    pub destination_zone: DestinationZoneId,
    pub object: ObjectId,
    pub caller_zone: CallerZoneId,
    pub known_direction_zone: u64,
    pub options: u64,
    pub back_channel: BackChannel,
}
payload_type!(AddRefSend, fingerprints::ADD_REF_SEND);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRefReply {
    pub err_code: i32,
    pub reference_count: u64,
    pub back_channel: BackChannel,
}
payload_type!(AddRefReply, fingerprints::ADD_REF_REPLY);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSend {
    pub destination_zone: DestinationZoneId,
    pub object: ObjectId,
    pub caller_zone: CallerZoneId,
    pub options: u64,
    pub back_channel: BackChannel,
}
payload_type!(ReleaseSend, fingerprints::RELEASE_SEND);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReply {
    pub err_code: i32,
    pub reference_count: u64,
    pub back_channel: BackChannel,
}
payload_type!(ReleaseReply, fingerprints::RELEASE_REPLY);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectReleasedSend {
    pub destination_zone: DestinationZoneId,
    pub object: ObjectId,
    pub caller_zone: CallerZoneId,
    pub back_channel: BackChannel,
}
payload_type!(ObjectReleasedSend, fingerprints::OBJECT_RELEASED_SEND);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportDownSend {
    pub destination_zone: DestinationZoneId,
    pub caller_zone: CallerZoneId,
    pub back_channel: BackChannel,
}
payload_type!(TransportDownSend, fingerprints::TRANSPORT_DOWN_SEND);

/// Handshake request: carries the connecting side's zone identity and input
/// descriptor so the peer can run its connection handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStubSend {
    pub caller_zone_id: ZoneId,
    pub input_descriptor: InterfaceDescriptor,
}
payload_type!(CreateStubSend, fingerprints::CREATE_STUB_SEND);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStubReply {
    pub err_code: i32,
    pub responder_zone_id: ZoneId,
    pub output_descriptor: InterfaceDescriptor,
}
payload_type!(CreateStubReply, fingerprints::CREATE_STUB_REPLY);

/// Build a complete frame (prefix || payload envelope) ready for a
/// byte-stream or message transport.
pub fn build_frame(
    protocol_version: u64,
    direction: MessageDirection,
    sequence_number: u64,
    payload_fingerprint: u64,
    payload: Vec<u8>,
) -> RpcResult<Vec<u8>> {
    let envelope = EnvelopePayload {
        payload_fingerprint,
        payload,
    };
    let body = envelope.to_bytes()?;
    let prefix = EnvelopePrefix {
        version: protocol_version,
        direction,
        sequence_number,
        payload_size: body.len() as u64,
    };
    let mut frame = Vec::with_capacity(PREFIX_SIZE + body.len());
    frame.extend_from_slice(&prefix.to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshaller::BackChannelEntry;

    #[test]
    fn prefix_round_trip() {
        let prefix = EnvelopePrefix {
            version: 2,
            direction: MessageDirection::Reply,
            sequence_number: 0xDEAD_BEEF,
            payload_size: 4096,
        };
        let bytes = prefix.to_bytes();
        assert_eq!(bytes.len(), PREFIX_SIZE);
        assert_eq!(EnvelopePrefix::from_bytes(&bytes).unwrap(), prefix);
    }

    #[test]
    fn prefix_rejects_short_or_garbage_input() {
        assert!(EnvelopePrefix::from_bytes(&[0u8; 10]).is_err());
        let mut bytes = [0u8; PREFIX_SIZE];
        bytes[8] = 99; // invalid direction
        assert!(EnvelopePrefix::from_bytes(&bytes).is_err());
    }

    fn sample_call() -> CallSend {
        CallSend {
            encoding: Encoding::Binary,
            tag: 7,
            caller_zone: CallerZoneId(1),
            destination_zone: DestinationZoneId(2),
            object: ObjectId(3),
            interface: InterfaceOrdinal(4),
            method: MethodId(5),
            data: vec![1, 2, 3, 4, 5],
            back_channel: vec![BackChannelEntry {
                tag: 9,
                data: vec![6, 7],
            }],
        }
    }

    #[test]
    fn payload_round_trip_all_supported_encodings() {
        let call = sample_call();
        for encoding in [
            Encoding::Binary,
            Encoding::CompressedBinary,
            Encoding::Json,
        ] {
            let bytes = encode(encoding, &call).unwrap();
            let back: CallSend = decode(encoding, &bytes).unwrap();
            assert_eq!(back.object, call.object);
            assert_eq!(back.data, call.data);
            assert_eq!(back.back_channel.len(), 1);
            assert_eq!(back.back_channel[0].tag, 9);
        }
    }

    #[test]
    fn protobuf_encoding_is_rejected() {
        let call = sample_call();
        assert_eq!(
            encode(Encoding::ProtocolBuffers, &call),
            Err(RpcError::InvalidData)
        );
    }

    #[test]
    fn compressed_binary_shrinks_repetitive_payloads() {
        let mut call = sample_call();
        call.data = vec![0x42; 64 * 1024];
        let plain = encode(Encoding::Binary, &call).unwrap();
        let packed = encode(Encoding::CompressedBinary, &call).unwrap();
        assert!(packed.len() < plain.len() / 4);
        let back: CallSend = decode(Encoding::CompressedBinary, &packed).unwrap();
        assert_eq!(back.data, call.data);
    }

    #[test]
    fn fingerprints_differ_by_version_and_type() {
        assert_ne!(CallSend::fingerprint(1), CallSend::fingerprint(2));
        assert_ne!(CallSend::fingerprint(2), CallReply::fingerprint(2));
    }

    #[test]
    fn frame_round_trip() {
        let payload = encode(Encoding::Binary, &sample_call()).unwrap();
        let frame = build_frame(
            2,
            MessageDirection::Send,
            42,
            CallSend::fingerprint(2),
            payload.clone(),
        )
        .unwrap();
        let prefix = EnvelopePrefix::from_bytes(&frame[..PREFIX_SIZE]).unwrap();
        assert_eq!(prefix.sequence_number, 42);
        assert_eq!(prefix.payload_size as usize, frame.len() - PREFIX_SIZE);
        let envelope = EnvelopePayload::from_bytes(&frame[PREFIX_SIZE..]).unwrap();
        assert_eq!(envelope.payload_fingerprint, CallSend::fingerprint(2));
        assert_eq!(envelope.payload, payload);
    }
}
