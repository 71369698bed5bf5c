//! Cluster Envelope
//!
//! Wraps an encoded MQTT packet with its routing metadata so it can ride a
//! gossip broadcast. The envelope is bincode encoded; the packet inside is
//! kept in its exact wire form.
//!
//! Envelopes carry no sequence number or timestamp. Receivers must treat
//! every envelope as possibly duplicated or reordered.

use std::fmt;

use bincode::{Decode, Encode};
use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::codec::{read_fixed_header, Decoder, Encoder, FixedHeader};
use crate::protocol::{DecodeError, EncodeError, PacketType, ProtocolVersion, Publish};

/// Envelope `kind` for relayed PUBLISH packets
pub const MESSAGE_TYPE_PUBLISH: u8 = PacketType::Publish as u8;

/// Upper bound on an encoded envelope accepted by the decoder
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_ENVELOPE_SIZE>()
}

/// Errors produced while building or opening an envelope
#[derive(Debug)]
pub enum MessageError {
    /// The packet could not be wire-encoded
    Encode(EncodeError),
    /// The envelope could not be serialized
    Serialize(bincode::error::EncodeError),
    /// The envelope bytes are malformed
    Deserialize(bincode::error::DecodeError),
    /// Bytes left over after the envelope
    TrailingBytes(usize),
    /// The carried packet is malformed
    Packet(DecodeError),
    /// The envelope or packet is not of the expected kind
    UnexpectedType(u8),
    /// Protocol level the codec does not speak
    UnsupportedProtocolVersion(u8),
    /// Declared remaining length disagrees with the carried bytes
    LengthMismatch { declared: usize, available: usize },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "packet encode failed: {}", e),
            Self::Serialize(e) => write!(f, "envelope encode failed: {}", e),
            Self::Deserialize(e) => write!(f, "envelope decode failed: {}", e),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after envelope", n),
            Self::Packet(e) => write!(f, "packet decode failed: {}", e),
            Self::UnexpectedType(t) => write!(f, "unexpected message type: {}", t),
            Self::UnsupportedProtocolVersion(v) => {
                write!(f, "unsupported protocol version: {}", v)
            }
            Self::LengthMismatch {
                declared,
                available,
            } => write!(
                f,
                "remaining length {} does not match {} available bytes",
                declared, available
            ),
        }
    }
}

impl std::error::Error for MessageError {}

impl From<EncodeError> for MessageError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<DecodeError> for MessageError {
    fn from(e: DecodeError) -> Self {
        Self::Packet(e)
    }
}

impl From<bincode::error::EncodeError> for MessageError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialize(e)
    }
}

impl From<bincode::error::DecodeError> for MessageError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Deserialize(e)
    }
}

/// Envelope exchanged between nodes
///
/// Built fresh for each relay and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize)]
pub struct Message {
    /// Packet kind carried in `payload`
    #[serde(rename = "type")]
    pub kind: u8,
    /// Node the packet was published on
    #[serde(rename = "node-id")]
    pub node_id: String,
    /// Client that published it
    #[serde(rename = "client-id")]
    pub client_id: String,
    /// MQTT protocol level of the originating client
    #[serde(rename = "protocol-version")]
    pub protocol_version: u8,
    /// Complete wire encoding of the packet, fixed header included
    pub payload: Vec<u8>,
}

impl Message {
    /// Wrap a PUBLISH published locally by `client_id`
    pub fn publish(
        node_id: &str,
        client_id: &str,
        protocol_version: ProtocolVersion,
        publish: &Publish,
    ) -> Result<Self, MessageError> {
        let mut buf = BytesMut::new();
        Encoder::new(protocol_version).encode_publish(publish, &mut buf)?;

        Ok(Self {
            kind: MESSAGE_TYPE_PUBLISH,
            node_id: node_id.to_string(),
            client_id: client_id.to_string(),
            protocol_version: protocol_version as u8,
            payload: buf.to_vec(),
        })
    }

    /// Serialize to the binary envelope form
    pub fn to_bytes(&self) -> Result<Bytes, MessageError> {
        Ok(Bytes::from(bincode::encode_to_vec(self, bincode_config())?))
    }

    /// Parse the binary envelope form
    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageError> {
        let (message, used): (Self, usize) = bincode::decode_from_slice(data, bincode_config())?;
        if used != data.len() {
            return Err(MessageError::TrailingBytes(data.len() - used));
        }
        Ok(message)
    }

    /// JSON form for diagnostics
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Rebuild the PUBLISH carried by this envelope
    pub fn to_publish(&self) -> Result<RemotePublish, MessageError> {
        if self.kind != MESSAGE_TYPE_PUBLISH {
            return Err(MessageError::UnexpectedType(self.kind));
        }

        let protocol_version = ProtocolVersion::from_u8(self.protocol_version)
            .ok_or(MessageError::UnsupportedProtocolVersion(self.protocol_version))?;

        let (header, offset) = publish_body_offset(&self.payload)?;
        let publish =
            Decoder::new(protocol_version).decode_publish(header.flags, &self.payload[offset..])?;

        Ok(RemotePublish {
            node_id: self.node_id.clone(),
            client_id: self.client_id.clone(),
            protocol_version,
            publish,
        })
    }
}

/// A PUBLISH received from another node, with the metadata its envelope
/// carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePublish {
    pub node_id: String,
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub publish: Publish,
}

/// Locate the PUBLISH body inside a wire-encoded packet
///
/// The fixed header is parsed first to learn the remaining length; the body
/// starts at `payload.len() - remaining_length`. That offset must land
/// exactly at the end of the fixed header, otherwise the packet was
/// truncated or padded in transit.
pub fn publish_body_offset(payload: &[u8]) -> Result<(FixedHeader, usize), MessageError> {
    let header = read_fixed_header(payload)?;
    if header.packet_type != PacketType::Publish {
        return Err(MessageError::UnexpectedType(header.packet_type as u8));
    }

    let available = payload.len() - header.header_len;
    let offset = payload
        .len()
        .checked_sub(header.remaining_length)
        .filter(|offset| *offset == header.header_len)
        .ok_or(MessageError::LengthMismatch {
            declared: header.remaining_length,
            available,
        })?;

    Ok((header, offset))
}

/// Build and serialize the envelope for a locally published PUBLISH
pub fn encode_publish(
    node_id: &str,
    client_id: &str,
    protocol_version: ProtocolVersion,
    publish: &Publish,
) -> Result<Bytes, MessageError> {
    Message::publish(node_id, client_id, protocol_version, publish)?.to_bytes()
}

/// Parse a binary envelope
pub fn decode_envelope(data: &[u8]) -> Result<Message, MessageError> {
    Message::from_bytes(data)
}

/// Rebuild the PUBLISH inside a decoded envelope
pub fn reconstruct_publish(message: &Message) -> Result<RemotePublish, MessageError> {
    message.to_publish()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::protocol::{Properties, QoS};

    fn temp_publish() -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Arc::from("sensors/temp"),
            packet_id: Some(1),
            payload: Bytes::from_static(&[0x17]),
            properties: Properties::default(),
        }
    }

    #[test]
    fn test_sensor_publish_roundtrip() {
        let publish = temp_publish();
        let bytes = encode_publish("node-a", "c1", ProtocolVersion::V5, &publish).unwrap();

        let message = decode_envelope(&bytes).unwrap();
        assert_eq!(message.kind, MESSAGE_TYPE_PUBLISH);
        assert_eq!(message.node_id, "node-a");
        assert_eq!(message.client_id, "c1");
        assert_eq!(message.protocol_version, 5);

        let remote = reconstruct_publish(&message).unwrap();
        assert_eq!(remote.publish, publish);
        assert_eq!(remote.client_id, "c1");
        assert_eq!(remote.node_id, "node-a");
        assert_eq!(remote.protocol_version, ProtocolVersion::V5);
    }

    #[test]
    fn test_envelope_bytes_roundtrip_exactly() {
        let message = Message::publish("n", "c", ProtocolVersion::V311, &temp_publish()).unwrap();
        let bytes = message.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_truncated_envelope_is_decode_error() {
        let bytes = encode_publish("n", "c", ProtocolVersion::V5, &temp_publish()).unwrap();
        for cut in 0..bytes.len() {
            assert!(matches!(
                decode_envelope(&bytes[..cut]),
                Err(MessageError::Deserialize(_))
            ));
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_publish("n", "c", ProtocolVersion::V5, &temp_publish())
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            decode_envelope(&bytes),
            Err(MessageError::TrailingBytes(2))
        ));
    }

    #[test]
    fn test_unexpected_kind() {
        let mut message =
            Message::publish("n", "c", ProtocolVersion::V5, &temp_publish()).unwrap();
        message.kind = PacketType::Subscribe as u8;
        assert!(matches!(
            reconstruct_publish(&message),
            Err(MessageError::UnexpectedType(8))
        ));
    }

    #[test]
    fn test_unsupported_protocol_version() {
        let mut message =
            Message::publish("n", "c", ProtocolVersion::V311, &temp_publish()).unwrap();
        message.protocol_version = 3;
        assert!(matches!(
            reconstruct_publish(&message),
            Err(MessageError::UnsupportedProtocolVersion(3))
        ));
    }

    #[test]
    fn test_truncated_packet_is_length_mismatch() {
        let mut message =
            Message::publish("n", "c", ProtocolVersion::V5, &temp_publish()).unwrap();
        message.payload.pop();
        assert!(matches!(
            reconstruct_publish(&message),
            Err(MessageError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_padded_packet_is_length_mismatch() {
        let mut message =
            Message::publish("n", "c", ProtocolVersion::V5, &temp_publish()).unwrap();
        message.payload.push(0xFF);
        assert!(matches!(
            reconstruct_publish(&message),
            Err(MessageError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_fixed_header() {
        let mut message =
            Message::publish("n", "c", ProtocolVersion::V5, &temp_publish()).unwrap();
        message.payload = vec![0x30, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            reconstruct_publish(&message),
            Err(MessageError::Packet(DecodeError::InvalidRemainingLength))
        ));

        message.payload.clear();
        assert!(matches!(
            reconstruct_publish(&message),
            Err(MessageError::Packet(DecodeError::InsufficientData))
        ));
    }

    #[test]
    fn test_json_uses_wire_field_names() {
        let message = Message::publish("n1", "c1", ProtocolVersion::V5, &temp_publish()).unwrap();
        let json = message.to_json().unwrap();
        assert!(json.contains("\"type\":3"));
        assert!(json.contains("\"node-id\":\"n1\""));
        assert!(json.contains("\"client-id\":\"c1\""));
        assert!(json.contains("\"protocol-version\":5"));
    }

    fn arb_properties() -> impl Strategy<Value = Properties> {
        (
            proptest::option::of(any::<u32>()),
            proptest::option::of("[a-z]{1,12}/[a-z0-9.+-]{1,16}"),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64)),
            proptest::collection::vec(1u32..=268_435_455, 0..4),
            proptest::collection::vec(("\\PC{0,12}", "\\PC{0,24}"), 0..4),
        )
            .prop_map(
                |(message_expiry_interval, content_type, correlation_data, subscription_identifiers, user_properties)| {
                    Properties {
                        message_expiry_interval,
                        content_type,
                        correlation_data: correlation_data.map(Bytes::from),
                        subscription_identifiers,
                        user_properties,
                        ..Default::default()
                    }
                },
            )
    }

    fn arb_publish() -> impl Strategy<Value = Publish> {
        (
            "[a-z]{1,8}(/[a-z0-9]{1,8}){0,4}",
            0u8..3,
            any::<bool>(),
            1u16..,
            proptest::collection::vec(any::<u8>(), 0..512),
            arb_properties(),
        )
            .prop_map(|(topic, qos, retain, packet_id, payload, properties)| {
                let qos = QoS::from_u8(qos).unwrap();
                Publish {
                    dup: false,
                    qos,
                    retain,
                    topic: Arc::from(topic.as_str()),
                    packet_id: (qos != QoS::AtMostOnce).then_some(packet_id),
                    payload: Bytes::from(payload),
                    properties,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_publish_survives_relay(mut publish in arb_publish(), v5 in any::<bool>()) {
            let version = if v5 { ProtocolVersion::V5 } else { ProtocolVersion::V311 };
            // v3.1.1 has no property block
            if !v5 {
                publish.properties = Properties::default();
            }
            let bytes = encode_publish("node", "client", version, &publish).unwrap();
            let remote = reconstruct_publish(&decode_envelope(&bytes).unwrap()).unwrap();
            prop_assert_eq!(remote.publish, publish);
            prop_assert_eq!(remote.protocol_version, version);
        }

        #[test]
        fn prop_body_offset_law(publish in arb_publish()) {
            let message = Message::publish("node", "client", ProtocolVersion::V5, &publish).unwrap();
            let (header, offset) = publish_body_offset(&message.payload).unwrap();
            prop_assert_eq!(offset, message.payload.len() - header.remaining_length);
            prop_assert!(offset < message.payload.len());
        }

        #[test]
        fn prop_garbage_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            if let Ok(message) = decode_envelope(&data) {
                let _ = reconstruct_publish(&message);
            }
        }
    }
}
