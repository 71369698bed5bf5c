//! MQTT PUBLISH Decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_fixed_header, read_string, read_u16, MAX_REMAINING_LENGTH};
use crate::protocol::{DecodeError, PacketType, Properties, ProtocolVersion, Publish, QoS};

/// MQTT PUBLISH Decoder
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: ProtocolVersion,
}

impl Decoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: version,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Decode one complete PUBLISH packet from the start of `buf`
    /// Returns (publish, bytes_consumed)
    pub fn decode_publish_packet(&self, buf: &[u8]) -> Result<(Publish, usize), DecodeError> {
        let header = read_fixed_header(buf)?;
        if header.packet_type != PacketType::Publish {
            return Err(DecodeError::InvalidPacketType(header.packet_type as u8));
        }
        if header.remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = header.packet_len();
        if buf.len() < total_len {
            return Err(DecodeError::InsufficientData);
        }

        let publish = self.decode_publish(header.flags, &buf[header.header_len..total_len])?;
        Ok((publish, total_len))
    }

    /// Decode a PUBLISH body (variable header + payload) given the fixed
    /// header flags
    pub fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Publish, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        let (topic, len) = read_string(body)?;
        pos += len;

        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        let properties = match self.protocol_version {
            ProtocolVersion::V5 => {
                let (props, len) = Properties::decode(&body[pos..])?;
                pos += len;
                props
            }
            ProtocolVersion::V311 => Properties::default(),
        };

        Ok(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
            properties,
        })
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
