//! MQTT PUBLISH Encoder

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_string, write_variable_int};
use crate::protocol::{EncodeError, ProtocolVersion, Publish, QoS};

/// MQTT PUBLISH Encoder
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Remaining length a PUBLISH will declare in its fixed header
    pub fn publish_remaining_length(&self, packet: &Publish) -> usize {
        let mut remaining_length = 2 + packet.topic.len();

        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }

        if self.protocol_version == ProtocolVersion::V5 {
            let props_len = packet.properties.encoded_size();
            remaining_length += variable_int_len(props_len as u32) + props_len;
        }

        remaining_length + packet.payload.len()
    }

    /// Encode a full PUBLISH packet (fixed header included) into `buf`
    pub fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if packet.topic.contains(['+', '#']) {
            return Err(EncodeError::InvalidTopicName);
        }
        if (packet.qos == QoS::AtMostOnce) != packet.packet_id.is_none()
            || packet.packet_id == Some(0)
        {
            return Err(EncodeError::InvalidPacketId);
        }

        let remaining_length = self.publish_remaining_length(packet);
        buf.reserve(1 + variable_int_len(remaining_length as u32) + remaining_length);

        let mut first_byte: u8 = 0x30;
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, &packet.topic)?;

        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }

        if self.protocol_version == ProtocolVersion::V5 {
            packet.properties.encode(buf)?;
        }

        buf.put_slice(&packet.payload);

        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
