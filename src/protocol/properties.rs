//! MQTT v5.0 PUBLISH Properties
//!
//! Only the properties a PUBLISH may carry (MQTT v5.0 section 3.3.2.3)
//! are modelled. Anything else in a relayed packet is a decode error.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, variable_int_len,
    write_binary, write_string, write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers valid on PUBLISH (MQTT v5.0, table 2-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    TopicAlias = 0x23,
    UserProperty = 0x26,
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(PropertyId::PayloadFormatIndicator),
            0x02 => Some(PropertyId::MessageExpiryInterval),
            0x03 => Some(PropertyId::ContentType),
            0x08 => Some(PropertyId::ResponseTopic),
            0x09 => Some(PropertyId::CorrelationData),
            0x0B => Some(PropertyId::SubscriptionIdentifier),
            0x23 => Some(PropertyId::TopicAlias),
            0x26 => Some(PropertyId::UserProperty),
            _ => None,
        }
    }

    /// Identifiers defined by MQTT v5.0 but not allowed on PUBLISH
    fn is_known_elsewhere(v: u8) -> bool {
        matches!(
            v,
            0x11..=0x13 | 0x15..=0x1A | 0x1C | 0x1F | 0x21 | 0x22 | 0x24 | 0x25 | 0x27..=0x2A
        )
    }
}

/// PUBLISH properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub topic_alias: Option<u16>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Encoded size of the property block, excluding its length prefix
    pub fn encoded_size(&self) -> usize {
        let mut size = 0;

        if self.payload_format_indicator.is_some() {
            size += 2;
        }
        if self.message_expiry_interval.is_some() {
            size += 5;
        }
        if let Some(ref s) = self.content_type {
            size += 3 + s.len();
        }
        if let Some(ref s) = self.response_topic {
            size += 3 + s.len();
        }
        if let Some(ref d) = self.correlation_data {
            size += 3 + d.len();
        }
        for id in &self.subscription_identifiers {
            size += 1 + variable_int_len(*id);
        }
        if self.topic_alias.is_some() {
            size += 3;
        }
        for (k, v) in &self.user_properties {
            size += 5 + k.len() + v.len();
        }

        size
    }

    /// Decode a property block (length prefix included)
    /// Returns (properties, bytes_consumed)
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (prop_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + prop_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let block = &buf[..end];
        let mut props = Properties::new();
        let mut pos = len_bytes;

        while pos < end {
            let (raw_id, id_len) = read_variable_int(&block[pos..])?;
            pos += id_len;
            // Every defined identifier fits in a single varint byte
            if raw_id > 0x7F {
                return Err(DecodeError::InvalidPropertyId(raw_id));
            }
            let raw_id = raw_id as u8;

            let Some(prop_id) = PropertyId::from_u8(raw_id) else {
                if PropertyId::is_known_elsewhere(raw_id) {
                    return Err(DecodeError::UnexpectedProperty(raw_id));
                }
                return Err(DecodeError::InvalidPropertyId(raw_id.into()));
            };

            let rest = &block[pos..];
            match prop_id {
                PropertyId::PayloadFormatIndicator => {
                    set_once(&mut props.payload_format_indicator, raw_id)?;
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    props.payload_format_indicator = Some(v);
                    pos += 1;
                }
                PropertyId::MessageExpiryInterval => {
                    set_once(&mut props.message_expiry_interval, raw_id)?;
                    props.message_expiry_interval = Some(read_u32(rest)?);
                    pos += 4;
                }
                PropertyId::ContentType => {
                    set_once(&mut props.content_type, raw_id)?;
                    let (s, len) = read_string(rest)?;
                    props.content_type = Some(s.to_string());
                    pos += len;
                }
                PropertyId::ResponseTopic => {
                    set_once(&mut props.response_topic, raw_id)?;
                    let (s, len) = read_string(rest)?;
                    props.response_topic = Some(s.to_string());
                    pos += len;
                }
                PropertyId::CorrelationData => {
                    set_once(&mut props.correlation_data, raw_id)?;
                    let (data, len) = read_binary(rest)?;
                    props.correlation_data = Some(Bytes::copy_from_slice(data));
                    pos += len;
                }
                PropertyId::SubscriptionIdentifier => {
                    let (val, len) = read_variable_int(rest)?;
                    if val == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "subscription identifier cannot be 0",
                        ));
                    }
                    props.subscription_identifiers.push(val);
                    pos += len;
                }
                PropertyId::TopicAlias => {
                    set_once(&mut props.topic_alias, raw_id)?;
                    let alias = read_u16(rest)?;
                    if alias == 0 {
                        return Err(DecodeError::MalformedPacket("topic alias cannot be 0"));
                    }
                    props.topic_alias = Some(alias);
                    pos += 2;
                }
                PropertyId::UserProperty => {
                    let (k, klen) = read_string(rest)?;
                    let (v, vlen) = read_string(&rest[klen..])?;
                    props.user_properties.push((k.to_string(), v.to_string()));
                    pos += klen + vlen;
                }
            }
        }

        if pos != end {
            return Err(DecodeError::MalformedPacket("property overruns its block"));
        }

        Ok((props, end))
    }

    /// Encode the property block, length prefix included
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(PropertyId::PayloadFormatIndicator as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            buf.put_u8(PropertyId::MessageExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(PropertyId::ContentType as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.response_topic {
            buf.put_u8(PropertyId::ResponseTopic as u8);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(PropertyId::CorrelationData as u8);
            write_binary(buf, d)?;
        }
        for id in &self.subscription_identifiers {
            buf.put_u8(PropertyId::SubscriptionIdentifier as u8);
            write_variable_int(buf, *id)?;
        }
        if let Some(v) = self.topic_alias {
            buf.put_u8(PropertyId::TopicAlias as u8);
            buf.put_u16(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(PropertyId::UserProperty as u8);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }

        Ok(())
    }
}

fn set_once<T>(slot: &mut Option<T>, id: u8) -> Result<(), DecodeError> {
    if slot.is_some() {
        return Err(DecodeError::DuplicateProperty(id));
    }
    Ok(())
}
