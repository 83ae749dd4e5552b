//! MQTT v5.0 Properties
//!
//! Only the properties a publishing/subscribing client sets or reads are
//! kept as fields. Everything else a broker may legally send is parsed for
//! its length and skipped.

use bytes::{BufMut, BytesMut};

use crate::codec::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, write_string,
    write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers (Table 2-4 of MQTT v5.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Wire representation of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PropertyId::*;
        let id = match v {
            0x01 => PayloadFormatIndicator,
            0x02 => MessageExpiryInterval,
            0x03 => ContentType,
            0x08 => ResponseTopic,
            0x09 => CorrelationData,
            0x0B => SubscriptionIdentifier,
            0x11 => SessionExpiryInterval,
            0x12 => AssignedClientIdentifier,
            0x13 => ServerKeepAlive,
            0x15 => AuthenticationMethod,
            0x16 => AuthenticationData,
            0x17 => RequestProblemInformation,
            0x18 => WillDelayInterval,
            0x19 => RequestResponseInformation,
            0x1A => ResponseInformation,
            0x1C => ServerReference,
            0x1F => ReasonString,
            0x21 => ReceiveMaximum,
            0x22 => TopicAliasMaximum,
            0x23 => TopicAlias,
            0x24 => MaximumQoS,
            0x25 => RetainAvailable,
            0x26 => UserProperty,
            0x27 => MaximumPacketSize,
            0x28 => WildcardSubscriptionAvailable,
            0x29 => SubscriptionIdentifierAvailable,
            0x2A => SharedSubscriptionAvailable,
            _ => return None,
        };
        Some(id)
    }

    fn kind(self) -> ValueKind {
        use PropertyId::*;
        match self {
            PayloadFormatIndicator
            | RequestProblemInformation
            | RequestResponseInformation
            | MaximumQoS
            | RetainAvailable
            | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => ValueKind::Byte,
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => {
                ValueKind::TwoByte
            }
            MessageExpiryInterval | SessionExpiryInterval | WillDelayInterval
            | MaximumPacketSize => ValueKind::FourByte,
            SubscriptionIdentifier => ValueKind::VarInt,
            ContentType | ResponseTopic | AssignedClientIdentifier | AuthenticationMethod
            | ResponseInformation | ServerReference | ReasonString => ValueKind::Utf8,
            CorrelationData | AuthenticationData => ValueKind::Binary,
            UserProperty => ValueKind::Utf8Pair,
        }
    }
}

/// Properties carried by client-side packets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub content_type: Option<String>,
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub maximum_packet_size: Option<u32>,
    pub server_keep_alive: Option<u16>,
    pub assigned_client_identifier: Option<String>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties for an outgoing PUBLISH with a content type
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.encoded_size() == 0
    }

    /// Encoded size of the properties, excluding the length prefix
    pub fn encoded_size(&self) -> usize {
        let mut size = 0;
        if let Some(ref s) = self.content_type {
            size += 1 + 2 + s.len();
        }
        if self.session_expiry_interval.is_some() {
            size += 5;
        }
        if self.receive_maximum.is_some() {
            size += 3;
        }
        if self.maximum_qos.is_some() {
            size += 2;
        }
        if self.maximum_packet_size.is_some() {
            size += 5;
        }
        if self.server_keep_alive.is_some() {
            size += 3;
        }
        if let Some(ref s) = self.assigned_client_identifier {
            size += 1 + 2 + s.len();
        }
        if let Some(ref s) = self.reason_string {
            size += 1 + 2 + s.len();
        }
        for (k, v) in &self.user_properties {
            size += 1 + 2 + k.len() + 2 + v.len();
        }
        size
    }

    /// Encode properties with their variable length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(ref s) = self.content_type {
            buf.put_u8(PropertyId::ContentType as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(PropertyId::SessionExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(PropertyId::ReceiveMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(PropertyId::MaximumQoS as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(PropertyId::MaximumPacketSize as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(PropertyId::ServerKeepAlive as u8);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(PropertyId::AssignedClientIdentifier as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(PropertyId::ReasonString as u8);
            write_string(buf, s)?;
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(PropertyId::UserProperty as u8);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }

        Ok(())
    }

    /// Decode a property block (length prefix included).
    /// Returns the properties and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut props = Properties::default();
        let mut pos = len_bytes;

        while pos < end {
            let raw_id = buf[pos];
            pos += 1;
            let id = PropertyId::from_u8(raw_id).ok_or(DecodeError::InvalidPropertyId(raw_id))?;
            let rest = &buf[pos..end];

            pos += match id.kind() {
                ValueKind::Byte => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    if id == PropertyId::MaximumQoS {
                        props.maximum_qos = Some(v);
                    }
                    1
                }
                ValueKind::TwoByte => {
                    let v = read_u16(rest)?;
                    match id {
                        PropertyId::ReceiveMaximum => props.receive_maximum = Some(v),
                        PropertyId::ServerKeepAlive => props.server_keep_alive = Some(v),
                        _ => {}
                    }
                    2
                }
                ValueKind::FourByte => {
                    let v = read_u32(rest)?;
                    match id {
                        PropertyId::SessionExpiryInterval => {
                            props.session_expiry_interval = Some(v)
                        }
                        PropertyId::MaximumPacketSize => props.maximum_packet_size = Some(v),
                        _ => {}
                    }
                    4
                }
                ValueKind::VarInt => read_variable_int(rest)?.1,
                ValueKind::Utf8 => {
                    let (s, n) = read_string(rest)?;
                    match id {
                        PropertyId::ContentType => props.content_type = Some(s.to_string()),
                        PropertyId::ReasonString => props.reason_string = Some(s.to_string()),
                        PropertyId::AssignedClientIdentifier => {
                            props.assigned_client_identifier = Some(s.to_string())
                        }
                        _ => {}
                    }
                    n
                }
                ValueKind::Binary => read_binary(rest)?.1,
                ValueKind::Utf8Pair => {
                    let (k, k_len) = read_string(rest)?;
                    let (v, v_len) = read_string(&rest[k_len..])?;
                    props.user_properties.push((k.to_string(), v.to_string()));
                    k_len + v_len
                }
            };
        }

        if pos != end {
            return Err(DecodeError::MalformedPacket("property length mismatch"));
        }

        Ok((props, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_properties_encode_to_single_zero() {
        let mut buf = BytesMut::new();
        Properties::default().encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00]);
    }

    #[test]
    fn test_content_type_encoding() {
        let props = Properties::with_content_type("json");
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x07, 0x03, 0x00, 0x04, b'j', b's', b'o', b'n']);

        let (decoded, consumed) = Properties::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.content_type.as_deref(), Some("json"));
    }

    #[test]
    fn test_decode_skips_properties_without_fields() {
        // Retain Available (byte), Topic Alias Maximum (u16),
        // Correlation Data (binary), Reason String
        let buf = [
            0x0F, 0x25, 0x01, 0x22, 0x00, 0x0A, 0x09, 0x00, 0x02, 0xAA, 0xBB, 0x1F, 0x00, 0x02,
            b'o', b'k',
        ];
        let (props, consumed) = Properties::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(props.reason_string.as_deref(), Some("ok"));
        assert!(props.content_type.is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_property() {
        let buf = [0x02, 0x7F, 0x00];
        assert_eq!(
            Properties::decode(&buf),
            Err(DecodeError::InvalidPropertyId(0x7F))
        );
    }

    #[test]
    fn test_decode_truncated_block() {
        let buf = [0x05, 0x11, 0x00];
        assert_eq!(Properties::decode(&buf), Err(DecodeError::InsufficientData));
    }
}
