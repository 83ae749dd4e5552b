//! MQTT Packet Decoder
//!
//! Decodes the packets a broker sends to a client.

use bytes::Bytes;

use super::{read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, DecodeError, Disconnect, Incoming, Properties, PubAck, Publish, QoS, ReasonCode,
    SubAck, UnsubAck,
};

/// MQTT v5.0 client packet decoder
#[derive(Debug)]
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of the buffer.
    /// Returns `Ok(None)` until a complete packet is available.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Incoming, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            2 => self.decode_connack(flags, payload)?,
            3 => self.decode_publish(flags, payload)?,
            4 => self.decode_puback(flags, payload)?,
            9 => self.decode_suback(flags, payload)?,
            11 => self.decode_unsuback(flags, payload)?,
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Incoming::PingResp
            }
            14 => self.decode_disconnect(flags, payload)?,
            other => return Err(DecodeError::UnexpectedPacketType(other)),
        };

        Ok(Some((packet, total_len)))
    }

    fn reason_code(byte: u8) -> Result<ReasonCode, DecodeError> {
        ReasonCode::from_u8(byte).ok_or(DecodeError::InvalidReasonCode(byte))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Incoming, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let acknowledge_flags = payload[0];
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let reason_code = Self::reason_code(payload[1])?;
        let properties = if payload.len() > 2 {
            Properties::decode(&payload[2..])?.0
        } else {
            Properties::default()
        };

        Ok(Incoming::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Incoming, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(payload)?;
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        let (properties, len) = Properties::decode(&payload[pos..])?;
        pos += len;

        Ok(Incoming::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
            properties,
        }))
    }

    fn decode_puback(&self, flags: u8, payload: &[u8]) -> Result<Incoming, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(payload)?;

        // Reason code and properties may be omitted on success
        let reason_code = match payload.get(2) {
            Some(byte) => Self::reason_code(*byte)?,
            None => ReasonCode::Success,
        };
        let properties = if payload.len() > 3 {
            Properties::decode(&payload[3..])?.0
        } else {
            Properties::default()
        };

        Ok(Incoming::PubAck(PubAck {
            packet_id,
            reason_code,
            properties,
        }))
    }

    /// SUBACK and UNSUBACK share a layout: id, properties, one reason code per filter
    fn decode_ack_list(
        &self,
        payload: &[u8],
    ) -> Result<(u16, Properties, Vec<ReasonCode>), DecodeError> {
        let packet_id = read_u16(payload)?;
        let (properties, len) = Properties::decode(&payload[2..])?;
        let reason_codes = payload[2 + len..]
            .iter()
            .map(|byte| Self::reason_code(*byte))
            .collect::<Result<Vec<_>, _>>()?;

        if reason_codes.is_empty() {
            return Err(DecodeError::MalformedPacket("acknowledgement without reason codes"));
        }

        Ok((packet_id, properties, reason_codes))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Incoming, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let (packet_id, properties, reason_codes) = self.decode_ack_list(payload)?;
        Ok(Incoming::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsuback(&self, flags: u8, payload: &[u8]) -> Result<Incoming, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let (packet_id, properties, reason_codes) = self.decode_ack_list(payload)?;
        Ok(Incoming::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, flags: u8, payload: &[u8]) -> Result<Incoming, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let reason_code = match payload.first() {
            Some(byte) => Self::reason_code(*byte)?,
            None => ReasonCode::Success,
        };
        let properties = if payload.len() > 1 {
            Properties::decode(&payload[1..])?.0
        } else {
            Properties::default()
        };

        Ok(Incoming::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
