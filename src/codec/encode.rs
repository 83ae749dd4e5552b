//! MQTT Packet Encoder
//!
//! Encodes the packets a client sends to a broker.

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{
    Connect, Disconnect, EncodeError, Outgoing, PubAck, Publish, QoS, ReasonCode, Subscribe,
    Unsubscribe, PROTOCOL_LEVEL_V5,
};

/// Size of a property block including its variable length prefix
fn properties_len(size: usize) -> usize {
    variable_int_len(size as u32) + size
}

/// MQTT v5.0 client packet encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Outgoing, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Outgoing::Connect(p) => self.encode_connect(p, buf),
            Outgoing::Publish(p) => self.encode_publish(p, buf),
            Outgoing::PubAck(p) => self.encode_puback(p, buf),
            Outgoing::Subscribe(p) => self.encode_subscribe(p, buf),
            Outgoing::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Outgoing::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Outgoing::Disconnect(p) => self.encode_disconnect(p, buf),
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Protocol name "MQTT" (2 + 4), level, flags, keep alive
        let mut remaining_length = 6 + 1 + 1 + 2;
        remaining_length += properties_len(packet.properties.encoded_size());
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, "MQTT")?;
        buf.put_u8(PROTOCOL_LEVEL_V5);

        let mut connect_flags: u8 = 0;
        if packet.clean_start {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        packet.properties.encode(buf)?;
        write_string(buf, &packet.client_id)?;

        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len();
        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }
        remaining_length += properties_len(packet.properties.encoded_size());
        remaining_length += packet.payload.len();

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
        if packet.qos != QoS::AtMostOnce {
            // A missing id on QoS > 0 is a caller bug; 0 makes the broker reject it
            buf.put_u16(packet.packet_id.unwrap_or(0));
        }
        packet.properties.encode(buf)?;
        buf.put_slice(&packet.payload);

        Ok(())
    }

    fn encode_puback(&self, packet: &PubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x40);
        if packet.reason_code == ReasonCode::Success && packet.properties.is_empty() {
            buf.put_u8(0x02);
            buf.put_u16(packet.packet_id);
            return Ok(());
        }

        let remaining_length = 2 + 1 + properties_len(packet.properties.encoded_size());
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        buf.put_u8(packet.reason_code as u8);
        packet.properties.encode(buf)
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + properties_len(packet.properties.encoded_size());
        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1;
        }

        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        packet.properties.encode(buf)?;

        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.options.to_byte());
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + properties_len(packet.properties.encoded_size());
        for filter in &packet.filters {
            remaining_length += 2 + filter.len();
        }

        buf.put_u8(0xA2);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        packet.properties.encode(buf)?;

        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }

    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(0xE0);
        if packet.reason_code == ReasonCode::Success && packet.properties.is_empty() {
            buf.put_u8(0x00);
            return Ok(());
        }

        let remaining_length = 1 + properties_len(packet.properties.encoded_size());
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u8(packet.reason_code as u8);
        packet.properties.encode(buf)
    }
}
