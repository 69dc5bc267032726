//! MQTT 3.1.1 wire framing.
//!
//! No MQTT client crate is used here — probing a broker's liveness and
//! `$SYS` tree only needs a handful of fixed-shape packets, framed by hand
//! with raw buffers rather than pulling in a full client.

use std::io;

pub const MQTT_LEVEL_3_1_1: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    Subscribe,
    SubAck,
    UnsubAck,
    PingResp,
    Disconnect,
    Other(u8),
}

impl From<u8> for PacketType {
    fn from(byte: u8) -> Self {
        match byte >> 4 {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            11 => PacketType::UnsubAck,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            other => PacketType::Other(other),
        }
    }
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn encode_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Builds a `CONNECT` packet with clean-session set, no credentials, no will.
/// This never attempts to authenticate against the broker.
pub fn encode_connect(client_id: &str, keepalive_secs: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    encode_string("MQTT", &mut payload);
    payload.push(MQTT_LEVEL_3_1_1);
    payload.push(0x02); // connect flags: clean session
    payload.extend_from_slice(&keepalive_secs.to_be_bytes());
    encode_string(client_id, &mut payload);

    let mut packet = vec![0x10];
    encode_remaining_length(payload.len(), &mut packet);
    packet.extend_from_slice(&payload);
    packet
}

pub fn encode_subscribe(packet_id: u16, topic_filter: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&packet_id.to_be_bytes());
    encode_string(topic_filter, &mut payload);
    payload.push(0x00); // QoS 0

    let mut packet = vec![0x82];
    encode_remaining_length(payload.len(), &mut packet);
    packet.extend_from_slice(&payload);
    packet
}

pub fn encode_unsubscribe(packet_id: u16, topic_filter: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&packet_id.to_be_bytes());
    encode_string(topic_filter, &mut payload);

    let mut packet = vec![0xa2];
    encode_remaining_length(payload.len(), &mut packet);
    packet.extend_from_slice(&payload);
    packet
}

/// QoS 0 publish with an empty payload, used only for the anonymous-publish
/// liveness probe. No payload content is ever sent or captured.
pub fn encode_publish_empty(topic: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    encode_string(topic, &mut payload);

    let mut packet = vec![0x30]; // QoS 0, no DUP/RETAIN
    encode_remaining_length(payload.len(), &mut packet);
    packet.extend_from_slice(&payload);
    packet
}

pub fn encode_disconnect() -> Vec<u8> {
    vec![0xe0, 0x00]
}

#[derive(Debug)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

impl ConnAck {
    pub fn accepted(&self) -> bool {
        self.return_code == 0
    }
}

#[derive(Debug)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum Packet {
    ConnAck(ConnAck),
    Publish(Publish),
    SubAck,
    PingResp,
    Other(PacketType),
}

/// Reads one MQTT control packet header + remaining-length prefix from
/// `buf`, returning the decoded packet and number of bytes consumed, or
/// `None` if `buf` doesn't yet contain a full packet.
pub fn decode_packet(buf: &[u8]) -> io::Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let first = buf[0];
    let mut multiplier = 1usize;
    let mut remaining_length = 0usize;
    let mut idx = 1;
    loop {
        if idx >= buf.len() {
            return Ok(None);
        }
        let byte = buf[idx];
        remaining_length += (byte & 0x7f) as usize * multiplier;
        idx += 1;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
        if multiplier > 128 * 128 * 128 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed remaining length"));
        }
    }
    let header_len = idx;
    if buf.len() < header_len + remaining_length {
        return Ok(None);
    }
    let body = &buf[header_len..header_len + remaining_length];
    let total = header_len + remaining_length;

    let packet = match PacketType::from(first) {
        PacketType::ConnAck if body.len() >= 2 => Packet::ConnAck(ConnAck {
            session_present: body[0] & 0x01 != 0,
            return_code: body[1],
        }),
        PacketType::Publish => {
            if body.len() < 2 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated PUBLISH"));
            }
            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            if body.len() < 2 + topic_len {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated PUBLISH topic"));
            }
            let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
            // QoS 0 only (no packet identifier); higher QoS is never requested.
            let payload = body[2 + topic_len..].to_vec();
            Packet::Publish(Publish { topic, payload })
        }
        PacketType::SubAck => Packet::SubAck,
        PacketType::PingResp => Packet::PingResp,
        other => Packet::Other(other),
    };
    Ok(Some((packet, total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_packet_has_clean_session_flag() {
        let packet = encode_connect("probe-abc", 30);
        assert_eq!(packet[0], 0x10);
        let protocol_name_len_offset = 2;
        assert_eq!(
            &packet[protocol_name_len_offset..protocol_name_len_offset + 6],
            b"\x00\x04MQTT"
        );
        let flags_offset = protocol_name_len_offset + 6 + 1;
        assert_eq!(packet[flags_offset], 0x02);
    }

    #[test]
    fn remaining_length_multi_byte() {
        let mut out = Vec::new();
        encode_remaining_length(321, &mut out);
        assert_eq!(out, vec![0xc1, 0x02]);
    }

    #[test]
    fn decode_connack_accepted() {
        let buf = [0x20, 0x02, 0x00, 0x00];
        let (packet, consumed) = decode_packet(&buf).unwrap().unwrap();
        assert_eq!(consumed, 4);
        match packet {
            Packet::ConnAck(ack) => assert!(ack.accepted()),
            _ => panic!("expected ConnAck"),
        }
    }

    #[test]
    fn decode_connack_refused() {
        let buf = [0x20, 0x02, 0x00, 0x05];
        let (packet, _) = decode_packet(&buf).unwrap().unwrap();
        match packet {
            Packet::ConnAck(ack) => assert!(!ack.accepted()),
            _ => panic!("expected ConnAck"),
        }
    }

    #[test]
    fn decode_publish_roundtrip() {
        let mut body = Vec::new();
        encode_string("$SYS/broker/version", &mut body);
        body.extend_from_slice(b"mosquitto 2.0.18");

        let mut buf = vec![0x30];
        encode_remaining_length(body.len(), &mut buf);
        buf.extend_from_slice(&body);

        let (packet, consumed) = decode_packet(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        match packet {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "$SYS/broker/version");
                assert_eq!(p.payload, b"mosquitto 2.0.18");
            }
            _ => panic!("expected Publish"),
        }
    }

    #[test]
    fn decode_incomplete_buffer_returns_none() {
        let buf = [0x20, 0x02, 0x00];
        assert!(decode_packet(&buf).unwrap().is_none());
    }
}
