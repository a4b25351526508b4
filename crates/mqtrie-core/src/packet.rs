//! MQTT packet types and codec for the MQTT 3.1.1 subset the broker speaks.
//!
//! Both decode and encode cover the broker-side and the client-side of each
//! flow, since the crate is shared by the server and its test clients.

use std::io::{self, Read};

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Subscribe = 8,
    Suback = 9,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {}",
                value
            ))),
        }
    }
}

/// CONNACK return codes (MQTT 3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

/// SUBACK return code for a rejected subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// MQTT packets.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    /// Packet type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::Connack(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::Puback { .. } => "PUBACK",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::Suback(_) => "SUBACK",
            Packet::Pingreq => "PINGREQ",
            Packet::Pingresp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message configuration. Parsed for wire correctness; the broker does
/// not deliver wills.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with their requested QoS.
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// Decoder over a complete packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain null character U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(bytes.to_vec())
    }
}

/// Try to decode a complete packet from the buffer.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` if successful, `Ok(None)` if
/// more data is needed, or `Err` on protocol errors.
/// `max_packet_size`: maximum allowed total packet size (0 = no limit).
pub fn decode_packet(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        }
        .into());
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    let payload = &buf[header_len..total_len];

    // MQTT-3.8.1-1: SUBSCRIBE fixed header flags MUST be 0010
    if packet_type == PacketType::Subscribe && flags != 0x02 {
        return Err(ProtocolError::MalformedPacket(format!(
            "SUBSCRIBE fixed header flags must be 0x02, got {:#04x}",
            flags
        ))
        .into());
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(payload)?,
        PacketType::Connack => decode_connack(payload)?,
        PacketType::Publish => decode_publish(flags, payload)?,
        PacketType::Puback => decode_puback(payload)?,
        PacketType::Subscribe => decode_subscribe(payload)?,
        PacketType::Suback => decode_suback(payload)?,
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);

    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name).into());
    }

    // 4 = MQTT 3.1.1, 3 = MQTT 3.1
    let protocol_version = dec.read_u8()?;
    if protocol_version != 4 && protocol_version != 3 {
        return Err(ProtocolError::UnsupportedProtocolVersion(protocol_version).into());
    }

    let flags = dec.read_u8()?;
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // Reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    // MQTT-3.1.2-11/13: If Will Flag is 0, Will QoS MUST be 0
    if !will_flag && will_qos != QoS::AtMostOnce {
        return Err(
            ProtocolError::MalformedPacket("Will QoS must be 0 when Will Flag is 0".into()).into(),
        );
    }

    // MQTT-3.1.2-15: If Will Flag is 0, Will Retain MUST be 0
    if !will_flag && will_retain {
        return Err(ProtocolError::MalformedPacket(
            "Will Retain must be 0 when Will Flag is 0".into(),
        )
        .into());
    }

    // MQTT-3.1.2-22: If Username Flag is 0, Password Flag MUST be 0
    if !username_flag && password_flag {
        return Err(ProtocolError::MalformedPacket(
            "Password Flag must be 0 when Username Flag is 0".into(),
        )
        .into());
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let message = dec.read_binary()?;
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_version,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let ack_flags = dec.read_u8()?;
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    Ok(Packet::Connack(Connack {
        session_present: (ack_flags & 0x01) != 0,
        code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(payload);

    let topic = dec.read_string()?;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = dec.read_u16()?;
        // MQTT-2.3.1-1: packet id must be non-zero when required
        if id == 0 {
            return Err(
                ProtocolError::MalformedPacket("PUBLISH packet id must be non-zero".into()).into(),
            );
        }
        Some(id)
    } else {
        None
    };

    let payload_data = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(payload_data),
    }))
}

fn decode_puback(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;
    Ok(Packet::Puback { packet_id })
}

fn decode_subscribe(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;

        // MQTT-4.7.0-1: Topic Filter must be at least 1 character
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }

        let qos = QoS::try_from(dec.read_u8()? & 0x03)?;
        topics.push((topic, qos));
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;
    let return_codes = dec.read_bytes(dec.remaining())?.to_vec();
    if return_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBACK with no return codes".into()).into());
    }
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

/// Read one complete packet from a blocking reader.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. An EOF in the
/// middle of a frame surfaces as an `UnexpectedEof` I/O error.
pub fn read_packet<R: Read>(reader: &mut R, max_packet_size: usize) -> Result<Option<Packet>> {
    // Fixed header byte; a zero-byte read here is a clean close.
    let mut first = [0u8; 1];
    loop {
        match reader.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    // Remaining length, one continuation byte at a time (at most 4).
    let mut header = Vec::with_capacity(5);
    header.push(first[0]);
    let remaining_len = loop {
        let mut b = [0u8; 1];
        reader.read_exact(&mut b)?;
        header.push(b[0]);
        if let Some((len, _)) = varint::decode(&header[1..])? {
            break len;
        }
        if header.len() > 5 {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }
    };

    let total_len = header.len() + remaining_len;
    if max_packet_size > 0 && total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        }
        .into());
    }

    header.resize(total_len, 0);
    reader.read_exact(&mut header[total_len - remaining_len..])?;

    match decode_packet(&header, max_packet_size)? {
        Some((packet, consumed)) => {
            debug_assert_eq!(consumed, total_len);
            Ok(Some(packet))
        }
        // The buffer holds the whole frame, so this cannot be hit.
        None => Err(ProtocolError::MalformedPacket("truncated packet".into()).into()),
    }
}

/// Encode a packet into the provided buffer.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => encode_connack(connack, buf),
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => encode_puback(*packet_id, buf),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => encode_suback(suback, buf),
        Packet::Pingreq => encode_empty(PacketType::Pingreq, buf),
        Packet::Pingresp => encode_empty(PacketType::Pingresp, buf),
        Packet::Disconnect => encode_empty(PacketType::Disconnect, buf),
    }
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) {
    buf.push((PacketType::Connack as u8) << 4);
    buf.push(2); // Remaining length
    buf.push(if connack.session_present { 1 } else { 0 });
    buf.push(connack.code as u8);
}

/// Encode a PUBLISH packet.
pub fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let topic_len = 2 + publish.topic.len();
    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = topic_len + packet_id_len + publish.payload.len();
    varint::encode(remaining, buf);

    buf.extend_from_slice(&(publish.topic.len() as u16).to_be_bytes());
    buf.extend_from_slice(publish.topic.as_bytes());

    if publish.qos != QoS::AtMostOnce {
        buf.extend_from_slice(&publish.packet_id.unwrap_or(0).to_be_bytes());
    }

    buf.extend_from_slice(&publish.payload);
}

fn encode_puback(packet_id: u16, buf: &mut Vec<u8>) {
    buf.push((PacketType::Puback as u8) << 4);
    buf.push(2); // Remaining length
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) {
    buf.push((PacketType::Suback as u8) << 4);
    varint::encode(2 + suback.return_codes.len(), buf);
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    buf.extend_from_slice(&suback.return_codes);
}

fn encode_empty(packet_type: PacketType, buf: &mut Vec<u8>) {
    buf.push((packet_type as u8) << 4);
    buf.push(0); // Remaining length
}

/// Encode a CONNECT packet (client side).
pub fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();

    let protocol_name = connect.protocol_name.as_bytes();
    payload.extend_from_slice(&(protocol_name.len() as u16).to_be_bytes());
    payload.extend_from_slice(protocol_name);

    payload.push(connect.protocol_version);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    payload.push(flags);

    payload.extend_from_slice(&connect.keep_alive.to_be_bytes());

    let client_id = connect.client_id.as_bytes();
    payload.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
    payload.extend_from_slice(client_id);

    if let Some(ref will) = connect.will {
        let topic = will.topic.as_bytes();
        payload.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        payload.extend_from_slice(topic);
        payload.extend_from_slice(&(will.message.len() as u16).to_be_bytes());
        payload.extend_from_slice(&will.message);
    }

    if let Some(ref username) = connect.username {
        let username = username.as_bytes();
        payload.extend_from_slice(&(username.len() as u16).to_be_bytes());
        payload.extend_from_slice(username);
    }

    if let Some(ref password) = connect.password {
        payload.extend_from_slice(&(password.len() as u16).to_be_bytes());
        payload.extend_from_slice(password);
    }

    buf.push((PacketType::Connect as u8) << 4);
    varint::encode(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

/// Encode a SUBSCRIBE packet (client side).
pub fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();

    payload.extend_from_slice(&subscribe.packet_id.to_be_bytes());

    for (topic, qos) in &subscribe.topics {
        let topic_bytes = topic.as_bytes();
        payload.extend_from_slice(&(topic_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(topic_bytes);
        payload.push(*qos as u8);
    }

    // MQTT-3.8.1-1: SUBSCRIBE fixed header flags are 0010
    buf.push(((PacketType::Subscribe as u8) << 4) | 0x02);
    varint::encode(payload.len(), buf);
    buf.extend_from_slice(&payload);
}
