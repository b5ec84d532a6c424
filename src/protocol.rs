// ===========================================
// Imports
// ===========================================
use byteorder::{BigEndian, ReadBytesExt};
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use std::io::{self, Cursor, Read};
use tokio::io::{AsyncRead, AsyncReadExt};

// ===========================================
// Packet Ids & Limits
// ===========================================
pub const HANDSHAKE_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_REQUEST_ID: i32 = 0x01;
pub const PONG_ID: i32 = 0x01;
pub const LOGIN_START_ID: i32 = 0x00;
pub const LOGIN_DISCONNECT_ID: i32 = 0x00;
pub const LOGIN_SUCCESS_ID: i32 = 0x02;
// Play-state disconnect id for 1.20/1.20.1; later versions shifted ids.
pub const PLAY_DISCONNECT_ID: i32 = 0x1A;

/// Protocol ceiling for a single frame body.
pub const MAX_PACKET_LEN: i32 = (1 << 21) - 1;

const MAX_STRING_LEN: i32 = 255;

// ===========================================
// Section 1: VarInt Codec
// ===========================================

/// Reads a little-endian base-128 VarInt, at most 5 bytes.
pub fn read_varint<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut num_read = 0;
    let mut result: i32 = 0;
    loop {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf)?;
        let byte = buf[0];
        result |= ((byte & 0x7F) as i32) << (7 * num_read);
        num_read += 1;
        if num_read > 5 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "VarInt too long",
            ));
        }
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(result)
}

pub async fn read_varint_async<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<i32> {
    let mut num_read = 0;
    let mut result: i32 = 0;
    loop {
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;
        let byte = buf[0];
        result |= ((byte & 0x7F) as i32) << (7 * num_read);
        num_read += 1;
        if num_read > 5 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "VarInt too long",
            ));
        }
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(result)
}

pub fn encode_varint(value: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    write_varint(value, &mut buf);
    buf
}

fn write_varint(value: i32, buf: &mut Vec<u8>) {
    let mut value = value as u32;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_string(s: &str, buf: &mut Vec<u8>) {
    write_varint(s.len() as i32, buf);
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = read_varint(cursor)?;
    if !(0..=MAX_STRING_LEN).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid string length: {}", len),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    Read::read_exact(cursor, &mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ===========================================
// Section 2: Packet Framer
// ===========================================

/// Reads one length-prefixed packet body from the stream.
pub async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    let length = read_varint_async(stream).await?;
    if length <= 0 || length > MAX_PACKET_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid packet length: {}", length),
        ));
    }

    let mut packet = vec![0u8; length as usize];
    stream.read_exact(&mut packet).await?;
    Ok(packet)
}

/// Splits a packet body into its leading packet-id VarInt and the payload.
pub fn split_packet_id(packet: &[u8]) -> io::Result<(i32, &[u8])> {
    let mut cursor = Cursor::new(packet);
    let id = read_varint(&mut cursor)?;
    let consumed = cursor.position() as usize;
    Ok((id, &packet[consumed..]))
}

/// Re-attaches the length prefix to a packet body, for forwarding a frame
/// exactly as it arrived.
pub fn wrap_packet(body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(body.len() + 5);
    write_varint(body.len() as i32, &mut packet);
    packet.extend_from_slice(body);
    packet
}

fn finish_packet(payload: Vec<u8>) -> Vec<u8> {
    wrap_packet(&payload)
}

// ===========================================
// Section 3: Handshake / Login Start Parsers
// ===========================================

/// Decodes a Handshake body and returns the requested next state
/// (1 = status, 2 = login).
pub fn read_handshake_next_state(packet: &[u8]) -> io::Result<i32> {
    let mut cursor = Cursor::new(packet);
    let packet_id = read_varint(&mut cursor)?;
    if packet_id != HANDSHAKE_ID {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected handshake packet id: {}", packet_id),
        ));
    }
    let _protocol_version = read_varint(&mut cursor)?;
    let _server_address = read_string(&mut cursor)?;
    let _server_port = ReadBytesExt::read_u16::<BigEndian>(&mut cursor)?;
    let next_state = read_varint(&mut cursor)?;
    Ok(next_state)
}

/// Decodes a Login Start body and returns the username. Fields after the
/// username differ across protocol versions and are ignored.
pub fn read_login_start_username(packet: &[u8]) -> io::Result<String> {
    let mut cursor = Cursor::new(packet);
    let packet_id = read_varint(&mut cursor)?;
    if packet_id != LOGIN_START_ID {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected login start packet id: {}", packet_id),
        ));
    }
    let username = read_string(&mut cursor)?;
    if username.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid username length",
        ));
    }
    Ok(username)
}

// ===========================================
// Section 4: Status / Ping Builders
// ===========================================

#[derive(Serialize)]
struct StatusResponse {
    version: StatusVersion,
    players: StatusPlayers,
    description: StatusDescription,
}

#[derive(Serialize)]
struct StatusVersion {
    name: String,
    protocol: i32,
}

#[derive(Serialize)]
struct StatusPlayers {
    max: i32,
    online: i32,
}

#[derive(Serialize)]
struct StatusDescription {
    text: String,
}

pub fn build_status_response(
    version_name: &str,
    protocol: i32,
    motd: &str,
    max_players: i32,
    online_players: i32,
) -> io::Result<Vec<u8>> {
    let status = StatusResponse {
        version: StatusVersion {
            name: version_name.to_string(),
            protocol,
        },
        players: StatusPlayers {
            max: max_players,
            online: online_players,
        },
        description: StatusDescription {
            text: motd.to_string(),
        },
    };
    let response =
        serde_json::to_vec(&status).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut payload = Vec::with_capacity(response.len() + 6);
    write_varint(STATUS_RESPONSE_ID, &mut payload);
    write_varint(response.len() as i32, &mut payload);
    payload.extend_from_slice(&response);
    Ok(finish_packet(payload))
}

pub fn build_pong(ping_payload: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ping_payload.len() + 1);
    write_varint(PONG_ID, &mut payload);
    payload.extend_from_slice(ping_payload);
    finish_packet(payload)
}

// ===========================================
// Section 5: Login / Play Builders
// ===========================================

/// Builds the JSON chat component for a disconnect reason.
///
/// A non-empty title produces the `disconnect.genericReason` translate
/// component so vanilla clients show the title above the body. Otherwise a
/// message that is already valid JSON is passed through verbatim, and plain
/// text is wrapped as `{"text": ...}`.
fn disconnect_reason(title: &str, message: &str) -> io::Result<Vec<u8>> {
    if !title.trim().is_empty() {
        let component = json!({
            "translate": "disconnect.genericReason",
            "with": [title, message],
        });
        return serde_json::to_vec(&component)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
    }

    let trimmed = message.trim();
    if !trimmed.is_empty() && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Ok(trimmed.as_bytes().to_vec());
    }

    serde_json::to_vec(&json!({ "text": message }))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn build_disconnect(packet_id: i32, title: &str, message: &str) -> io::Result<Vec<u8>> {
    let reason = disconnect_reason(title, message)?;

    let mut payload = Vec::with_capacity(reason.len() + 6);
    write_varint(packet_id, &mut payload);
    write_varint(reason.len() as i32, &mut payload);
    payload.extend_from_slice(&reason);
    Ok(finish_packet(payload))
}

pub fn build_login_disconnect(title: &str, message: &str) -> io::Result<Vec<u8>> {
    build_disconnect(LOGIN_DISCONNECT_ID, title, message)
}

pub fn build_play_disconnect(title: &str, message: &str) -> io::Result<Vec<u8>> {
    build_disconnect(PLAY_DISCONNECT_ID, title, message)
}

/// Builds a Login Success frame with a random UUID and no properties.
pub fn build_login_success(username: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(username.len() + 22);
    write_varint(LOGIN_SUCCESS_ID, &mut payload);

    let mut uuid = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut uuid);
    payload.extend_from_slice(&uuid);

    write_string(username, &mut payload);
    write_varint(0, &mut payload); // properties count
    finish_packet(payload)
}
