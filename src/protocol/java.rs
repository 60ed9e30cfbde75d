//! Java edition server list ping over TCP.

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;

use crate::error::{AppError, Result};

use super::ServerStatus;

const MAX_PACKET_LEN: usize = 1 << 21;

pub(crate) const STATE_STATUS: i32 = 1;
pub(crate) const STATE_LOGIN: i32 = 2;

const PACKET_HANDSHAKE: i32 = 0x00;
const PACKET_STATUS: i32 = 0x00;
const PACKET_PING: i32 = 0x01;
const PACKET_LOGIN_DISCONNECT: i32 = 0x00;

/// First byte of the pre-netty "legacy" ping.
const LEGACY_PING: u8 = 0xFE;
/// Legacy clients read the status out of a kick packet.
const LEGACY_KICK: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusJson {
    version: VersionJson,
    players: PlayersJson,
    #[serde(default)]
    description: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionJson {
    name: String,
    protocol: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlayersJson {
    max: u32,
    online: u32,
}

pub(crate) fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut remaining = value as u32;
    loop {
        if remaining & !0x7F == 0 {
            buf.push(remaining as u8);
            return;
        }
        buf.push((remaining & 0x7F) as u8 | 0x80);
        remaining >>= 7;
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

pub(crate) async fn read_varint<R>(reader: &mut R) -> io::Result<i32>
where
    R: AsyncRead + Unpin,
{
    let mut value: u32 = 0;
    for shift in 0..5 {
        let byte = reader.read_u8().await?;
        value |= u32::from(byte & 0x7F) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(invalid("varint is longer than 5 bytes"))
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Cursor over a packet body.
struct Body<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> io::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| invalid("packet body truncated"))?;
        let buf = self.buf;
        self.pos = end;
        Ok(&buf[end - len..end])
    }

    fn varint(&mut self) -> io::Result<i32> {
        let mut value: u32 = 0;
        for shift in 0..5 {
            let byte = self.take(1)?[0];
            value |= u32::from(byte & 0x7F) << (7 * shift);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(invalid("varint is longer than 5 bytes"))
    }

    fn string(&mut self) -> io::Result<String> {
        let len = usize::try_from(self.varint()?).map_err(|_| invalid("negative string length"))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| invalid("string is not valid UTF-8"))
    }

    fn u16(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn i64(&mut self) -> io::Result<i64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }
}

/// Frame a packet: length prefix, packet id, body.
pub(crate) fn encode_packet(id: i32, body: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(body.len() + 5);
    write_varint(&mut inner, id);
    inner.extend_from_slice(body);
    let mut framed = Vec::with_capacity(inner.len() + 5);
    write_varint(&mut framed, inner.len() as i32);
    framed.extend_from_slice(&inner);
    framed
}

/// Read one framed packet, returning its id and body.
pub(crate) async fn read_packet<R>(reader: &mut R) -> io::Result<(i32, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint(reader).await?;
    let len = usize::try_from(len).map_err(|_| invalid("negative packet length"))?;
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(invalid("packet length out of range"));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let mut body = Body::new(&payload);
    let id = body.varint()?;
    Ok((id, payload[body.pos..].to_vec()))
}

pub(crate) fn encode_handshake(handshake: &Handshake) -> Vec<u8> {
    let mut body = Vec::new();
    write_varint(&mut body, handshake.protocol_version);
    write_string(&mut body, &handshake.server_address);
    body.extend_from_slice(&handshake.server_port.to_be_bytes());
    write_varint(&mut body, handshake.next_state);
    encode_packet(PACKET_HANDSHAKE, &body)
}

pub(crate) fn decode_handshake(body: &[u8]) -> io::Result<Handshake> {
    let mut body = Body::new(body);
    Ok(Handshake {
        protocol_version: body.varint()?,
        server_address: body.string()?,
        server_port: body.u16()?,
        next_state: body.varint()?,
    })
}

fn status_json(status: &ServerStatus) -> Result<String> {
    let json = StatusJson {
        version: VersionJson {
            name: status.version_name.clone(),
            protocol: status.protocol_version,
        },
        players: PlayersJson {
            max: status.players_max,
            online: status.players_online,
        },
        description: serde_json::json!({ "text": status.motd }),
    };
    Ok(serde_json::to_string(&json)?)
}

/// Flatten a chat component (plain string or `{text, extra}` object) to text.
fn chat_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Object(map) => {
            let mut text = map
                .get("text")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(serde_json::Value::Array(extra)) = map.get("extra") {
                for part in extra {
                    text.push_str(&chat_text(part));
                }
            }
            text
        }
        serde_json::Value::Array(parts) => parts.iter().map(chat_text).collect(),
        _ => String::new(),
    }
}

fn parse_status_json(raw: &str) -> Result<ServerStatus> {
    let json: StatusJson = serde_json::from_str(raw)?;
    Ok(ServerStatus {
        version_name: json.version.name,
        protocol_version: json.version.protocol,
        players_online: json.players.online,
        players_max: json.players.max,
        motd: chat_text(&json.description),
    })
}

/// Run the status handshake against `addr`.
pub(crate) async fn query_status(addr: SocketAddr) -> Result<ServerStatus> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| AppError::io(format!("status probe connect to {addr} failed: {e}")))?;
    request_status(&mut stream, addr).await
}

/// Run the status handshake on an already connected stream.
pub(crate) async fn request_status<S>(stream: &mut S, addr: SocketAddr) -> Result<ServerStatus>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake {
        protocol_version: -1,
        server_address: addr.ip().to_string(),
        server_port: addr.port(),
        next_state: STATE_STATUS,
    };
    stream.write_all(&encode_handshake(&handshake)).await?;
    stream.write_all(&encode_packet(PACKET_STATUS, &[])).await?;

    let (id, body) = read_packet(stream).await?;
    if id != PACKET_STATUS {
        return Err(AppError::io(format!(
            "unexpected status packet id {id:#04x}"
        )));
    }
    let raw = Body::new(&body).string()?;
    parse_status_json(&raw)
}

/// Kick packet answering a legacy ping: UTF-16BE fields behind a `§1` marker.
fn legacy_status_reply(status: &ServerStatus) -> io::Result<Vec<u8>> {
    let fields = format!(
        "\u{a7}1\0{}\0{}\0{}\0{}\0{}",
        status.protocol_version,
        status.version_name,
        status.motd,
        status.players_online,
        status.players_max
    );
    let units: Vec<u16> = fields.encode_utf16().collect();
    let len = u16::try_from(units.len()).map_err(|_| invalid("legacy status too long"))?;
    let mut reply = Vec::with_capacity(3 + units.len() * 2);
    reply.push(LEGACY_KICK);
    reply.extend_from_slice(&len.to_be_bytes());
    for unit in units {
        reply.extend_from_slice(&unit.to_be_bytes());
    }
    Ok(reply)
}

/// What a client came for on a connection answered by [`serve_placeholder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientIntent {
    Status,
    Login,
    Unknown,
}

/// Answer one client connection on behalf of a sleeping server.
///
/// Status requests get `status` (echoing the client's protocol version so
/// the entry renders normally), legacy pings get it as a kick packet and
/// login attempts are disconnected with `kick_message`.
pub(crate) async fn serve_placeholder<S>(
    stream: &mut S,
    status: &ServerStatus,
    kick_message: &str,
) -> Result<ClientIntent>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = stream.read_u8().await?;
    if first == LEGACY_PING {
        stream.write_all(&legacy_status_reply(status)?).await?;
        stream.flush().await?;
        return Ok(ClientIntent::Status);
    }

    // Re-assemble the length prefix whose first byte was already consumed.
    let len = if first & 0x80 == 0 {
        i32::from(first)
    } else {
        let rest = read_varint(stream).await?;
        i32::from(first & 0x7F) | (rest << 7)
    };
    let len = usize::try_from(len).map_err(|_| invalid("negative packet length"))?;
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(invalid("packet length out of range").into());
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let mut body = Body::new(&payload);
    if body.varint()? != PACKET_HANDSHAKE {
        return Ok(ClientIntent::Unknown);
    }
    let handshake = decode_handshake(&payload[body.pos..])?;

    match handshake.next_state {
        STATE_STATUS => {
            let (id, _) = read_packet(stream).await?;
            if id != PACKET_STATUS {
                return Ok(ClientIntent::Status);
            }
            let mut reply = status.clone();
            if reply.protocol_version < 0 {
                reply.protocol_version = handshake.protocol_version;
            }
            let mut body = Vec::new();
            write_string(&mut body, &status_json(&reply)?);
            stream.write_all(&encode_packet(PACKET_STATUS, &body)).await?;

            // Clients follow up with a ping; echo it back if it comes.
            if let Ok((PACKET_PING, ping)) = read_packet(stream).await {
                let payload = Body::new(&ping).i64()?;
                stream
                    .write_all(&encode_packet(PACKET_PING, &payload.to_be_bytes()))
                    .await?;
            }
            stream.flush().await?;
            Ok(ClientIntent::Status)
        }
        STATE_LOGIN => {
            let reason = serde_json::json!({ "text": kick_message }).to_string();
            let mut body = Vec::new();
            write_string(&mut body, &reason);
            stream
                .write_all(&encode_packet(PACKET_LOGIN_DISCONNECT, &body))
                .await?;
            stream.flush().await?;
            Ok(ClientIntent::Login)
        }
        _ => Ok(ClientIntent::Unknown),
    }
}
