//! Bedrock edition status via RakNet unconnected ping/pong over UDP.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::error::{AppError, Result};

use super::ServerStatus;

const UNCONNECTED_PING: u8 = 0x01;
const UNCONNECTED_PING_OPEN: u8 = 0x02;
const UNCONNECTED_PONG: u8 = 0x1C;

/// Offline message marker present in every unconnected RakNet packet.
const MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00, 0xFE, 0xFE, 0xFE, 0xFE, 0xFD, 0xFD, 0xFD, 0xFD, 0x12, 0x34, 0x56, 0x78,
];

const PING_LEN: usize = 1 + 8 + 16 + 8;

pub(crate) fn encode_ping(timestamp: i64, client_guid: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PING_LEN);
    buf.push(UNCONNECTED_PING);
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&client_guid.to_be_bytes());
    buf
}

/// Timestamp of an unconnected ping, or `None` if `datagram` is not one.
pub(crate) fn decode_ping(datagram: &[u8]) -> Option<i64> {
    if datagram.len() < PING_LEN {
        return None;
    }
    if datagram[0] != UNCONNECTED_PING && datagram[0] != UNCONNECTED_PING_OPEN {
        return None;
    }
    if datagram[9..25] != MAGIC {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&datagram[1..9]);
    Some(i64::from_be_bytes(raw))
}

fn motd_line(status: &ServerStatus, server_guid: i64, port: u16) -> String {
    // Semicolons delimit fields; keep them out of free text.
    let motd = status.motd.replace(';', ",");
    let version = status.version_name.replace(';', ",");
    format!(
        "MCPE;{motd};{};{version};{};{};{server_guid};{motd};Survival;1;{port};{port};",
        status.protocol_version.max(0),
        status.players_online,
        status.players_max,
    )
}

pub(crate) fn encode_pong(timestamp: i64, server_guid: i64, status: &ServerStatus, port: u16) -> Vec<u8> {
    let line = motd_line(status, server_guid, port);
    let len = u16::try_from(line.len()).unwrap_or(u16::MAX);
    let mut buf = Vec::with_capacity(1 + 8 + 8 + 16 + 2 + line.len());
    buf.push(UNCONNECTED_PONG);
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&server_guid.to_be_bytes());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&line.as_bytes()[..usize::from(len)]);
    buf
}

pub(crate) fn decode_pong(datagram: &[u8]) -> Option<ServerStatus> {
    const HEADER: usize = 1 + 8 + 8 + 16;
    if datagram.len() < HEADER + 2 || datagram[0] != UNCONNECTED_PONG {
        return None;
    }
    if datagram[17..33] != MAGIC {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([datagram[HEADER], datagram[HEADER + 1]]));
    let line = datagram.get(HEADER + 2..HEADER + 2 + len)?;
    let line = std::str::from_utf8(line).ok()?;

    let fields: Vec<&str> = line.split(';').collect();
    if fields.len() < 6 {
        return None;
    }
    Some(ServerStatus {
        motd: fields[1].to_string(),
        protocol_version: fields[2].parse().unwrap_or(-1),
        version_name: fields[3].to_string(),
        players_online: fields[4].parse().ok()?,
        players_max: fields[5].parse().ok()?,
    })
}

/// Answer one datagram on behalf of a sleeping server; `None` if it is not a ping.
pub(crate) fn answer_datagram(
    datagram: &[u8],
    status: &ServerStatus,
    server_guid: i64,
    port: u16,
) -> Option<Vec<u8>> {
    decode_ping(datagram).map(|timestamp| encode_pong(timestamp, server_guid, status, port))
}

pub(crate) async fn query_status(addr: SocketAddr) -> Result<ServerStatus> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    let timestamp = chrono::Utc::now().timestamp_millis();
    let client_guid = uuid::Uuid::new_v4().as_u64_pair().0 as i64;
    socket.send_to(&encode_ping(timestamp, client_guid), addr).await?;

    let mut buf = vec![0u8; 1500];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        if from.port() != addr.port() {
            continue;
        }
        return decode_pong(&buf[..len])
            .ok_or_else(|| AppError::io(format!("malformed unconnected pong from {from}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_decodes_timestamp() {
        let ping = encode_ping(1_700_000_000_000, 77);
        assert_eq!(decode_ping(&ping), Some(1_700_000_000_000));
        assert_eq!(decode_ping(&ping[..10]), None);

        let mut corrupted = ping;
        corrupted[12] ^= 0xFF;
        assert_eq!(decode_ping(&corrupted), None);
    }

    #[test]
    fn pong_carries_player_counts() {
        let status = ServerStatus {
            version_name: "1.21.0".to_string(),
            protocol_version: 685,
            players_online: 3,
            players_max: 10,
            motd: "Bedrock; world".to_string(),
        };
        let pong = encode_pong(5, 99, &status, 19132);
        let decoded = decode_pong(&pong).unwrap();
        assert_eq!(decoded.players_online, 3);
        assert_eq!(decoded.players_max, 10);
        assert_eq!(decoded.protocol_version, 685);
        assert_eq!(decoded.motd, "Bedrock, world");
    }

    #[tokio::test]
    async fn placeholder_answers_udp_probe() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let reply = answer_datagram(&buf[..len], &ServerStatus::starting("srv2"), 1, addr.port())
                .unwrap();
            server.send_to(&reply, from).await.unwrap();
        });

        let status = query_status(addr).await.unwrap();
        assert_eq!(status.players_online, 0);
        assert!(status.motd.contains("srv2 is starting"));
    }
}
