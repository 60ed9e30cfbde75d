//! Status protocols spoken by supervised game servers.
//!
//! Used two ways: probing a live server for player counts, and answering
//! clients on behalf of a sleeping one.

pub(crate) mod bedrock;
pub(crate) mod java;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Serialize;

use crate::config::StatusProtocol;
use crate::error::{AppError, Result};

/// What a server reports about itself in a status reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub version_name: String,
    pub protocol_version: i32,
    pub players_online: u32,
    pub players_max: u32,
    pub motd: String,
}

impl ServerStatus {
    /// Placeholder reply sent while the real server is waking up.
    pub fn starting(display_name: &str) -> Self {
        let name = if display_name.is_empty() {
            "Server"
        } else {
            display_name
        };
        Self {
            version_name: "Starting".to_string(),
            protocol_version: -1,
            players_online: 0,
            players_max: 0,
            motd: format!("{name} is starting, please retry in a moment"),
        }
    }
}

/// Query a server on the local host for its status.
pub async fn probe(protocol: StatusProtocol, port: u16, timeout: Duration) -> Result<ServerStatus> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let query = async {
        match protocol {
            StatusProtocol::Java => java::query_status(addr).await,
            StatusProtocol::Bedrock => bedrock::query_status(addr).await,
            StatusProtocol::None => Err(AppError::other("instance has no status protocol")),
        }
    };
    tokio::time::timeout(timeout, query)
        .await
        .map_err(|_| AppError::timeout("status probe", timeout.as_secs().max(1)))?
}
