//! Stand-in listener answering clients of a sleeping instance.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::StatusProtocol;
use crate::error::{AppError, Result};
use crate::process::{LeaseHolder, ReleaseAck};
use crate::protocol::{bedrock, java, ServerStatus};

/// Upper bound for one placeholder exchange with a client.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DATAGRAM: usize = 1500;

/// What the listener tells clients while the real server is down.
pub(super) struct Placeholder {
    pub status: ServerStatus,
    pub kick_message: String,
    pub port: u16,
}

pub(super) enum WakeSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl WakeSocket {
    pub(super) async fn bind(protocol: StatusProtocol, port: u16) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let bound = match protocol {
            StatusProtocol::Java => TcpListener::bind(addr).await.map(Self::Tcp),
            StatusProtocol::Bedrock => UdpSocket::bind(addr).await.map(Self::Udp),
            StatusProtocol::None => {
                return Err(AppError::config("wake listener needs a status protocol"));
            }
        };
        bound.map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => AppError::port_in_use(port, None),
            _ => AppError::io(format!("Failed to bind wake listener on port {}: {}", port, e)),
        })
    }

    /// Answer clients until the lease is revoked, calling `on_contact` for each.
    ///
    /// The socket is closed when this returns; the ack, if any, must be
    /// confirmed afterwards.
    pub(super) async fn serve<F>(
        self,
        holder: LeaseHolder,
        placeholder: Arc<Placeholder>,
        on_contact: F,
    ) -> Option<ReleaseAck>
    where
        F: Fn() + Send,
    {
        match self {
            Self::Tcp(listener) => serve_tcp(listener, holder, placeholder, on_contact).await,
            Self::Udp(socket) => serve_udp(socket, holder, &placeholder, on_contact).await,
        }
    }
}

async fn serve_tcp<F>(
    listener: TcpListener,
    mut holder: LeaseHolder,
    placeholder: Arc<Placeholder>,
    on_contact: F,
) -> Option<ReleaseAck>
where
    F: Fn() + Send,
{
    let ack = loop {
        tokio::select! {
            ack = holder.revoked() => break ack,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    on_contact();
                    answer_tcp(stream, peer, Arc::clone(&placeholder));
                }
                Err(e) => log::warn!("Wake listener accept failed: {}", e),
            },
        }
    };
    drain_backlog(listener, &placeholder);
    ack
}

/// Answer connections already queued on the socket, then close it.
fn drain_backlog(listener: TcpListener, placeholder: &Arc<Placeholder>) {
    let listener = match listener.into_std() {
        Ok(listener) => listener,
        Err(e) => {
            log::warn!("Failed to drain wake listener backlog: {}", e);
            return;
        }
    };
    while let Ok((queued, peer)) = listener.accept() {
        let stream = queued
            .set_nonblocking(true)
            .and_then(|()| TcpStream::from_std(queued));
        match stream {
            Ok(stream) => answer_tcp(stream, peer, Arc::clone(placeholder)),
            Err(e) => log::debug!("Dropping queued wake connection from {}: {}", peer, e),
        }
    }
}

fn answer_tcp(mut stream: TcpStream, peer: SocketAddr, placeholder: Arc<Placeholder>) {
    tokio::spawn(async move {
        let exchange = java::serve_placeholder(
            &mut stream,
            &placeholder.status,
            &placeholder.kick_message,
        );
        match tokio::time::timeout(CLIENT_TIMEOUT, exchange).await {
            Ok(Ok(intent)) => log::debug!("Answered {:?} request from {} while waking", intent, peer),
            Ok(Err(e)) => log::debug!("Placeholder exchange with {} failed: {}", peer, e),
            Err(_) => log::debug!("Placeholder exchange with {} timed out", peer),
        }
    });
}

async fn serve_udp<F>(
    socket: UdpSocket,
    mut holder: LeaseHolder,
    placeholder: &Placeholder,
    on_contact: F,
) -> Option<ReleaseAck>
where
    F: Fn() + Send,
{
    let server_guid = uuid::Uuid::new_v4().as_u64_pair().0 as i64;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let ack = loop {
        tokio::select! {
            ack = holder.revoked() => break ack,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    on_contact();
                    let reply = bedrock::answer_datagram(
                        &buf[..len],
                        &placeholder.status,
                        server_guid,
                        placeholder.port,
                    );
                    if let Some(reply) = reply {
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            log::debug!("Failed to answer ping from {}: {}", peer, e);
                        }
                    }
                }
                Err(e) => log::debug!("Wake listener receive failed: {}", e),
            },
        }
    };
    drop(socket);
    ack
}
