//! Hand-off of an instance port between a stand-in listener and the real server.

use std::time::Duration;

use tokio::sync::oneshot;

/// How long `start` waits for a stand-in listener to drop its socket.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Held by the supervisor while something else has the instance port bound.
pub struct PortLease {
    revoke: oneshot::Sender<oneshot::Sender<()>>,
}

/// Held by the listener; resolves when the supervisor wants the port back.
#[derive(Debug)]
pub struct LeaseHolder {
    revoked: oneshot::Receiver<oneshot::Sender<()>>,
}

/// Create a connected lease pair.
pub fn port_lease() -> (PortLease, LeaseHolder) {
    let (revoke, revoked) = oneshot::channel();
    (PortLease { revoke }, LeaseHolder { revoked })
}

impl PortLease {
    /// Ask the holder to release the port and wait until it has.
    ///
    /// Returns immediately if the holder is already gone.
    pub async fn release(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.revoke.send(done_tx).is_err() {
            return;
        }
        if tokio::time::timeout(RELEASE_TIMEOUT, done_rx).await.is_err() {
            log::warn!("Port lease holder did not acknowledge release in time");
        }
    }

    /// Whether the holding listener is still alive.
    pub fn is_held(&self) -> bool {
        !self.revoke.is_closed()
    }
}

impl LeaseHolder {
    /// Wait for revocation. The returned ack must be sent after the socket is dropped.
    pub async fn revoked(&mut self) -> Option<ReleaseAck> {
        (&mut self.revoked).await.ok().map(|done| ReleaseAck { done })
    }
}

/// Confirms the port is free.
pub struct ReleaseAck {
    done: oneshot::Sender<()>,
}

impl ReleaseAck {
    pub fn confirm(self) {
        let _ = self.done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_waits_for_holder_to_drop_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (lease, mut holder) = port_lease();

        let task = tokio::spawn(async move {
            let ack = holder.revoked().await;
            drop(listener);
            if let Some(ack) = ack {
                ack.confirm();
            }
        });

        assert!(lease.is_held());
        lease.release().await;
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn release_without_holder_returns_immediately() {
        let (lease, holder) = port_lease();
        drop(holder);
        assert!(!lease.is_held());
        lease.release().await;
    }
}
