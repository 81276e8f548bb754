#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use log::info;

use crate::services::ingest_listener::IngestSource;
use crate::utils::errors::Errors;

// ***************************************************************************
//                                Forwarder
// ***************************************************************************
/** Hands raw submission bodies from the web front to the ingest listener.
 * Delivery is fire-and-forget: a successful forward only means the bytes
 * left this side.
 */
#[derive(Debug, Clone)]
pub enum Forwarder {
    /// One datagram per submission to the ingest endpoint.
    Udp {
        socket: Arc<UdpSocket>,
        target: SocketAddr,
    },
    /// Same bytes over an in-process queue.
    Channel(mpsc::Sender<Vec<u8>>),
}

impl Forwarder {
    // ---------------------------------------------------------------------------
    // udp:
    // ---------------------------------------------------------------------------
    /** Resolve the ingest endpoint and open an ephemeral sending socket of the
     * same address family.
     */
    pub async fn udp(target: &str) -> Result<Forwarder, Errors> {
        let target_addr = match tokio::net::lookup_host(target).await?.next() {
            Some(a) => a,
            None => return Err(Errors::TransportUnreachable(target.to_string(), "address did not resolve".to_string())),
        };

        let local: SocketAddr = match target_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await
            .map_err(|e| Errors::BindFailed("forwarder".to_string(), local.to_string(), e))?;

        info!("Submissions will be forwarded by datagram to {}.", target_addr);
        Ok(Forwarder::Udp {socket: Arc::new(socket), target: target_addr})
    }

    // ---------------------------------------------------------------------------
    // channel:
    // ---------------------------------------------------------------------------
    /** An in-process forwarder and the ingest source that drains it. */
    pub fn channel(depth: usize) -> (Forwarder, IngestSource) {
        let (tx, rx) = mpsc::channel(depth);
        (Forwarder::Channel(tx), IngestSource::Channel(rx))
    }

    // ---------------------------------------------------------------------------
    // forward:
    // ---------------------------------------------------------------------------
    /** Send one body, unmodified. */
    pub async fn forward(&self, body: &[u8]) -> Result<(), Errors> {
        match self {
            Forwarder::Udp {socket, target} => {
                let sent = socket.send_to(body, *target).await
                    .map_err(|e| Errors::TransportUnreachable(target.to_string(), e.to_string()))?;
                if sent != body.len() {
                    let msg = format!("only {} of {} bytes sent", sent, body.len());
                    return Err(Errors::TransportUnreachable(target.to_string(), msg));
                }
                Ok(())
            },
            Forwarder::Channel(tx) => {
                tx.send(body.to_vec()).await
                    .map_err(|_| Errors::TransportUnreachable("channel".to_string(), "ingest listener has stopped".to_string()))
            },
        }
    }

    /// Where submissions go, for log messages.
    pub fn describe(&self) -> String {
        match self {
            Forwarder::Udp {target, ..} => format!("udp://{}", target),
            Forwarder::Channel(_) => "channel".to_string(),
        }
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_forward_delivers_the_exact_bytes() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap().to_string();

        let fwd = Forwarder::udp(&target).await.unwrap();
        fwd.forward(b"name=Jane+Doe&age=30").await.unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"name=Jane+Doe&age=30");
        assert_eq!(fwd.describe(), format!("udp://{}", target));
    }

    #[tokio::test]
    async fn channel_forward_fails_once_listener_is_gone() {
        let (fwd, source) = Forwarder::channel(4);
        fwd.forward(b"a=1").await.unwrap();
        drop(source);
        assert!(matches!(fwd.forward(b"a=2").await, Err(Errors::TransportUnreachable(_, _))));
    }
}
