//! UDP listener
//!
//! One `SocketFd`-worth of state per datagram, per `spec.md` §4.4.1: each
//! UDP datagram is an independent transaction, dispatched on its own task so
//! that multiple outstanding queries make progress concurrently. Grounded on
//! the teacher's `UdpDnsServer` (bind, spawn-per-datagram, send back to the
//! stored source address).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::dns::message::MAX_MESSAGE_LEN;
use crate::dns::transaction::Dispatcher;

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(%addr, "udp listener bound");
        Ok(Self {
            socket: Arc::new(socket),
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs forever, spawning one task per datagram so a slow upstream for
    /// one client never blocks another's query.
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(err) => {
                    tracing::error!(%err, "udp recv_from failed");
                    continue;
                }
            };
            let query = buf[..len].to_vec();
            let socket = self.socket.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let reply = dispatcher.resolve(&query).await;
                if let Err(err) = socket.send_to(&reply, src).await {
                    tracing::warn!(%src, %err, "failed to send udp reply");
                }
            });
        }
    }
}
