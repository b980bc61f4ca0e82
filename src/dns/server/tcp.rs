//! TCP listener
//!
//! Accepted connections persist for their lifetime (`spec.md` §2); each
//! connection's read loop reassembles the 2-byte-length-prefixed message
//! stream per §4.4.1 and replies to each completed message with the same
//! framing (§4.4.5). Grounded on the teacher's `UdpDnsServer`/accept-loop
//! shape, generalized to TCP framing; `dns/proxy/upstream.rs`'s per-server
//! timeout pattern informed the read-loop structure.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::dns::message::MAX_MESSAGE_LEN;
use crate::dns::transaction::Dispatcher;

const INITIAL_BUF: usize = 2048;

pub struct TcpServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl TcpServer {
    /// `backlog` mirrors the tuned parameter from `spec.md` §6; `tokio`
    /// doesn't expose a portable way to set it on `TcpListener::bind`, so it
    /// is accepted here for documentation/future use rather than enforced.
    pub async fn bind(addr: SocketAddr, _backlog: u32, dispatcher: Arc<Dispatcher>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "tcp listener bound");
        Ok(Self { listener, dispatcher })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(%err, "tcp accept failed");
                    continue;
                }
            };
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, dispatcher).await {
                    tracing::debug!(%peer, %err, "tcp connection closed");
                }
            });
        }
    }
}

/// Reassembly loop for one connection: read until a complete length-prefixed
/// message is available, dispatch it, reply, and continue. Messages are
/// replied to in completion order, which for a single connection processing
/// one message at a time is also receipt order (`spec.md` §5).
async fn handle_connection(mut stream: TcpStream, dispatcher: Arc<Dispatcher>) -> std::io::Result<()> {
    let mut buf = vec![0u8; INITIAL_BUF];
    let mut valid_bytes = 0usize;

    loop {
        // Drain any complete messages already in the buffer before reading more.
        while valid_bytes >= 2 {
            let payload_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if valid_bytes < 2 + payload_len {
                break;
            }
            let message = buf[2..2 + payload_len].to_vec();
            let remaining = valid_bytes - (2 + payload_len);
            buf.copy_within(2 + payload_len..valid_bytes, 0);
            valid_bytes = remaining;

            let reply = dispatcher.resolve(&message).await;
            write_framed(&mut stream, &reply).await?;
        }

        if valid_bytes == buf.len() {
            grow_buffer(&mut buf)?;
        }

        let n = stream.read(&mut buf[valid_bytes..]).await?;
        if n == 0 {
            return Ok(());
        }
        valid_bytes += n;
    }
}

fn grow_buffer(buf: &mut Vec<u8>) -> std::io::Result<()> {
    if buf.len() >= MAX_MESSAGE_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "tcp message exceeds maximum buffer size",
        ));
    }
    let new_len = (buf.len() * 2).min(MAX_MESSAGE_LEN);
    buf.resize(new_len, 0);
    Ok(())
}

async fn write_framed(stream: &mut TcpStream, reply: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(reply.len()).unwrap_or(u16::MAX);
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&reply[..len as usize]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::dns::policy::DomainPolicyTable;
    use crate::dns::transaction::DispatchConfig;
    use crate::dns::upstream::UpstreamSet;
    use crate::metrics::NoopMetricsSink;
    use std::sync::atomic::AtomicBool;
    use std::sync::RwLock;

    fn test_dispatcher() -> Arc<Dispatcher> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(Dispatcher {
            nameservers: UpstreamSet::new(),
            doh_providers: UpstreamSet::new(),
            policy: Arc::new(RwLock::new(DomainPolicyTable::new())),
            metrics: Arc::new(NoopMetricsSink),
            cfg: DispatchConfig::from_app_config(&AppConfig::default()),
            always_on_doh: Arc::new(AtomicBool::new(false)),
            invalidations: tx,
        })
    }

    fn framed_query() -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&0x1234u16.to_be_bytes());
        msg.extend_from_slice(&0x0100u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        for label in ["google", "com"] {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());

        let mut framed = Vec::new();
        framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        framed.extend_from_slice(&msg);
        framed
    }

    #[tokio::test]
    async fn segmented_write_yields_one_framed_reply() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), 16, test_dispatcher())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let framed = framed_query();
        client.write_all(&framed[..10]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        client.write_all(&framed[10..]).await.unwrap();

        let mut len_buf = [0u8; 2];
        client.read_exact(&mut len_buf).await.unwrap();
        let reply_len = u16::from_be_bytes(len_buf) as usize;
        let mut reply = vec![0u8; reply_len];
        client.read_exact(&mut reply).await.unwrap();

        assert_eq!(crate::dns::message::extract_id(&reply), Some(0x1234));
    }
}
