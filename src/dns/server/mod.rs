//! Server sockets
//!
//! One UDP socket and one TCP listener per configured listen address
//! (`spec.md` §4.6); incoming queries on both feed the same `Dispatcher`.

pub mod tcp;
pub mod udp;

pub use tcp::TcpServer;
pub use udp::UdpServer;
