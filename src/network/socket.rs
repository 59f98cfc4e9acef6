//! Datagram transports the KCP service runs on.
//!
//! [`DatagramSocket`] abstracts the unreliable packet layer so the service can
//! run over real UDP in production and over an in-memory loopback in tests.
//! Addresses are generic: UDP uses `SocketAddr`, tests use whatever cheap id
//! they like.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::BastionError;

/// Largest datagram the service will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// An unreliable, unordered datagram transport.
pub trait DatagramSocket<A> {
    /// Sends one datagram to `addr`. Transport errors are surfaced; delivery
    /// is still best-effort.
    fn send_to(&mut self, payload: &[u8], addr: &A) -> Result<(), BastionError>;

    /// Drains every datagram that has arrived since the last call.
    fn receive_all(&mut self) -> Vec<(A, Vec<u8>)>;
}

/// A non-blocking UDP socket implementing [`DatagramSocket`].
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    recv_buf: Box<[u8; MAX_DATAGRAM_SIZE]>,
}

impl UdpDatagramSocket {
    /// Binds a non-blocking UDP socket to `bind_addr`.
    pub fn bind(bind_addr: SocketAddr) -> Result<Self, BastionError> {
        let socket = UdpSocket::bind(bind_addr).map_err(|e| BastionError::Socket {
            context: format!("bind {}: {}", bind_addr, e),
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| BastionError::Socket {
                context: format!("set_nonblocking: {}", e),
            })?;
        Ok(UdpDatagramSocket {
            socket,
            recv_buf: Box::new([0u8; MAX_DATAGRAM_SIZE]),
        })
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, BastionError> {
        self.socket.local_addr().map_err(|e| BastionError::Socket {
            context: format!("local_addr: {}", e),
        })
    }
}

impl DatagramSocket<SocketAddr> for UdpDatagramSocket {
    fn send_to(&mut self, payload: &[u8], addr: &SocketAddr) -> Result<(), BastionError> {
        match self.socket.send_to(payload, addr) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram, same as the network would.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(BastionError::Socket {
                context: format!("send_to {}: {}", addr, e),
            }),
        }
    }

    fn receive_all(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut received = Vec::new();
        loop {
            match self.socket.recv_from(self.recv_buf.as_mut_slice()) {
                Ok((len, from)) => {
                    if len > 0 {
                        received.push((from, self.recv_buf[..len].to_vec()));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                // Windows reports ICMP port-unreachable as ConnectionReset on
                // the next recv; skip it and keep draining.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(_) => break,
            }
        }
        received
    }
}

/// Shared in-memory network used by [`LoopbackSocket`] endpoints in tests.
#[derive(Debug, Default)]
pub struct LoopbackNet {
    queues: Mutex<HashMap<u64, VecDeque<(u64, Vec<u8>)>>>,
}

impl LoopbackNet {
    /// Creates an empty in-memory network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches an endpoint with the given address.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>, addr: u64) -> LoopbackSocket {
        self.queues.lock().entry(addr).or_default();
        LoopbackSocket {
            net: Arc::clone(self),
            addr,
        }
    }
}

/// One endpoint on a [`LoopbackNet`]. Delivery is instant and lossless unless
/// the test drops packets itself.
#[derive(Debug)]
pub struct LoopbackSocket {
    net: Arc<LoopbackNet>,
    addr: u64,
}

impl DatagramSocket<u64> for LoopbackSocket {
    fn send_to(&mut self, payload: &[u8], addr: &u64) -> Result<(), BastionError> {
        let mut queues = self.net.queues.lock();
        if let Some(queue) = queues.get_mut(addr) {
            queue.push_back((self.addr, payload.to_vec()));
        }
        // Sending to a detached address silently drops, like real UDP.
        Ok(())
    }

    fn receive_all(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut queues = self.net.queues.lock();
        match queues.get_mut(&self.addr) {
            Some(queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_delivers_between_endpoints() {
        let net = LoopbackNet::new();
        let mut a = net.endpoint(1);
        let mut b = net.endpoint(2);
        a.send_to(b"ping", &2).unwrap();
        let received = b.receive_all();
        assert_eq!(received, vec![(1, b"ping".to_vec())]);
        assert!(b.receive_all().is_empty());
    }

    #[test]
    fn loopback_send_to_unknown_addr_is_dropped() {
        let net = LoopbackNet::new();
        let mut a = net.endpoint(1);
        assert!(a.send_to(b"void", &99).is_ok());
    }

    #[test]
    fn loopback_preserves_send_order() {
        let net = LoopbackNet::new();
        let mut a = net.endpoint(1);
        let mut b = net.endpoint(2);
        for i in 0..5u8 {
            a.send_to(&[i], &2).unwrap();
        }
        let payloads: Vec<u8> = b.receive_all().into_iter().map(|(_, p)| p[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn udp_roundtrip_on_localhost() {
        let mut a = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.local_addr().unwrap();
        a.send_to(b"over the wire", &b_addr).unwrap();
        // Non-blocking receive may need a moment for local delivery.
        let mut received = Vec::new();
        for _ in 0..50 {
            received = b.receive_all();
            if !received.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, b"over the wire");
    }
}
