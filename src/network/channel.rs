//! Per-connection channel state.
//!
//! A [`KcpChannel`] owns everything specific to one remote peer: the KCP ARQ
//! instance, the receive ring and packet parser, and sends queued while the
//! handshake is still in flight. The service owns the shared socket and the
//! handshake itself; the channel only sees its own traffic.

use std::collections::VecDeque;

use crate::network::buffer::{PacketParser, RingBuffer};
use crate::network::kcp::Kcp;
use crate::{BastionError, ConnectionId};

/// Which side of the handshake created this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// We sent the SYN.
    Connect,
    /// We received the SYN.
    Accept,
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// SYN sent, waiting for ACK. Only the connect side passes through here.
    Connecting,
    /// Handshake complete, KCP active.
    Established,
    /// Terminal; the service removes disposed channels on its next sweep.
    Disposed,
}

/// State for a single reliable connection over the shared datagram socket.
#[derive(Debug)]
pub struct KcpChannel<A> {
    /// Our connection id; the peer stamps it on every datagram it sends us.
    pub local_id: ConnectionId,
    /// The peer's connection id; zero until the handshake resolves it.
    pub remote_id: u32,
    /// Where datagrams for this peer go.
    pub remote_addr: A,
    kind: ChannelKind,
    state: ChannelState,
    kcp: Option<Kcp>,
    /// Framed packets accepted before the handshake completed.
    pending_sends: VecDeque<Vec<u8>>,
    /// Creation time, for handshake timeout.
    pub created_at_ms: u64,
    /// Last time any datagram arrived, for idle timeout.
    pub last_recv_ms: u64,
    recv_buffer: RingBuffer,
    parser: PacketParser,
}

impl<A> KcpChannel<A> {
    /// Creates the initiating side. KCP starts once the ACK supplies the
    /// responder's connection id.
    pub fn new_connect(local_id: ConnectionId, remote_addr: A, now_ms: u64) -> Self {
        KcpChannel {
            local_id,
            remote_id: 0,
            remote_addr,
            kind: ChannelKind::Connect,
            state: ChannelState::Connecting,
            kcp: None,
            pending_sends: VecDeque::new(),
            created_at_ms: now_ms,
            last_recv_ms: now_ms,
            recv_buffer: RingBuffer::new(),
            parser: PacketParser::new(),
        }
    }

    /// Creates the accepting side. The SYN already carried the initiator's
    /// connection id, so KCP starts immediately.
    pub fn new_accept(local_id: ConnectionId, remote_id: u32, remote_addr: A, now_ms: u64) -> Self {
        KcpChannel {
            local_id,
            remote_id,
            remote_addr,
            kind: ChannelKind::Accept,
            state: ChannelState::Established,
            // Outgoing segments carry the peer's id so its socket can route
            // them by the leading four bytes.
            kcp: Some(Kcp::new(remote_id)),
            pending_sends: VecDeque::new(),
            created_at_ms: now_ms,
            last_recv_ms: now_ms,
            recv_buffer: RingBuffer::new(),
            parser: PacketParser::new(),
        }
    }

    /// Which side of the handshake this channel is.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Completes the connect-side handshake with the responder's id from the
    /// ACK. Queued sends are handed to KCP in order. Idempotent for the
    /// duplicate ACKs a lossy network produces.
    pub fn establish(&mut self, remote_id: u32, now_ms: u64) -> Result<(), BastionError> {
        if self.state == ChannelState::Established {
            return Ok(());
        }
        if self.state == ChannelState::Disposed {
            return Err(BastionError::SessionDisposed);
        }
        self.remote_id = remote_id;
        let mut kcp = Kcp::new(remote_id);
        for framed in self.pending_sends.drain(..) {
            kcp.send(&framed)?;
        }
        self.kcp = Some(kcp);
        self.state = ChannelState::Established;
        self.last_recv_ms = now_ms;
        Ok(())
    }

    /// Queues one application packet for reliable delivery. Accepted while
    /// connecting; those bytes flow as soon as the handshake completes.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), BastionError> {
        if self.state == ChannelState::Disposed {
            return Err(BastionError::SessionDisposed);
        }
        let framed = PacketParser::frame(payload)?;
        match self.kcp.as_mut() {
            Some(kcp) => kcp.send(&framed),
            None => {
                self.pending_sends.push_back(framed);
                Ok(())
            }
        }
    }

    /// Feeds a raw KCP datagram from the peer. Routing already happened in
    /// the service; the conversation id inside the segments is ignored here.
    pub fn input(&mut self, datagram: &[u8], now_ms: u64) -> Result<(), BastionError> {
        self.last_recv_ms = now_ms;
        match self.kcp.as_mut() {
            Some(kcp) => kcp.input(datagram),
            // Data before the ACK means the peer thinks we are established
            // while we are not; drop it, retransmission will recover.
            None => Ok(()),
        }
    }

    /// Pulls complete application packets out of the KCP stream.
    pub fn drain_packets(&mut self) -> Result<Vec<Vec<u8>>, BastionError> {
        let mut packets = Vec::new();
        if let Some(kcp) = self.kcp.as_mut() {
            while let Some(message) = kcp.recv() {
                self.recv_buffer.write(&message);
            }
        }
        while let Some(packet) = self.parser.parse(&mut self.recv_buffer)? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Advances KCP and returns datagrams to put on the wire. The peer's
    /// connection id is already stamped inside each segment, so these go out
    /// as-is.
    pub fn update(&mut self, now_ms: u64) -> Vec<Vec<u8>> {
        match self.kcp.as_mut() {
            Some(kcp) => {
                kcp.update(now_ms as u32);
                kcp.take_outgoing()
            }
            None => Vec::new(),
        }
    }

    /// When the next [`KcpChannel::update`] is due, in ms.
    #[must_use]
    pub fn next_update_ms(&self, now_ms: u64) -> u64 {
        match self.kcp.as_ref() {
            Some(kcp) => {
                let next = kcp.check(now_ms as u32);
                now_ms + u64::from(next.wrapping_sub(now_ms as u32))
            }
            None => now_ms,
        }
    }

    /// Whether KCP has given up on the link.
    #[must_use]
    pub fn is_dead_link(&self) -> bool {
        self.kcp.as_ref().is_some_and(Kcp::is_dead_link)
    }

    /// Marks the channel terminal. Further sends fail.
    pub fn dispose(&mut self) {
        self.state = ChannelState::Disposed;
        self.kcp = None;
        self.pending_sends.clear();
    }
}
