//! The KCP connection service: handshake, routing and timers.
//!
//! One [`KcpService`] multiplexes many reliable channels over a single
//! datagram socket. Datagrams are routed by their leading four bytes:
//!
//! - `1` SYN: `[tag u32][initiator_conn u32]`, 8 bytes.
//! - `2` ACK: `[tag u32][initiator_conn u32][responder_conn u32]`, 12 bytes.
//! - `3` FIN: `[tag u32][sender_conn u32][receiver_conn u32][error u32]`,
//!   16 bytes.
//! - anything `>= 1000`: a KCP segment stream for the channel with that
//!   connection id.
//!
//! Connection ids start at [`ConnectionId::MIN_VALID`] so they can never be
//! mistaken for a control tag. The service is poll-driven: the host calls
//! [`KcpService::update`] on its tick and drains [`ServiceEvent`]s.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::network::channel::{ChannelKind, ChannelState, KcpChannel};
use crate::network::socket::DatagramSocket;
use crate::rng::Pcg32;
use crate::{BastionError, ConnectionId};

const TAG_SYN: u32 = 1;
const TAG_ACK: u32 = 2;
const TAG_FIN: u32 = 3;

/// Error code carried in a FIN when the local host disposed the connection
/// without a more specific reason.
pub const ERR_PEER_DISPOSED: u32 = 100_000;

/// Tunables for a [`KcpService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// A channel with no inbound traffic for this long is torn down.
    pub idle_timeout_ms: u64,
    /// SYN retransmission interval while connecting.
    pub connect_retry_ms: u64,
    /// Give up connecting after this long without an ACK.
    pub connect_timeout_ms: u64,
    /// How many copies of a FIN to send. FINs are fire-and-forget, so a few
    /// copies stand in for reliability.
    pub fin_repeat: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            idle_timeout_ms: 20_000,
            connect_retry_ms: 200,
            connect_timeout_ms: 20_000,
            fin_repeat: 4,
        }
    }
}

/// What a service observed during [`KcpService::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent<A> {
    /// A remote peer completed a handshake against us.
    Accepted {
        /// Local id of the new channel.
        conn: ConnectionId,
        /// Where the peer connected from.
        addr: A,
    },
    /// An outbound connect completed.
    Connected {
        /// Local id of the now-established channel.
        conn: ConnectionId,
    },
    /// A channel was torn down; the error says why.
    Disconnected {
        /// Local id of the closed channel.
        conn: ConnectionId,
        /// The reason the channel closed.
        error: BastionError,
    },
    /// One complete application packet arrived.
    Packet {
        /// The channel it arrived on.
        conn: ConnectionId,
        /// The reassembled packet body.
        data: Vec<u8>,
    },
}

/// Multiplexes reliable KCP channels over one datagram socket.
#[derive(Debug)]
pub struct KcpService<A, S> {
    socket: S,
    config: ServiceConfig,
    channels: HashMap<u32, KcpChannel<A>>,
    /// Initiator conn id -> local conn id, kept until the accept side sees
    /// first data so duplicate SYNs re-ACK instead of spawning channels.
    wait_accept: HashMap<u32, u32>,
    /// Wheel of wakeups: due time -> channels to update then.
    timers: BTreeMap<u64, SmallVec<[u32; 4]>>,
    events: VecDeque<ServiceEvent<A>>,
    rng: Pcg32,
}

impl<A, S> KcpService<A, S>
where
    A: Clone + PartialEq + Debug,
    S: DatagramSocket<A>,
{
    /// Wraps `socket` in a service with the given config. `seed` drives
    /// connection-id generation; any value works, uniqueness is enforced
    /// against live channels.
    pub fn new(socket: S, config: ServiceConfig, seed: u64) -> Self {
        KcpService {
            socket,
            config,
            channels: HashMap::new(),
            wait_accept: HashMap::new(),
            timers: BTreeMap::new(),
            events: VecDeque::new(),
            rng: Pcg32::seed_from_u64(seed),
        }
    }

    /// Pops the next pending event.
    pub fn poll_event(&mut self) -> Option<ServiceEvent<A>> {
        self.events.pop_front()
    }

    /// Number of live channels, disposed ones excluded.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels
            .values()
            .filter(|c| c.state() != ChannelState::Disposed)
            .count()
    }

    fn fresh_conn_id(&mut self) -> u32 {
        loop {
            let id = self
                .rng
                .gen_range_u32(ConnectionId::MIN_VALID, u32::MAX);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    fn schedule(&mut self, at_ms: u64, conn: u32) {
        self.timers.entry(at_ms).or_default().push(conn);
    }

    /// Starts a handshake toward `addr`. The returned id is usable for
    /// [`KcpService::send`] immediately; bytes flow once the ACK lands.
    pub fn connect(&mut self, addr: A, now_ms: u64) -> Result<ConnectionId, BastionError> {
        let id = self.fresh_conn_id();
        let conn = ConnectionId::new(id);
        let channel = KcpChannel::new_connect(conn, addr.clone(), now_ms);
        self.channels.insert(id, channel);
        self.send_syn(id, &addr)?;
        self.schedule(now_ms + self.config.connect_retry_ms, id);
        debug!(conn = id, ?addr, "connecting");
        Ok(conn)
    }

    fn send_syn(&mut self, local_id: u32, addr: &A) -> Result<(), BastionError> {
        let mut packet = Vec::with_capacity(8);
        packet.extend_from_slice(&TAG_SYN.to_le_bytes());
        packet.extend_from_slice(&local_id.to_le_bytes());
        self.socket.send_to(&packet, addr)
    }

    fn send_ack(&mut self, initiator: u32, responder: u32, addr: &A) -> Result<(), BastionError> {
        let mut packet = Vec::with_capacity(12);
        packet.extend_from_slice(&TAG_ACK.to_le_bytes());
        packet.extend_from_slice(&initiator.to_le_bytes());
        packet.extend_from_slice(&responder.to_le_bytes());
        self.socket.send_to(&packet, addr)
    }

    fn send_fin(&mut self, local_id: u32, remote_id: u32, error: u32, addr: &A) {
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&TAG_FIN.to_le_bytes());
        packet.extend_from_slice(&local_id.to_le_bytes());
        packet.extend_from_slice(&remote_id.to_le_bytes());
        packet.extend_from_slice(&error.to_le_bytes());
        for _ in 0..self.config.fin_repeat {
            if let Err(e) = self.socket.send_to(&packet, addr) {
                warn!(conn = local_id, error = %e, "fin send failed");
                break;
            }
        }
    }

    /// Queues `payload` for reliable, ordered delivery on `conn`.
    pub fn send(&mut self, conn: ConnectionId, payload: &[u8]) -> Result<(), BastionError> {
        let channel = self
            .channels
            .get_mut(&conn.as_u32())
            .ok_or(BastionError::SessionDisposed)?;
        channel.send(payload)
    }

    /// Tears down `conn`, notifying the peer with `error_code`.
    pub fn disconnect(&mut self, conn: ConnectionId, error_code: u32) {
        let id = conn.as_u32();
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.state() == ChannelState::Disposed {
            return;
        }
        let remote_id = channel.remote_id;
        let addr = channel.remote_addr.clone();
        channel.dispose();
        if remote_id != 0 {
            self.send_fin(id, remote_id, error_code, &addr);
        }
        self.remove_channel(id);
        debug!(conn = id, code = error_code, "disconnected locally");
    }

    fn remove_channel(&mut self, id: u32) {
        if let Some(channel) = self.channels.remove(&id) {
            if channel.remote_id != 0 {
                self.wait_accept.remove(&channel.remote_id);
            }
        }
    }

    /// Tears everything down, FIN-ing every live peer.
    pub fn dispose(&mut self, error_code: u32) {
        let ids: Vec<u32> = self.channels.keys().copied().collect();
        for id in ids {
            self.disconnect(ConnectionId::new(id), error_code);
        }
        self.timers.clear();
        self.events.clear();
    }

    /// One service tick: drain the socket, run due timers, sweep timeouts.
    pub fn update(&mut self, now_ms: u64) {
        let mut touched: HashSet<u32> = HashSet::new();

        for (addr, datagram) in self.socket.receive_all() {
            self.handle_datagram(&addr, &datagram, now_ms, &mut touched);
        }

        // Timer wheel: every entry at or before now is due.
        let due_keys: Vec<u64> = self.timers.range(..=now_ms).map(|(k, _)| *k).collect();
        for key in due_keys {
            if let Some(ids) = self.timers.remove(&key) {
                touched.extend(ids);
            }
        }

        for id in touched {
            self.update_channel(id, now_ms);
        }

        self.sweep_idle(now_ms);
    }

    fn handle_datagram(
        &mut self,
        addr: &A,
        datagram: &[u8],
        now_ms: u64,
        touched: &mut HashSet<u32>,
    ) {
        if datagram.len() < 4 {
            return;
        }
        let head = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        match head {
            TAG_SYN => self.handle_syn(addr, datagram, now_ms),
            TAG_ACK => self.handle_ack(addr, datagram, now_ms, touched),
            TAG_FIN => self.handle_fin(datagram),
            id if id >= ConnectionId::MIN_VALID => {
                if let Some(channel) = self.channels.get_mut(&id) {
                    if let Err(e) = channel.input(datagram, now_ms) {
                        trace!(conn = id, error = %e, "dropping malformed datagram");
                        return;
                    }
                    // First data promotes the accept out of the wait table.
                    if channel.kind() == ChannelKind::Accept {
                        self.wait_accept.remove(&channel.remote_id);
                    }
                    touched.insert(id);
                } else {
                    trace!(conn = id, "datagram for unknown channel");
                }
            }
            _ => trace!(head, "datagram with invalid routing head"),
        }
    }

    fn handle_syn(&mut self, addr: &A, datagram: &[u8], now_ms: u64) {
        if datagram.len() != 8 {
            return;
        }
        let initiator = u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        if initiator < ConnectionId::MIN_VALID {
            return;
        }
        if let Some(existing) = self.wait_accept.get(&initiator).copied() {
            let same_addr = self
                .channels
                .get(&existing)
                .map(|channel| channel.remote_addr == *addr);
            match same_addr {
                // Duplicate SYN from the same peer: the original ACK was
                // probably lost, answer it again.
                Some(true) => {
                    if let Err(e) = self.send_ack(initiator, existing, addr) {
                        warn!(conn = existing, error = %e, "re-ack failed");
                    }
                    return;
                }
                // Same initiator id from a different address: the old peer
                // is gone (or this id was reused), evict the stale channel.
                Some(false) => {
                    debug!(conn = existing, "evicting stale accept for reused initiator id");
                    self.remove_channel(existing);
                }
                None => {
                    self.wait_accept.remove(&initiator);
                }
            }
        }
        let local = self.fresh_conn_id();
        let conn = ConnectionId::new(local);
        let channel = KcpChannel::new_accept(conn, initiator, addr.clone(), now_ms);
        self.channels.insert(local, channel);
        self.wait_accept.insert(initiator, local);
        if let Err(e) = self.send_ack(initiator, local, addr) {
            warn!(conn = local, error = %e, "ack send failed");
        }
        self.schedule(now_ms + 10, local);
        self.events.push_back(ServiceEvent::Accepted { conn, addr: addr.clone() });
        debug!(conn = local, remote = initiator, ?addr, "accepted");
    }

    fn handle_ack(
        &mut self,
        addr: &A,
        datagram: &[u8],
        now_ms: u64,
        touched: &mut HashSet<u32>,
    ) {
        if datagram.len() != 12 {
            return;
        }
        let initiator = u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        let responder = u32::from_le_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
        let Some(channel) = self.channels.get_mut(&initiator) else {
            trace!(conn = initiator, "ack for unknown channel");
            return;
        };
        if channel.kind() != ChannelKind::Connect || channel.remote_addr != *addr {
            return;
        }
        let was_connecting = channel.state() == ChannelState::Connecting;
        channel.last_recv_ms = now_ms;
        if channel.establish(responder, now_ms).is_err() {
            return;
        }
        if was_connecting {
            self.events.push_back(ServiceEvent::Connected {
                conn: ConnectionId::new(initiator),
            });
            debug!(conn = initiator, remote = responder, "connected");
        }
        touched.insert(initiator);
    }

    fn handle_fin(&mut self, datagram: &[u8]) {
        if datagram.len() != 16 {
            return;
        }
        let sender = u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        let receiver = u32::from_le_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
        let code = u32::from_le_bytes([datagram[12], datagram[13], datagram[14], datagram[15]]);
        let Some(channel) = self.channels.get_mut(&receiver) else {
            return;
        };
        // A FIN must name the conversation it closes; established channels
        // also know the sender's id and can check it.
        if channel.remote_id != 0 && channel.remote_id != sender {
            return;
        }
        channel.dispose();
        self.remove_channel(receiver);
        self.events.push_back(ServiceEvent::Disconnected {
            conn: ConnectionId::new(receiver),
            error: BastionError::PeerDisconnect {
                conn: ConnectionId::new(receiver),
                code,
            },
        });
        debug!(conn = receiver, code, "peer disconnected");
    }

    fn update_channel(&mut self, id: u32, now_ms: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        match channel.state() {
            ChannelState::Disposed => {
                self.remove_channel(id);
                return;
            }
            ChannelState::Connecting => {
                if now_ms.saturating_sub(channel.created_at_ms) >= self.config.connect_timeout_ms {
                    let addr = channel.remote_addr.clone();
                    debug!(conn = id, ?addr, "connect timed out");
                    self.remove_channel(id);
                    self.events.push_back(ServiceEvent::Disconnected {
                        conn: ConnectionId::new(id),
                        error: BastionError::ConnectTimeout {
                            conn: ConnectionId::new(id),
                        },
                    });
                    return;
                }
                let addr = channel.remote_addr.clone();
                if let Err(e) = self.send_syn(id, &addr) {
                    warn!(conn = id, error = %e, "syn retry failed");
                }
                self.schedule(now_ms + self.config.connect_retry_ms, id);
                return;
            }
            ChannelState::Established => {}
        }

        let datagrams = channel.update(now_ms);
        let addr = channel.remote_addr.clone();
        let dead = channel.is_dead_link();
        let packets = match channel.drain_packets() {
            Ok(packets) => packets,
            Err(e) => {
                // Framing corruption is unrecoverable for the stream.
                warn!(conn = id, error = %e, "stream corrupt, closing channel");
                let remote_id = channel.remote_id;
                channel.dispose();
                self.send_fin(id, remote_id, ERR_PEER_DISPOSED, &addr);
                self.remove_channel(id);
                self.events.push_back(ServiceEvent::Disconnected {
                    conn: ConnectionId::new(id),
                    error: e,
                });
                return;
            }
        };
        for data in packets {
            self.events.push_back(ServiceEvent::Packet {
                conn: ConnectionId::new(id),
                data,
            });
        }
        for datagram in datagrams {
            if let Err(e) = self.socket.send_to(&datagram, &addr) {
                warn!(conn = id, error = %e, "send failed");
            }
        }
        if dead {
            debug!(conn = id, "dead link");
            self.remove_channel(id);
            self.events.push_back(ServiceEvent::Disconnected {
                conn: ConnectionId::new(id),
                error: BastionError::LinkDead {
                    conn: ConnectionId::new(id),
                },
            });
            return;
        }
        let next = self
            .channels
            .get(&id)
            .map(|c| c.next_update_ms(now_ms))
            .unwrap_or(now_ms)
            .max(now_ms + 1);
        self.schedule(next, id);
    }

    fn sweep_idle(&mut self, now_ms: u64) {
        let idle: Vec<u32> = self
            .channels
            .iter()
            .filter(|(_, c)| {
                c.state() == ChannelState::Established
                    && now_ms.saturating_sub(c.last_recv_ms) >= self.config.idle_timeout_ms
            })
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            debug!(conn = id, "idle timeout");
            if let Some(channel) = self.channels.get_mut(&id) {
                let remote_id = channel.remote_id;
                let addr = channel.remote_addr.clone();
                channel.dispose();
                self.send_fin(id, remote_id, ERR_PEER_DISPOSED, &addr);
            }
            self.remove_channel(id);
            self.events.push_back(ServiceEvent::Disconnected {
                conn: ConnectionId::new(id),
                error: BastionError::NetworkReset {
                    conn: ConnectionId::new(id),
                },
            });
        }
    }
}
