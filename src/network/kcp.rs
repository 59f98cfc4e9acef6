//! Safe reimplementation of the KCP ARQ algorithm.
//!
//! Provides ordered, reliable delivery over an unreliable datagram path:
//! sliding send/receive windows, retransmission with RTT-driven timeouts, fast
//! retransmit on duplicate acks, and fragmentation/reassembly against the MTU.
//! Connection setup/teardown is *not* handled here — KCP only orders payload;
//! the handshake lives in [`crate::network::service`].
//!
//! Callers drive the state machine explicitly:
//!
//! - [`Kcp::send`] queues application bytes.
//! - [`Kcp::input`] feeds raw datagrams received from the peer.
//! - [`Kcp::update`] advances the internal clock and emits datagrams, drained
//!   via [`Kcp::take_outgoing`].
//! - [`Kcp::check`] reports when the next update is due, so a service with
//!   many channels can skip the ones with no pending timers.
//! - [`Kcp::recv`] yields reassembled messages in order.
//!
//! The segment header matches classic KCP (24 bytes, little endian):
//! `conv u32 | cmd u8 | frg u8 | wnd u16 | ts u32 | sn u32 | una u32 | len u32`.
//! `conv` is stamped with the *receiver's* connection id so the shared socket
//! can route a datagram by its leading 4 bytes; it is not validated here since
//! routing happens before input.

use std::collections::{BTreeMap, VecDeque};

use crate::BastionError;

/// Bytes of segment header per fragment.
pub const KCP_OVERHEAD: usize = 24;

/// Default maximum transmission unit.
pub const KCP_MTU: usize = 1400;

const CMD_PUSH: u8 = 81;
const CMD_ACK: u8 = 82;

const WND_SND: u16 = 256;
const WND_RCV: u16 = 256;

const RTO_MIN: u32 = 30;
const RTO_DEFAULT: u32 = 200;
const RTO_MAX: u32 = 60_000;

/// Flush interval of the internal clock, in ms.
const INTERVAL: u32 = 10;

/// Duplicate-ack count that triggers fast retransmit.
const FAST_RESEND: u32 = 2;

/// Retransmission count after which the link is declared dead.
const DEAD_LINK: u32 = 20;

fn seg_diff(later: u32, earlier: u32) -> i64 {
    i64::from(later) - i64::from(earlier)
}

#[derive(Debug, Clone)]
struct Segment {
    conv: u32,
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    data: Vec<u8>,
}

impl Segment {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.conv.to_le_bytes());
        out.push(self.cmd);
        out.push(self.frg);
        out.extend_from_slice(&self.wnd.to_le_bytes());
        out.extend_from_slice(&self.ts.to_le_bytes());
        out.extend_from_slice(&self.sn.to_le_bytes());
        out.extend_from_slice(&self.una.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }
}

#[derive(Debug)]
struct SendEntry {
    seg: Segment,
    resend_ts: u32,
    rto: u32,
    xmit: u32,
    fastack: u32,
}

/// The KCP reliable-delivery state machine for one direction pair.
#[derive(Debug)]
pub struct Kcp {
    conv: u32,
    mtu: usize,
    mss: usize,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,

    rx_srtt: u32,
    rx_rttval: u32,
    rx_rto: u32,

    current: u32,
    ts_flush: u32,
    updated: bool,
    dead: bool,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<SendEntry>,
    rcv_buf: BTreeMap<u32, Segment>,
    rcv_queue: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,
    outgoing: Vec<Vec<u8>>,
}

impl Kcp {
    /// Creates a state machine. `conv` is stamped on every outgoing segment;
    /// set it to the peer's connection id so the peer's shared socket can
    /// route the datagram.
    #[must_use]
    pub fn new(conv: u32) -> Self {
        Kcp {
            conv,
            mtu: KCP_MTU,
            mss: KCP_MTU - KCP_OVERHEAD,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            rx_srtt: 0,
            rx_rttval: 0,
            rx_rto: RTO_DEFAULT,
            current: 0,
            ts_flush: 0,
            updated: false,
            dead: false,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: BTreeMap::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    /// Returns `true` once a segment has been retransmitted past the dead-link
    /// threshold; the owning channel must be disposed.
    #[must_use]
    pub fn is_dead_link(&self) -> bool {
        self.dead
    }

    /// Number of segments queued or in flight on the send side.
    #[must_use]
    pub fn wait_snd(&self) -> usize {
        self.snd_queue.len() + self.snd_buf.len()
    }

    /// Queues `data` for reliable delivery, fragmenting against the MSS.
    pub fn send(&mut self, data: &[u8]) -> Result<(), BastionError> {
        let count = if data.is_empty() {
            1
        } else {
            data.len().div_ceil(self.mss)
        };
        if count > 255 {
            return Err(BastionError::PacketTooLarge {
                len: data.len(),
                max: self.mss * 255,
            });
        }
        for i in 0..count {
            let start = i * self.mss;
            let end = (start + self.mss).min(data.len());
            self.snd_queue.push_back(Segment {
                conv: self.conv,
                cmd: CMD_PUSH,
                // Fragment index counts down to 0 so the receiver knows when a
                // message is complete.
                frg: (count - 1 - i) as u8,
                wnd: 0,
                ts: 0,
                sn: 0,
                una: 0,
                data: data[start..end].to_vec(),
            });
        }
        Ok(())
    }

    /// Feeds one raw datagram from the peer into the state machine.
    pub fn input(&mut self, data: &[u8]) -> Result<(), BastionError> {
        if data.len() < KCP_OVERHEAD {
            return Err(BastionError::Codec {
                context: format!("kcp segment shorter than header: {} bytes", data.len()),
            });
        }
        let mut pos = 0;
        let mut max_ack: Option<u32> = None;
        while pos + KCP_OVERHEAD <= data.len() {
            let header = &data[pos..pos + KCP_OVERHEAD];
            let cmd = header[4];
            let frg = header[5];
            let wnd = u16::from_le_bytes([header[6], header[7]]);
            let ts = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
            let sn = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
            let una = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
            let len = u32::from_le_bytes([header[20], header[21], header[22], header[23]]) as usize;
            pos += KCP_OVERHEAD;
            if pos + len > data.len() {
                return Err(BastionError::Codec {
                    context: format!("kcp segment body truncated: declared {}", len),
                });
            }
            let body = &data[pos..pos + len];
            pos += len;

            self.rmt_wnd = wnd;
            self.parse_una(una);

            match cmd {
                CMD_ACK => {
                    let rtt = seg_diff(self.current, ts);
                    if rtt >= 0 {
                        self.update_rtt(rtt as u32);
                    }
                    self.ack_segment(sn);
                    max_ack = Some(max_ack.map_or(sn, |m| m.max(sn)));
                }
                CMD_PUSH => {
                    if seg_diff(sn, self.rcv_nxt + u32::from(self.rcv_wnd)) < 0 {
                        self.acklist.push((sn, ts));
                        if seg_diff(sn, self.rcv_nxt) >= 0 {
                            self.rcv_buf.entry(sn).or_insert(Segment {
                                conv: self.conv,
                                cmd,
                                frg,
                                wnd,
                                ts,
                                sn,
                                una,
                                data: body.to_vec(),
                            });
                            self.move_rcv_buf_to_queue();
                        }
                    }
                }
                other => {
                    return Err(BastionError::Codec {
                        context: format!("kcp unknown command {}", other),
                    });
                }
            }
        }
        if let Some(ack_sn) = max_ack {
            // Count duplicate-ack evidence for fast retransmit.
            for entry in &mut self.snd_buf {
                if seg_diff(entry.seg.sn, ack_sn) < 0 {
                    entry.fastack += 1;
                }
            }
        }
        Ok(())
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(front) = self.snd_buf.front() {
            if seg_diff(front.seg.sn, una) < 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
        if seg_diff(una, self.snd_una) > 0 {
            self.snd_una = una;
        }
    }

    fn ack_segment(&mut self, sn: u32) {
        self.snd_buf.retain(|entry| entry.seg.sn != sn);
        // snd_buf is ordered by sn, so the front is the new lowest unacked.
        self.snd_una = match self.snd_buf.front() {
            Some(front) => front.seg.sn,
            None => self.snd_nxt,
        };
    }

    fn move_rcv_buf_to_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.remove(&self.rcv_nxt) {
            if self.rcv_queue.len() >= usize::from(self.rcv_wnd) {
                // Window full: put it back and stop.
                self.rcv_buf.insert(seg.sn, seg);
                break;
            }
            self.rcv_queue.push_back(seg);
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        }
    }

    fn update_rtt(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rx_srtt);
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }
        let rto = self.rx_srtt + INTERVAL.max(4 * self.rx_rttval);
        self.rx_rto = rto.clamp(RTO_MIN, RTO_MAX);
    }

    /// Size of the next complete message in the receive queue, if one is
    /// fully reassembled.
    #[must_use]
    pub fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.data.len());
        }
        if self.rcv_queue.len() < usize::from(first.frg) + 1 {
            return None;
        }
        let mut total = 0;
        for seg in &self.rcv_queue {
            total += seg.data.len();
            if seg.frg == 0 {
                return Some(total);
            }
        }
        None
    }

    /// Pops the next complete, in-order message.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        let size = self.peek_size()?;
        let mut message = Vec::with_capacity(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            let last = seg.frg == 0;
            message.extend_from_slice(&seg.data);
            if last {
                break;
            }
        }
        self.move_rcv_buf_to_queue();
        Some(message)
    }

    /// Advances the internal clock to `now` (ms) and flushes acks, new
    /// segments and due retransmissions into the outgoing datagram list.
    pub fn update(&mut self, now: u32) {
        self.current = now;
        if !self.updated {
            self.updated = true;
            self.ts_flush = now;
        }
        if seg_diff(now, self.ts_flush) >= 0 {
            self.ts_flush = now.wrapping_add(INTERVAL);
            self.flush();
        }
    }

    /// Returns the time the next [`Kcp::update`] is due. A channel with no
    /// outstanding timers reports a full interval ahead so the service can
    /// skip it until then.
    #[must_use]
    pub fn check(&self, now: u32) -> u32 {
        if !self.updated {
            return now;
        }
        let mut next = self.ts_flush;
        if seg_diff(now, next) >= 0 {
            return now;
        }
        for entry in &self.snd_buf {
            if seg_diff(entry.resend_ts, now) <= 0 {
                return now;
            }
            if seg_diff(entry.resend_ts, next) < 0 {
                next = entry.resend_ts;
            }
        }
        next
    }

    /// Drains datagrams produced since the last call. Each entry is one UDP
    /// payload, already coalesced against the MTU.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outgoing)
    }

    fn recv_window_available(&self) -> u16 {
        (usize::from(self.rcv_wnd).saturating_sub(self.rcv_queue.len())) as u16
    }

    fn emit(buf: &mut Vec<u8>, outgoing: &mut Vec<Vec<u8>>, seg: &Segment, mtu: usize) {
        let need = KCP_OVERHEAD + seg.data.len();
        if !buf.is_empty() && buf.len() + need > mtu {
            outgoing.push(std::mem::take(buf));
        }
        seg.encode_into(buf);
    }

    fn flush(&mut self) {
        let now = self.current;
        let wnd = self.recv_window_available();
        let mut buf: Vec<u8> = Vec::with_capacity(self.mtu);

        // Pending acks first: they unblock the peer's send window.
        for (sn, ts) in std::mem::take(&mut self.acklist) {
            let seg = Segment {
                conv: self.conv,
                cmd: CMD_ACK,
                frg: 0,
                wnd,
                ts,
                sn,
                una: self.rcv_nxt,
                data: Vec::new(),
            };
            Self::emit(&mut buf, &mut self.outgoing, &seg, self.mtu);
        }

        // Admit queued segments into the in-flight window. A zero remote
        // window still admits one segment so the link cannot deadlock.
        let cwnd = u32::from(self.snd_wnd.min(self.rmt_wnd.max(1)));
        while seg_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(SendEntry {
                seg,
                resend_ts: now,
                rto: self.rx_rto,
                xmit: 0,
                fastack: 0,
            });
        }

        // Transmit fresh segments and retransmit due/fast-acked ones.
        let mut dead = self.dead;
        for entry in &mut self.snd_buf {
            let fresh = entry.xmit == 0;
            let lost = seg_diff(now, entry.resend_ts) >= 0 && !fresh;
            let fast = entry.fastack >= FAST_RESEND;
            if !(fresh || lost || fast) {
                continue;
            }
            entry.xmit += 1;
            if lost {
                // Back off the timer on a genuine timeout.
                entry.rto += entry.rto / 2;
            }
            entry.resend_ts = now.wrapping_add(entry.rto);
            entry.fastack = 0;
            entry.seg.ts = now;
            entry.seg.wnd = wnd;
            entry.seg.una = self.rcv_nxt;
            Self::emit(&mut buf, &mut self.outgoing, &entry.seg, self.mtu);
            if entry.xmit >= DEAD_LINK {
                dead = true;
            }
        }
        self.dead = dead;

        if !buf.is_empty() {
            self.outgoing.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shuttles outgoing datagrams from one side into the other, optionally
    /// dropping indexed packets. Returns the number delivered.
    fn transfer(from: &mut Kcp, to: &mut Kcp, drop_indices: &[usize]) -> usize {
        let mut delivered = 0;
        for (i, packet) in from.take_outgoing().into_iter().enumerate() {
            if drop_indices.contains(&i) {
                continue;
            }
            to.input(&packet).unwrap();
            delivered += 1;
        }
        delivered
    }

    fn pump(a: &mut Kcp, b: &mut Kcp, start: u32, ticks: u32) {
        for t in 0..ticks {
            let now = start + t * 10;
            a.update(now);
            b.update(now);
            transfer(a, b, &[]);
            transfer(b, a, &[]);
        }
    }

    #[test]
    fn delivers_single_message() {
        let mut a = Kcp::new(1);
        let mut b = Kcp::new(2);
        a.send(b"hello kcp").unwrap();
        pump(&mut a, &mut b, 0, 5);
        assert_eq!(b.recv(), Some(b"hello kcp".to_vec()));
        assert_eq!(b.recv(), None);
    }

    #[test]
    fn preserves_fifo_order() {
        let mut a = Kcp::new(1);
        let mut b = Kcp::new(2);
        for i in 0..20u8 {
            a.send(&[i]).unwrap();
        }
        pump(&mut a, &mut b, 0, 10);
        for i in 0..20u8 {
            assert_eq!(b.recv(), Some(vec![i]));
        }
    }

    #[test]
    fn fragments_and_reassembles_large_message() {
        let mut a = Kcp::new(1);
        let mut b = Kcp::new(2);
        let message: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        a.send(&message).unwrap();
        pump(&mut a, &mut b, 0, 20);
        assert_eq!(b.recv(), Some(message));
    }

    #[test]
    fn rejects_unfragmentable_message() {
        let mut a = Kcp::new(1);
        let too_big = vec![0u8; (KCP_MTU - KCP_OVERHEAD) * 256];
        assert!(matches!(
            a.send(&too_big),
            Err(BastionError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn retransmits_after_loss() {
        let mut a = Kcp::new(1);
        let mut b = Kcp::new(2);
        a.send(b"will be dropped once").unwrap();
        a.update(0);
        // Drop the first transmission entirely.
        let lost = a.take_outgoing();
        assert!(!lost.is_empty());
        // Drive time forward past the RTO so the segment retransmits.
        pump(&mut a, &mut b, 10, 60);
        assert_eq!(b.recv(), Some(b"will be dropped once".to_vec()));
    }

    #[test]
    fn out_of_order_input_reorders() {
        let mut a = Kcp::new(1);
        let mut b = Kcp::new(2);
        a.send(b"first").unwrap();
        a.update(0);
        let first = a.take_outgoing();
        a.send(b"second").unwrap();
        a.update(10);
        let second = a.take_outgoing();
        // Deliver in reverse order.
        for packet in second.iter().chain(first.iter()) {
            b.input(packet).unwrap();
        }
        assert_eq!(b.recv(), Some(b"first".to_vec()));
        assert_eq!(b.recv(), Some(b"second".to_vec()));
    }

    #[test]
    fn duplicate_input_ignored() {
        let mut a = Kcp::new(1);
        let mut b = Kcp::new(2);
        a.send(b"once").unwrap();
        a.update(0);
        let packets = a.take_outgoing();
        for packet in &packets {
            b.input(packet).unwrap();
            b.input(packet).unwrap();
        }
        assert_eq!(b.recv(), Some(b"once".to_vec()));
        assert_eq!(b.recv(), None);
    }

    #[test]
    fn malformed_input_rejected() {
        let mut a = Kcp::new(1);
        assert!(a.input(&[0u8; 5]).is_err());
        let mut bad = vec![0u8; KCP_OVERHEAD];
        bad[4] = 99; // unknown command
        assert!(a.input(&bad).is_err());
    }

    #[test]
    fn truncated_body_rejected() {
        let mut a = Kcp::new(1);
        let mut packet = vec![0u8; KCP_OVERHEAD];
        packet[4] = CMD_PUSH;
        packet[20] = 50; // declares 50 body bytes that are not there
        assert!(a.input(&packet).is_err());
    }

    #[test]
    fn check_skips_idle_channel() {
        let mut a = Kcp::new(1);
        a.update(100);
        let next = a.check(105);
        assert!(next > 105, "idle channel should not be due immediately");
    }

    #[test]
    fn check_reports_due_when_pending() {
        let mut a = Kcp::new(1);
        a.update(0);
        a.send(b"pending").unwrap();
        assert_eq!(a.check(20), 20);
    }

    #[test]
    fn dead_link_after_persistent_loss() {
        let mut a = Kcp::new(1);
        a.send(b"into the void").unwrap();
        let mut now = 0u32;
        for _ in 0..2000 {
            a.update(now);
            a.take_outgoing(); // peer never answers
            now += 100;
            if a.is_dead_link() {
                break;
            }
        }
        assert!(a.is_dead_link());
    }

    #[test]
    fn empty_message_roundtrips() {
        let mut a = Kcp::new(1);
        let mut b = Kcp::new(2);
        a.send(b"").unwrap();
        pump(&mut a, &mut b, 0, 5);
        assert_eq!(b.recv(), Some(Vec::new()));
    }
}
