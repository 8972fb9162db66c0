//! Sliding-window ARQ over unreliable datagrams.
//!
//! A 32-slot send window paired with a 32-slot receive window, cumulative
//! acks with a 31-bit selective-ack bitmap, and an RFC 6298 retransmission
//! timer. The layer is wire-agnostic: the orchestrator supplies transmit
//! callbacks and feeds received payloads back in, so the same instance
//! serves both the direct and the server-relayed path.

use tracing::trace;

use crate::errors::{Error, Result};

/// Number of in-flight packets either side tracks.
pub const RELIABLE_WINDOW: usize = 32;

const RTO_INITIAL_MS: u64 = 200;
const RTO_MIN_MS: u64 = 50;
const RTO_MAX_MS: u64 = 2000;

/// Circular difference of two 16-bit sequence numbers.
///
/// `seq_diff(a, b) > 0` means `a` is ahead of `b`; the result is exact for
/// distances within half the sequence space.
pub fn seq_diff(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

struct SendSlot {
    payload: Vec<u8>,
    seq: u16,
    /// 0 until the first transmission.
    send_time_ms: u64,
    retx_count: u32,
    sent: bool,
    acked: bool,
}

/// What an incoming ACK did to the send window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckSummary {
    /// Packets newly removed from the window (cumulative + selective).
    pub newly_acked: u32,
    /// True when the ack advanced nothing and repeated the previous ack
    /// number while data is still outstanding.
    pub duplicate: bool,
    /// RTT sample in ms, present when an un-retransmitted packet was
    /// cumulatively acked.
    pub rtt_sample_ms: Option<u64>,
}

/// What a tick transmitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub first_sends: u32,
    pub retransmits: u32,
}

/// Reliable ARQ state for one session.
pub struct Reliable {
    send_slots: Vec<Option<SendSlot>>,
    send_seq: u16,
    send_base: u16,
    send_count: usize,
    last_ack_seq: Option<u16>,

    recv_slots: Vec<Option<Vec<u8>>>,
    recv_base: u16,
    ack_pending: bool,

    srtt_ms: u64,
    rttvar_ms: u64,
    rto_ms: u64,
    has_rtt: bool,
}

impl Reliable {
    pub fn new() -> Self {
        Self {
            send_slots: (0..RELIABLE_WINDOW).map(|_| None).collect(),
            send_seq: 0,
            send_base: 0,
            send_count: 0,
            last_ack_seq: None,
            recv_slots: (0..RELIABLE_WINDOW).map(|_| None).collect(),
            recv_base: 0,
            ack_pending: false,
            srtt_ms: 0,
            rttvar_ms: 0,
            rto_ms: RTO_INITIAL_MS,
            has_rtt: false,
        }
    }

    /// Unacked packets currently in the send window.
    pub fn send_count(&self) -> usize {
        self.send_count
    }

    /// Free entries in the send window.
    pub fn window_free(&self) -> usize {
        let span = seq_diff(self.send_seq, self.send_base).max(0) as usize;
        RELIABLE_WINDOW - span.max(self.send_count)
    }

    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    pub fn srtt_ms(&self) -> Option<u64> {
        self.has_rtt.then_some(self.srtt_ms)
    }

    /// Queue a packet payload for (re)transmission. The first transmission
    /// happens on the next tick.
    pub fn send_pkt(&mut self, payload: &[u8]) -> Result<u16> {
        if self.send_count >= RELIABLE_WINDOW
            || seq_diff(self.send_seq, self.send_base) as usize >= RELIABLE_WINDOW
        {
            return Err(Error::WindowFull);
        }
        let seq = self.send_seq;
        let idx = seq as usize % RELIABLE_WINDOW;
        self.send_slots[idx] = Some(SendSlot {
            payload: payload.to_vec(),
            seq,
            send_time_ms: 0,
            retx_count: 0,
            sent: false,
            acked: false,
        });
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_count += 1;
        Ok(seq)
    }

    /// Accept a received DATA payload. Returns true when the packet was
    /// stored or was a stale duplicate worth re-acking; sequence numbers
    /// ahead of the window are dropped silently.
    pub fn on_data(&mut self, seq: u16, payload: &[u8]) -> bool {
        let d = seq_diff(seq, self.recv_base);
        if d < 0 {
            // Already delivered; the ack that covered it may have been lost.
            self.ack_pending = true;
            return true;
        }
        if d as usize >= RELIABLE_WINDOW {
            trace!(seq, recv_base = self.recv_base, "drop out-of-window data");
            return false;
        }
        let idx = seq as usize % RELIABLE_WINDOW;
        if self.recv_slots[idx].is_none() {
            self.recv_slots[idx] = Some(payload.to_vec());
        }
        self.ack_pending = true;
        true
    }

    /// Process a cumulative + selective ack.
    ///
    /// `ack_seq` is the peer's next expected sequence; `sack_bits` bit i
    /// acknowledges `ack_seq + 1 + i`.
    pub fn on_ack(&mut self, ack_seq: u16, sack_bits: u32, now_ms: u64) -> AckSummary {
        let mut summary = AckSummary::default();

        while seq_diff(ack_seq, self.send_base) > 0 && seq_diff(self.send_base, self.send_seq) < 0 {
            let idx = self.send_base as usize % RELIABLE_WINDOW;
            if let Some(slot) = self.send_slots[idx].as_mut() {
                if slot.seq == self.send_base && !slot.acked {
                    slot.acked = true;
                    self.send_count -= 1;
                    summary.newly_acked += 1;
                    if slot.retx_count == 0 && slot.send_time_ms > 0 {
                        let rtt = now_ms.saturating_sub(slot.send_time_ms);
                        self.update_rtt(rtt);
                        summary.rtt_sample_ms = Some(rtt);
                    }
                }
            }
            self.send_slots[idx] = None;
            self.send_base = self.send_base.wrapping_add(1);
        }

        for i in 0..31u16 {
            if sack_bits & (1u32 << i) == 0 {
                continue;
            }
            let seq = ack_seq.wrapping_add(1 + i);
            if seq_diff(seq, self.send_base) < 0 || seq_diff(seq, self.send_seq) >= 0 {
                continue;
            }
            let idx = seq as usize % RELIABLE_WINDOW;
            if let Some(slot) = self.send_slots[idx].as_mut() {
                if slot.seq == seq && !slot.acked {
                    slot.acked = true;
                    self.send_count -= 1;
                    summary.newly_acked += 1;
                }
            }
        }

        summary.duplicate = summary.newly_acked == 0
            && self.last_ack_seq == Some(ack_seq)
            && self.send_count > 0;
        self.last_ack_seq = Some(ack_seq);
        summary
    }

    /// Transmit due packets. First transmissions are limited to the window
    /// prefix of `budget` packets (the congestion gate); retransmissions are
    /// governed by the RTO alone. `emit` receives `(seq, payload)`.
    pub fn tick_send(
        &mut self,
        now_ms: u64,
        budget: usize,
        mut emit: impl FnMut(u16, &[u8]),
    ) -> TickSummary {
        let mut summary = TickSummary::default();
        let span = seq_diff(self.send_seq, self.send_base).max(0) as usize;
        let mut rto_backoff = false;
        for off in 0..span {
            let seq = self.send_base.wrapping_add(off as u16);
            let idx = seq as usize % RELIABLE_WINDOW;
            let rto = self.rto_ms;
            let Some(slot) = self.send_slots[idx].as_mut() else {
                continue;
            };
            if slot.seq != seq || slot.acked {
                continue;
            }
            if !slot.sent {
                if off < budget {
                    emit(seq, &slot.payload);
                    slot.sent = true;
                    slot.send_time_ms = now_ms;
                    slot.retx_count = 0;
                    summary.first_sends += 1;
                }
            } else if now_ms.saturating_sub(slot.send_time_ms) >= rto {
                emit(seq, &slot.payload);
                slot.send_time_ms = now_ms;
                slot.retx_count += 1;
                summary.retransmits += 1;
                rto_backoff = true;
            }
        }
        if rto_backoff {
            self.rto_ms = (self.rto_ms * 2).min(RTO_MAX_MS);
        }
        summary
    }

    /// Build the `[ack_seq, sack_bits]` pair for an ACK packet, or `None`
    /// when there is nothing to acknowledge. Bit i covers
    /// `recv_base + 1 + i` for i in 0..31 so a wrapped ring slot is never
    /// reported stale.
    pub fn build_ack(&mut self) -> Option<(u16, u32)> {
        let any_buffered = self.recv_slots.iter().any(|s| s.is_some());
        if !self.ack_pending && !any_buffered {
            return None;
        }
        self.ack_pending = false;
        let mut sack = 0u32;
        for i in 0..31u16 {
            let seq = self.recv_base.wrapping_add(1 + i);
            let idx = seq as usize % RELIABLE_WINDOW;
            if self.recv_slots[idx].is_some() {
                sack |= 1 << i;
            }
        }
        Some((self.recv_base, sack))
    }

    /// Length of the next in-order payload, if one is buffered.
    pub fn in_order_len(&self) -> Option<usize> {
        self.recv_slots[self.recv_base as usize % RELIABLE_WINDOW]
            .as_ref()
            .map(|p| p.len())
    }

    /// Pop the next in-order payload, advancing the receive window. The
    /// advanced base is worth announcing, so the next ack is made pending.
    pub fn pop_in_order(&mut self) -> Option<Vec<u8>> {
        let idx = self.recv_base as usize % RELIABLE_WINDOW;
        let payload = self.recv_slots[idx].take()?;
        self.recv_base = self.recv_base.wrapping_add(1);
        self.ack_pending = true;
        Some(payload)
    }

    fn update_rtt(&mut self, rtt_ms: u64) {
        if !self.has_rtt {
            self.srtt_ms = rtt_ms;
            self.rttvar_ms = rtt_ms / 2;
            self.has_rtt = true;
        } else {
            let delta = self.srtt_ms.abs_diff(rtt_ms);
            self.rttvar_ms = (3 * self.rttvar_ms + delta) / 4;
            self.srtt_ms = (7 * self.srtt_ms + rtt_ms) / 8;
        }
        self.rto_ms = (self.srtt_ms + 4 * self.rttvar_ms).clamp(RTO_MIN_MS, RTO_MAX_MS);
    }
}

impl Default for Reliable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_window(r: &mut Reliable) {
        for i in 0..RELIABLE_WINDOW {
            r.send_pkt(&[i as u8]).unwrap();
        }
    }

    #[test]
    fn window_full_after_32() {
        let mut r = Reliable::new();
        fill_window(&mut r);
        assert_eq!(r.send_pkt(b"x"), Err(Error::WindowFull));
        assert_eq!(r.send_count(), 32);
    }

    #[test]
    fn first_send_waits_for_tick() {
        let mut r = Reliable::new();
        r.send_pkt(b"a").unwrap();
        let mut sent = Vec::new();
        let s = r.tick_send(1000, RELIABLE_WINDOW, |seq, p| sent.push((seq, p.to_vec())));
        assert_eq!(s.first_sends, 1);
        assert_eq!(sent, vec![(0, b"a".to_vec())]);
    }

    #[test]
    fn cumulative_ack_advances_base() {
        let mut r = Reliable::new();
        for _ in 0..4 {
            r.send_pkt(b"p").unwrap();
        }
        r.tick_send(1000, RELIABLE_WINDOW, |_, _| {});
        let s = r.on_ack(3, 0, 1050);
        assert_eq!(s.newly_acked, 3);
        assert_eq!(r.send_count(), 1);
        assert_eq!(s.rtt_sample_ms, Some(50));
    }

    #[test]
    fn ack_is_idempotent() {
        let mut r = Reliable::new();
        for _ in 0..8 {
            r.send_pkt(b"p").unwrap();
        }
        r.tick_send(0, RELIABLE_WINDOW, |_, _| {});
        r.on_ack(5, 0b11, 10);
        let count = r.send_count();
        let s = r.on_ack(5, 0b11, 20);
        assert_eq!(r.send_count(), count);
        assert_eq!(s.newly_acked, 0);
    }

    #[test]
    fn duplicate_ack_detection() {
        let mut r = Reliable::new();
        for _ in 0..4 {
            r.send_pkt(b"p").unwrap();
        }
        r.tick_send(0, RELIABLE_WINDOW, |_, _| {});
        assert!(!r.on_ack(2, 0, 10).duplicate);
        assert!(r.on_ack(2, 0, 20).duplicate);
        assert!(r.on_ack(2, 0, 30).duplicate);
    }

    #[test]
    fn sack_removes_holes() {
        let mut r = Reliable::new();
        for _ in 0..5 {
            r.send_pkt(b"p").unwrap();
        }
        r.tick_send(0, RELIABLE_WINDOW, |_, _| {});
        // Peer got 0 and 2..4 but not 1: ack_seq=1, bits for 2,3,4.
        let s = r.on_ack(1, 0b111 << 1, 10);
        assert_eq!(s.newly_acked, 4);
        assert_eq!(r.send_count(), 1);
    }

    #[test]
    fn retransmit_after_rto_with_backoff() {
        let mut r = Reliable::new();
        r.send_pkt(b"p").unwrap();
        r.tick_send(0, RELIABLE_WINDOW, |_, _| {});
        assert_eq!(r.rto_ms(), 200);

        let mut n = 0;
        let s = r.tick_send(199, RELIABLE_WINDOW, |_, _| n += 1);
        assert_eq!(s.retransmits, 0);

        let s = r.tick_send(200, RELIABLE_WINDOW, |_, _| n += 1);
        assert_eq!(s.retransmits, 1);
        assert_eq!(r.rto_ms(), 400);
        assert_eq!(n, 1);
    }

    #[test]
    fn budget_gates_first_sends_only() {
        let mut r = Reliable::new();
        for _ in 0..8 {
            r.send_pkt(b"p").unwrap();
        }
        let s = r.tick_send(0, 3, |_, _| {});
        assert_eq!(s.first_sends, 3);
        // The three in-flight packets still retransmit under a zero budget.
        let s = r.tick_send(500, 0, |_, _| {});
        assert_eq!(s.first_sends, 0);
        assert_eq!(s.retransmits, 3);
    }

    #[test]
    fn recv_in_order_and_ack_bitmap() {
        let mut r = Reliable::new();
        assert!(r.on_data(1, b"one"));
        assert!(r.on_data(0, b"zero"));
        let (ack, sack) = r.build_ack().unwrap();
        assert_eq!(ack, 0);
        assert_eq!(sack & 1, 1); // slot recv_base+1 filled

        assert_eq!(r.pop_in_order().unwrap(), b"zero");
        assert_eq!(r.pop_in_order().unwrap(), b"one");
        assert!(r.pop_in_order().is_none());
    }

    #[test]
    fn out_of_window_data_dropped() {
        let mut r = Reliable::new();
        assert!(!r.on_data(40, b"future"));
        assert!(r.build_ack().is_none());
        // Stale duplicate still triggers a re-ack.
        r.on_data(0, b"x");
        r.pop_in_order();
        r.build_ack();
        assert!(r.on_data(0, b"x"));
        assert!(r.build_ack().is_some());
    }

    #[test]
    fn duplicate_data_is_idempotent() {
        let mut r = Reliable::new();
        r.on_data(0, b"first");
        r.on_data(0, b"second");
        assert_eq!(r.pop_in_order().unwrap(), b"first");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn seq_diff_laws(a: u16) {
                prop_assert_eq!(seq_diff(a, a), 0);
                prop_assert_eq!(seq_diff(a.wrapping_add(1), a), 1);
                prop_assert_eq!(seq_diff(a, a.wrapping_add(1)), -1);
            }

            #[test]
            fn ack_twice_is_noop(ack in 0u16..64, sack in any::<u32>()) {
                let mut r = Reliable::new();
                for _ in 0..RELIABLE_WINDOW {
                    r.send_pkt(b"p").unwrap();
                }
                r.tick_send(0, RELIABLE_WINDOW, |_, _| {});
                r.on_ack(ack, sack, 10);
                let (base, count) = (r.send_base, r.send_count());
                r.on_ack(ack, sack, 20);
                prop_assert_eq!(r.send_base, base);
                prop_assert_eq!(r.send_count(), count);
            }
        }
    }
}
