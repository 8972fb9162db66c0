//! Byte-stream framer: slices the send ring into MTU-sized data packets
//! carrying a 5-byte `[stream_offset:u32be, frag_flags:u8]` sub-header and
//! reassembles the peer's fragments into the receive ring. Fragment flags
//! never leak to the application; a write of length L is read as one
//! contiguous L-byte run.

use bytes::{Buf, BufMut};
use tracing::warn;

use crate::errors::{Error, Result};
use crate::reliable::Reliable;
use crate::ring::ByteRing;

/// Largest stream payload per packet: MTU 1200 minus the 4-byte packet
/// header and the 5-byte fragment sub-header.
pub const STREAM_PAYLOAD: usize = 1191;

/// First slice of a flush burst.
pub const FRAG_FIRST: u8 = 0x01;
/// Slice that emptied the send ring.
pub const FRAG_LAST: u8 = 0x02;

const SUBHEADER_LEN: usize = 5;

/// Send and receive rings plus the fragment cursors for one session.
pub struct StreamBuffer {
    send_ring: ByteRing,
    recv_ring: ByteRing,
    /// Stream offset of the next byte to be framed.
    send_offset: u32,
    /// Expected stream offset of the next fragment.
    recv_offset: u32,
    nagle: bool,
}

impl StreamBuffer {
    pub fn new(nagle: bool) -> Self {
        Self {
            send_ring: ByteRing::new(),
            recv_ring: ByteRing::new(),
            send_offset: 0,
            recv_offset: 0,
            nagle,
        }
    }

    /// Queue application bytes, returning how many were accepted.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.send_ring.write(data)
    }

    /// Bytes queued but not yet framed.
    pub fn pending_bytes(&self) -> usize {
        self.send_ring.len()
    }

    /// Bytes available for `read`.
    pub fn readable_bytes(&self) -> usize {
        self.recv_ring.len()
    }

    /// Drain received bytes into `out`.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.recv_ring.read(out)
    }

    /// Pop up to `max` pending bytes without framing them. Used by
    /// transports that apply their own record layer (datagram security)
    /// instead of the fragment sub-header.
    pub fn take_pending(&mut self, max: usize) -> Vec<u8> {
        let n = self.send_ring.len().min(max);
        let mut out = vec![0u8; n];
        let got = self.send_ring.read(&mut out);
        out.truncate(got);
        self.send_offset = self.send_offset.wrapping_add(got as u32);
        out
    }

    /// Append already-deframed bytes to the receive ring, returning how
    /// many fit.
    pub fn deliver(&mut self, data: &[u8]) -> usize {
        self.recv_ring.write(data)
    }

    /// Slice pending bytes into data packets and hand them to the reliable
    /// layer while its window has room. Returns the number of packets
    /// framed. Under Nagle, a partial payload stays queued.
    pub fn flush_to_reliable(&mut self, reliable: &mut Reliable) -> usize {
        if self.nagle && self.send_ring.len() < STREAM_PAYLOAD {
            return 0;
        }
        let mut framed = 0;
        let mut first = true;
        let mut chunk = [0u8; STREAM_PAYLOAD];
        while reliable.window_free() > 0 && !self.send_ring.is_empty() {
            let take = self.send_ring.len().min(STREAM_PAYLOAD);
            if self.nagle && take < STREAM_PAYLOAD && !first {
                // Trailing partial slice waits for more data.
                break;
            }
            let n = self.send_ring.read(&mut chunk[..take]);
            let mut flags = 0u8;
            if first {
                flags |= FRAG_FIRST;
            }
            if self.send_ring.is_empty() {
                flags |= FRAG_LAST;
            }
            let mut pkt = Vec::with_capacity(SUBHEADER_LEN + n);
            pkt.put_u32(self.send_offset);
            pkt.put_u8(flags);
            pkt.extend_from_slice(&chunk[..n]);
            // Window room was checked above.
            if reliable.send_pkt(&pkt).is_err() {
                break;
            }
            self.send_offset = self.send_offset.wrapping_add(n as u32);
            framed += 1;
            first = false;
        }
        framed
    }

    /// Pull in-order packets out of the reliable layer, strip the fragment
    /// sub-header and append the payload to the receive ring. Stops when the
    /// ring cannot hold the next payload, leaving it buffered for
    /// backpressure.
    pub fn feed_from_reliable(&mut self, reliable: &mut Reliable) -> Result<usize> {
        let mut total = 0;
        while let Some(len) = reliable.in_order_len() {
            if len < SUBHEADER_LEN {
                reliable.pop_in_order();
                return Err(Error::TruncatedFragment(len));
            }
            if len - SUBHEADER_LEN > self.recv_ring.free() {
                break;
            }
            let pkt = match reliable.pop_in_order() {
                Some(p) => p,
                None => break,
            };
            let mut cursor = pkt.as_slice();
            let offset = cursor.get_u32();
            let _flags = cursor.get_u8();
            if offset != self.recv_offset {
                warn!(
                    expected = self.recv_offset,
                    got = offset,
                    "stream offset mismatch"
                );
            }
            self.recv_ring.write(cursor);
            self.recv_offset = offset.wrapping_add(cursor.len() as u32);
            total += cursor.len();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(a: &mut StreamBuffer, ra: &mut Reliable, b: &mut StreamBuffer, rb: &mut Reliable) {
        a.flush_to_reliable(ra);
        // Deliver every framed packet in order.
        let mut sent = Vec::new();
        ra.tick_send(0, 32, |seq, p| sent.push((seq, p.to_vec())));
        for (seq, p) in sent {
            rb.on_data(seq, &p);
        }
        if let Some((ack, sack)) = rb.build_ack() {
            ra.on_ack(ack, sack, 1);
        }
        b.feed_from_reliable(rb).unwrap();
    }

    #[test]
    fn small_write_roundtrip() {
        let mut a = StreamBuffer::new(false);
        let mut b = StreamBuffer::new(false);
        let (mut ra, mut rb) = (Reliable::new(), Reliable::new());

        assert_eq!(a.write(b"ping"), 4);
        pump(&mut a, &mut ra, &mut b, &mut rb);

        let mut out = [0u8; 16];
        assert_eq!(b.read(&mut out), 4);
        assert_eq!(&out[..4], b"ping");
    }

    #[test]
    fn large_write_is_fragmented_and_reassembled() {
        let mut a = StreamBuffer::new(false);
        let mut b = StreamBuffer::new(false);
        let (mut ra, mut rb) = (Reliable::new(), Reliable::new());

        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(a.write(&data), 4000);
        // 4000 bytes => 4 fragments.
        assert_eq!(a.flush_to_reliable(&mut ra), 4);

        let mut sent = Vec::new();
        ra.tick_send(0, 32, |seq, p| sent.push((seq, p.to_vec())));
        for (seq, p) in &sent {
            rb.on_data(*seq, p);
        }
        b.feed_from_reliable(&mut rb).unwrap();

        let mut out = vec![0u8; 4096];
        let n = b.read(&mut out);
        assert_eq!(&out[..n], &data[..]);
    }

    #[test]
    fn first_and_last_flags_mark_burst_bounds() {
        let mut a = StreamBuffer::new(false);
        let mut r = Reliable::new();
        a.write(&vec![7u8; STREAM_PAYLOAD * 2 + 10]);
        assert_eq!(a.flush_to_reliable(&mut r), 3);

        let mut flags = Vec::new();
        r.tick_send(0, 32, |_, p| flags.push(p[4]));
        assert_eq!(flags, vec![FRAG_FIRST, 0, FRAG_LAST]);
    }

    #[test]
    fn nagle_holds_partial_payload() {
        let mut a = StreamBuffer::new(true);
        let mut r = Reliable::new();
        a.write(b"tiny");
        assert_eq!(a.flush_to_reliable(&mut r), 0);
        assert_eq!(a.pending_bytes(), 4);

        a.write(&vec![0u8; STREAM_PAYLOAD]);
        assert!(a.flush_to_reliable(&mut r) >= 1);
    }

    #[test]
    fn truncated_fragment_is_an_error() {
        let mut b = StreamBuffer::new(false);
        let mut r = Reliable::new();
        r.on_data(0, b"abc");
        assert!(matches!(
            b.feed_from_reliable(&mut r),
            Err(Error::TruncatedFragment(3))
        ));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]
            #[test]
            fn writes_reassemble_byte_for_byte(
                chunks in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 1..3000),
                    1..8,
                )
            ) {
                let total: usize = chunks.iter().map(|c| c.len()).sum();
                prop_assume!(total <= 60_000);

                let mut a = StreamBuffer::new(false);
                let mut b = StreamBuffer::new(false);
                let (mut ra, mut rb) = (Reliable::new(), Reliable::new());

                let mut expected = Vec::new();
                let mut received = Vec::new();
                for chunk in &chunks {
                    prop_assert_eq!(a.write(chunk), chunk.len());
                    expected.extend_from_slice(chunk);
                    // Tick both ends until the chunk crosses.
                    for _ in 0..64 {
                        pump(&mut a, &mut ra, &mut b, &mut rb);
                        let mut out = [0u8; 2048];
                        loop {
                            let n = b.read(&mut out);
                            if n == 0 {
                                break;
                            }
                            received.extend_from_slice(&out[..n]);
                        }
                        if received.len() == expected.len() {
                            break;
                        }
                    }
                }
                prop_assert_eq!(received, expected);
            }
        }
    }
}
