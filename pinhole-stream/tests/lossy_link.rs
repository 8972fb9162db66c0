//! End-to-end stream transfer over a simulated lossy datagram link: the
//! reliable ARQ must reconstruct the byte stream exactly even when a fixed
//! fraction of data packets never arrives.

use pinhole_stream::{Congestion, Reliable, StreamBuffer, RELIABLE_WINDOW};

/// Drive one direction of a link, dropping every `drop_nth` A->B data
/// packet, until `payload` fully crosses or the tick budget runs out.
fn transfer_with_loss(payload: &[u8], drop_nth: usize) -> Vec<u8> {
    let mut tx_stream = StreamBuffer::new(false);
    let mut rx_stream = StreamBuffer::new(false);
    let mut tx = Reliable::new();
    let mut rx = Reliable::new();
    let mut cc = Congestion::new();

    let mut received = Vec::new();
    let mut offered = 0usize;
    let mut datagram_count = 0usize;
    let mut now_ms = 0u64;

    for _ in 0..40_000 {
        now_ms += 10;

        if offered < payload.len() {
            offered += tx_stream.write(&payload[offered..]);
        }
        tx_stream.flush_to_reliable(&mut tx);

        // A -> B with loss.
        let mut wire = Vec::new();
        tx.tick_send(now_ms, cc.window_packets(), |seq, pkt| {
            datagram_count += 1;
            if datagram_count % drop_nth != 0 {
                wire.push((seq, pkt.to_vec()));
            }
        });
        for (seq, pkt) in wire {
            rx.on_data(seq, &pkt);
        }
        rx_stream.feed_from_reliable(&mut rx).unwrap();
        let mut buf = [0u8; 4096];
        loop {
            let n = rx_stream.read(&mut buf);
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        // B -> A acks arrive intact.
        if let Some((ack, sack)) = rx.build_ack() {
            let summary = tx.on_ack(ack, sack, now_ms);
            cc.on_ack(summary.newly_acked, summary.duplicate);
        }

        if received.len() == payload.len() && tx.send_count() == 0 {
            break;
        }
    }
    assert_eq!(tx.send_count(), 0, "sender window should drain");
    received
}

#[test]
fn hundred_kib_survives_one_in_three_loss() {
    let payload: Vec<u8> = (0..100 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();
    let received = transfer_with_loss(&payload, 3);
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}

#[test]
fn heavy_loss_still_converges() {
    let payload: Vec<u8> = (0..20 * 1024u32).map(|i| (i % 256) as u8).collect();
    let received = transfer_with_loss(&payload, 2);
    assert_eq!(received, payload);
}

#[test]
fn window_cap_is_respected_under_loss() {
    let mut tx = Reliable::new();
    for _ in 0..RELIABLE_WINDOW {
        tx.send_pkt(b"x").unwrap();
    }
    assert!(tx.send_pkt(b"x").is_err());
}
