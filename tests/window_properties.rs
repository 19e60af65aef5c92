// Sliding-window invariants under hostile delivery schedules:
// reordering, duplication, and sequence wraparound.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use tundra::window::{WindowBuffer, WINDOW_BUFFER_LEN};

#[test]
fn window_roundtrip_survives_reorder_and_duplicates() {
    let mut rng = StdRng::seed_from_u64(0x7d5_0001);

    for case in 0..64 {
        let len = rng.gen_range(1..2000usize);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let compressed = rng.gen_bool(0.5);

        // keep the fragment count inside one ring
        let min_frag = len.div_ceil(WINDOW_BUFFER_LEN).max(1);
        let max_frag_len = rng.gen_range(min_frag..min_frag + 200);

        let start_seq: u8 = rng.gen();
        let mut sender = WindowBuffer::new_at(WINDOW_BUFFER_LEN as u8, max_frag_len, start_seq);
        let mut receiver = WindowBuffer::new_at(WINDOW_BUFFER_LEN as u8, max_frag_len, start_seq);

        let n = sender.add_outgoing_data(&data, compressed).unwrap();
        assert_eq!(n, len.div_ceil(max_frag_len));

        let now = Instant::now();
        let mut ack = -1i16;
        let mut frags = Vec::with_capacity(n);
        for _ in 0..n {
            frags.push(
                sender
                    .next_sending_fragment(now, &mut ack)
                    .expect("fresh fragment is always sendable")
                    .clone(),
            );
        }

        // hostile schedule: shuffle, then duplicate a random subset
        let mut schedule = frags.clone();
        let dups = rng.gen_range(0..=frags.len());
        for _ in 0..dups {
            schedule.push(frags[rng.gen_range(0..frags.len())].clone());
        }
        schedule.shuffle(&mut rng);

        for frag in schedule {
            receiver.process_incoming_fragment(frag);
        }

        let (packet, got_compressed) = receiver
            .reassemble()
            .unwrap_or_else(|| panic!("case {}: no reassembly after full delivery", case));
        assert_eq!(packet, data, "case {}: payload mismatch", case);
        assert_eq!(got_compressed, compressed, "case {}: compressed flag lost", case);
        assert!(receiver.reassemble().is_none());
    }
}

#[test]
fn cumulative_ack_is_monotonic_and_counts_new_contiguous() {
    let mut rng = StdRng::seed_from_u64(0x7d5_0002);

    for _ in 0..64 {
        let nfrags = rng.gen_range(1..=WINDOW_BUFFER_LEN);
        let start_seq: u8 = rng.gen();

        let mut receiver = WindowBuffer::new_at(WINDOW_BUFFER_LEN as u8, 8, start_seq);

        let mut order: Vec<usize> = (0..nfrags).collect();
        order.shuffle(&mut rng);

        let mut received = vec![false; nfrags];
        let mut prev_contig = 0usize;

        for &idx in &order {
            let seq = start_seq.wrapping_add(idx as u8);
            let frag = tundra::Fragment::new(
                seq,
                vec![idx as u8],
                idx == 0,
                idx == nfrags - 1,
                false,
            );
            let ack = receiver.process_incoming_fragment(frag);

            received[idx] = true;
            let contig = received.iter().take_while(|&&r| r).count();

            // the returned ack names exactly the last contiguous fragment
            let expected = start_seq.wrapping_add(contig as u8).wrapping_sub(1);
            assert_eq!(ack, expected);

            // monotonic: advances by exactly the newly-contiguous count
            assert!(contig >= prev_contig);
            prev_contig = contig;
        }
        assert_eq!(prev_contig, nfrags);
    }
}

#[test]
fn retransmission_preserves_sequence_ids() {
    let mut sender = WindowBuffer::new(8, 10);
    sender.add_outgoing_data(&[9u8; 25], false).unwrap();

    let now = Instant::now();
    let mut ack = -1i16;
    let first: Vec<u8> = (0..3)
        .map(|_| sender.next_sending_fragment(now, &mut ack).unwrap().seq_id)
        .collect();
    assert_eq!(first, vec![0, 1, 2]);

    // force everything overdue: the oldest goes again under its old id
    sender.retransmit_interval = std::time::Duration::ZERO;
    let resent = sender.next_sending_fragment(now, &mut ack).unwrap();
    assert_eq!(resent.seq_id, 0);
    assert_eq!(resent.retries, 1);
}
