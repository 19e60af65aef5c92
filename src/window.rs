//! Sliding-window fragmentation layer
//!
//! One `WindowBuffer` per direction per user. Outgoing packets are split
//! into fragments of at most `max_frag_len` bytes and retransmitted until
//! cumulatively acknowledged; incoming fragments are reordered by an 8-bit
//! sequence number and reassembled once a contiguous start..end run sits at
//! the head of the window.
//!
//! Sequence arithmetic is mod 256 with a signed comparator centered on
//! `start_seq_id`; all of it goes through the helpers below.

use std::time::{Duration, Instant};

use crate::{Result, TunnelError};

/// Ring capacity per direction. Must cover the largest negotiable window.
pub const WINDOW_BUFFER_LEN: usize = 64;

/// Default in-flight window until the client negotiates its own.
pub const DEFAULT_WINDOW_SIZE: u8 = 8;

/// Fragments resent no sooner than this after their last transmission.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(1000);

/// Wrapping distance from `b` to `a` on the 8-bit sequence circle.
pub fn seq_distance(a: u8, b: u8) -> u8 {
    a.wrapping_sub(b)
}

/// Signed "a is before b" on the circle, window centered on the caller's base.
pub fn seq_before(a: u8, b: u8) -> bool {
    (a.wrapping_sub(b) as i8) < 0
}

/// One unit of the sliding window.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub seq_id: u8,
    pub data: Vec<u8>,
    pub start: bool,
    pub end: bool,
    pub compressed: bool,
    /// Piggybacked cumulative ACK for the opposite direction; -1 = none
    pub ack_other: i16,
    pub acked: bool,
    pub last_sent: Option<Instant>,
    pub retries: u16,
}

impl Fragment {
    pub fn new(seq_id: u8, data: Vec<u8>, start: bool, end: bool, compressed: bool) -> Self {
        Self {
            seq_id,
            data,
            start,
            end,
            compressed,
            ack_other: -1,
            acked: false,
            last_sent: None,
            retries: 0,
        }
    }
}

/// Bounded ring of fragments for one direction.
#[derive(Debug)]
pub struct WindowBuffer {
    frags: Vec<Option<Fragment>>,
    /// Oldest live sequence id; everything before it is done
    pub start_seq_id: u8,
    /// Next sequence id handed to an outgoing fragment
    next_seq_id: u8,
    /// Negotiated in-flight window
    window_size: u8,
    /// Outgoing split size; derived from the user's fragsize and downenc
    pub max_frag_len: usize,
    pub retransmit_interval: Duration,
}

impl WindowBuffer {
    pub fn new(window_size: u8, max_frag_len: usize) -> Self {
        Self::new_at(window_size, max_frag_len, 0)
    }

    /// A buffer whose sequence numbering begins at `start_seq`.
    pub fn new_at(window_size: u8, max_frag_len: usize, start_seq: u8) -> Self {
        Self {
            frags: vec![None; WINDOW_BUFFER_LEN],
            start_seq_id: start_seq,
            next_seq_id: start_seq,
            window_size: window_size.clamp(1, WINDOW_BUFFER_LEN as u8),
            max_frag_len: max_frag_len.max(1),
            retransmit_interval: RETRANSMIT_INTERVAL,
        }
    }

    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    pub fn set_window_size(&mut self, size: u8) {
        self.window_size = size.clamp(1, WINDOW_BUFFER_LEN as u8);
    }

    /// Live fragments currently in the ring.
    pub fn len(&self) -> usize {
        self.frags.iter().filter(|f| f.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.frags.iter().all(|f| f.is_none())
    }

    fn slot(&self, seq: u8) -> usize {
        seq as usize % self.frags.len()
    }

    fn offset(&self, seq: u8) -> usize {
        seq_distance(seq, self.start_seq_id) as usize
    }

    // --- outgoing side ---

    /// Split `data` into fragments and queue them. The first fragment gets
    /// `start`, the last `end`; sequence ids are assigned monotonically mod
    /// 256. Fails without queuing anything if the ring cannot take the
    /// whole packet.
    pub fn add_outgoing_data(&mut self, data: &[u8], compressed: bool) -> Result<usize> {
        let nfrags = data.len().div_ceil(self.max_frag_len).max(1);
        let used = self.offset(self.next_seq_id);
        if used + nfrags > self.frags.len() {
            return Err(TunnelError::WindowFull);
        }

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(self.max_frag_len).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let seq = self.next_seq_id;
            self.next_seq_id = self.next_seq_id.wrapping_add(1);
            let slot = self.slot(seq);
            self.frags[slot] = Some(Fragment::new(
                seq,
                chunk.to_vec(),
                i == 0,
                i == last,
                compressed,
            ));
        }
        Ok(nfrags)
    }

    /// The oldest fragment inside the send window that was never sent or
    /// whose last transmission is older than the retransmit interval.
    /// Piggybacks and consumes `next_upstream_ack`.
    pub fn next_sending_fragment(
        &mut self,
        now: Instant,
        next_upstream_ack: &mut i16,
    ) -> Option<&Fragment> {
        let window = self.window_size as usize;
        let mut found = None;
        for off in 0..window {
            let seq = self.start_seq_id.wrapping_add(off as u8);
            let slot = self.slot(seq);
            if let Some(frag) = &self.frags[slot] {
                if frag.acked {
                    continue;
                }
                let due = match frag.last_sent {
                    None => true,
                    Some(sent) => now.duration_since(sent) >= self.retransmit_interval,
                };
                if due {
                    found = Some(slot);
                    break;
                }
            }
        }

        let slot = found?;
        let frag = self.frags[slot].as_mut().expect("slot checked above");
        frag.ack_other = *next_upstream_ack;
        *next_upstream_ack = -1;
        if frag.last_sent.is_some() {
            frag.retries += 1;
        }
        frag.last_sent = Some(now);
        self.frags[slot].as_ref()
    }

    /// Fragments that would be returned by `next_sending_fragment` right now.
    pub fn sending_count(&self, now: Instant) -> usize {
        (0..self.window_size as usize)
            .filter_map(|off| {
                let seq = self.start_seq_id.wrapping_add(off as u8);
                self.frags[self.slot(seq)].as_ref()
            })
            .filter(|frag| {
                !frag.acked
                    && match frag.last_sent {
                        None => true,
                        Some(sent) => now.duration_since(sent) >= self.retransmit_interval,
                    }
            })
            .count()
    }

    /// Cumulative acknowledgement: everything up to and including `seq`
    /// (mod 256, inside the window) is done. Slides `start_seq_id` past the
    /// acked prefix and frees those slots.
    pub fn ack(&mut self, seq: u8) {
        let acked_off = self.offset(seq);
        if acked_off >= self.frags.len() {
            return; // stale or insane ack
        }

        for off in 0..=acked_off {
            let s = self.start_seq_id.wrapping_add(off as u8);
            let slot = self.slot(s);
            if let Some(frag) = self.frags[slot].as_mut() {
                frag.acked = true;
            }
        }

        while let Some(frag) = &self.frags[self.slot(self.start_seq_id)] {
            if !frag.acked {
                break;
            }
            let slot = self.slot(self.start_seq_id);
            self.frags[slot] = None;
            self.start_seq_id = self.start_seq_id.wrapping_add(1);
        }
    }

    // --- incoming side ---

    /// Insert a received fragment. Duplicates of already-consumed sequence
    /// ids are dropped but still acknowledged. Returns the highest
    /// contiguous sequence id accepted so far — the cumulative ACK to echo
    /// back on the next outgoing fragment.
    pub fn process_incoming_fragment(&mut self, frag: Fragment) -> u8 {
        let off = self.offset(frag.seq_id);
        if off < self.frags.len() {
            let slot = self.slot(frag.seq_id);
            if self.frags[slot].is_none() {
                self.frags[slot] = Some(frag);
            }
        } else {
            log::debug!(
                "fragment {} outside window at {}, re-acking",
                frag.seq_id,
                self.start_seq_id
            );
        }
        self.highest_contiguous()
    }

    fn highest_contiguous(&self) -> u8 {
        let mut last = self.start_seq_id.wrapping_sub(1);
        for off in 0..self.frags.len() {
            let seq = self.start_seq_id.wrapping_add(off as u8);
            if self.frags[self.slot(seq)].is_some() {
                last = seq;
            } else {
                break;
            }
        }
        last
    }

    /// If a contiguous `start=1 .. end=1` run sits at the head of the
    /// window, copy it out, clear the slots, and advance. Reports the
    /// run's `compressed` flag.
    pub fn reassemble(&mut self) -> Option<(Vec<u8>, bool)> {
        let head = self.frags[self.slot(self.start_seq_id)].as_ref()?;
        if !head.start {
            return None;
        }
        let compressed = head.compressed;

        let mut end_off = None;
        for off in 0..self.frags.len() {
            let seq = self.start_seq_id.wrapping_add(off as u8);
            match &self.frags[self.slot(seq)] {
                Some(frag) if frag.end => {
                    end_off = Some(off);
                    break;
                }
                Some(_) => continue,
                None => return None, // gap before the end fragment
            }
        }
        let end_off = end_off?;

        let mut data = Vec::new();
        for off in 0..=end_off {
            let seq = self.start_seq_id.wrapping_add(off as u8);
            let slot = self.slot(seq);
            let frag = self.frags[slot].take().expect("run verified contiguous");
            data.extend_from_slice(&frag.data);
        }
        self.start_seq_id = self.start_seq_id.wrapping_add(end_off as u8 + 1);
        Some((data, compressed))
    }
}
