//! DNS answer cache
//!
//! Impatient resolvers retransmit a query they consider lost; by then the
//! server may already have answered and advanced its window. This per-user
//! ring remembers the last few `(type, name)` pairs together with the exact
//! response datagram sent, so a retransmit gets the same bytes again
//! instead of silence. The client's CMC keeps distinct queries from ever
//! colliding here.

use crate::dns_wire::{DnsQuery, QueryType};

/// Ring capacity; at most half the CMC space of a data query.
pub const DNSCACHE_LEN: usize = 16;

#[derive(Debug, Clone)]
struct CacheEntry {
    qtype: QueryType,
    qname: Vec<u8>,
    answer: Vec<u8>,
}

/// Most-recent-first answer ring.
#[derive(Debug)]
pub struct AnswerCache {
    entries: Vec<Option<CacheEntry>>,
    last_filled: usize,
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AnswerCache {
    pub fn new() -> Self {
        Self {
            entries: (0..DNSCACHE_LEN).map(|_| None).collect(),
            last_filled: DNSCACHE_LEN - 1,
        }
    }

    /// Remember the datagram sent for `query`.
    pub fn save(&mut self, query: &DnsQuery, answer: Vec<u8>) {
        let slot = (self.last_filled + 1) % DNSCACHE_LEN;
        self.entries[slot] = Some(CacheEntry {
            qtype: query.qtype,
            qname: query.qname.clone(),
            answer,
        });
        self.last_filled = slot;
    }

    /// Find a previously-sent answer for `query`. A hit consumes the entry,
    /// so the immediately-following identical lookup misses and the query
    /// is treated as fresh.
    pub fn lookup(&mut self, query: &DnsQuery) -> Option<Vec<u8>> {
        for i in 0..DNSCACHE_LEN {
            let idx = (self.last_filled + DNSCACHE_LEN - i) % DNSCACHE_LEN;
            let hit = match &self.entries[idx] {
                Some(entry) => entry.qtype == query.qtype && entry.qname == query.qname,
                None => false,
            };
            if hit {
                return self.entries[idx].take().map(|entry| entry.answer);
            }
        }
        None
    }

    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
        self.last_filled = DNSCACHE_LEN - 1;
    }
}
