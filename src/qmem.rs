//! Query memory
//!
//! Per-user ring of recently-seen DNS queries. In lazy mode incoming `P`
//! and data queries are parked here and answered when the server has
//! something to say or their DNS timeout is about to expire. The ring also
//! doubles as duplicate evidence: answered queries stay in it until
//! overwritten, so a retransmitted `(id, type, name)` triple is caught and
//! answered with the one-byte illegal reply instead of corrupting state.

use std::time::Instant;

use crate::dns_wire::DnsQuery;

/// Ring capacity; must be at least the largest downstream window.
pub const QMEM_LEN: usize = 16;

/// A query parked for deferred answering.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub query: DnsQuery,
    pub received: Instant,
}

/// Outcome of [`QueryMemory::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Parked; answer it via the deferral scan
    Queued,
    /// Same `(id, type, name)` already stored; send the illegal answer
    Duplicate,
    /// Ring has `QMEM_LEN` unanswered queries; drop silently
    Refused,
}

/// Ring of `QMEM_LEN` queries with three cursors. Stored entries occupy
/// `[start, end)`; the pending (unanswered) ones are the contiguous tail
/// `[start_pending, end)`.
#[derive(Debug)]
pub struct QueryMemory {
    entries: Vec<Option<PendingQuery>>,
    start: usize,
    start_pending: usize,
    end: usize,
    length: usize,
    num_pending: usize,
}

impl Default for QueryMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryMemory {
    pub fn new() -> Self {
        Self {
            entries: (0..QMEM_LEN).map(|_| None).collect(),
            start: 0,
            start_pending: 0,
            end: 0,
            length: 0,
            num_pending: 0,
        }
    }

    pub fn num_pending(&self) -> usize {
        self.num_pending
    }

    pub fn append(&mut self, query: DnsQuery, received: Instant) -> AppendResult {
        for i in 0..self.length {
            let idx = (self.start + i) % QMEM_LEN;
            if let Some(stored) = &self.entries[idx] {
                if stored.query.id == query.id
                    && stored.query.qtype == query.qtype
                    && stored.query.qname == query.qname
                {
                    return AppendResult::Duplicate;
                }
            }
        }

        if self.num_pending == QMEM_LEN {
            return AppendResult::Refused;
        }

        if self.length == QMEM_LEN {
            // ring full of answered history; oldest answered entry makes room
            self.entries[self.start] = None;
            self.start = (self.start + 1) % QMEM_LEN;
            self.length -= 1;
        }

        self.entries[self.end] = Some(PendingQuery { query, received });
        self.end = (self.end + 1) % QMEM_LEN;
        self.length += 1;
        self.num_pending += 1;
        AppendResult::Queued
    }

    /// The oldest pending query, not consumed.
    pub fn next_response(&self) -> Option<&PendingQuery> {
        if self.num_pending == 0 {
            return None;
        }
        self.entries[self.start_pending].as_ref()
    }

    /// Mark the oldest pending query answered. Called exactly once per
    /// downstream response sent for this user.
    pub fn answered(&mut self) {
        if self.num_pending == 0 {
            log::warn!("answered() with no pending query");
            return;
        }
        self.start_pending = (self.start_pending + 1) % QMEM_LEN;
        self.num_pending -= 1;
    }

    /// Receipt time of the oldest pending query.
    pub fn oldest_pending_received(&self) -> Option<Instant> {
        self.next_response().map(|p| p.received)
    }

    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
        self.start = 0;
        self.start_pending = 0;
        self.end = 0;
        self.length = 0;
        self.num_pending = 0;
    }
}
