//! Request ledger: posted-send, posted-receive, and unexpected-message
//! queues, plus the three-way matching rule.
//!
//! All queues are FIFO and scanned front-to-back; the first structural
//! match wins. That preserves non-overtaking among requests that could
//! match the same envelope, which is all the ordering this protocol
//! guarantees.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::protocol::Envelope;
use crate::request::RequestId;
use crate::transport::LandingId;
use crate::types::{CommId, Rank, SourceMatch, TagMatch};

/// A posted receive, with its match keys cached so scanning the queue does
/// not re-borrow the request arena.
#[derive(Debug, Clone, Copy)]
struct PostedRecv {
    id: RequestId,
    source: SourceMatch,
    tag: TagMatch,
    comm: CommId,
}

/// A Match envelope that arrived before any receive was posted for it.
///
/// Holds the landing buffer it occupies; the buffer is reposted only after
/// a later receive consumes this record, so the landing pool is the
/// operational bound on unexpected data in flight.
#[derive(Debug)]
pub struct UnexpectedMessage {
    pub envelope: Envelope,
    /// Node the message physically came from (Ack and read targets).
    pub peer: Rank,
    /// Eager payload; empty for a rendezvous Match.
    pub payload: Bytes,
    pub landing: LandingId,
}

/// The three queues of one protocol engine.
#[derive(Debug, Default)]
pub struct RequestLedger {
    posted_sends: VecDeque<RequestId>,
    posted_recvs: VecDeque<PostedRecv>,
    unexpected: VecDeque<UnexpectedMessage>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the posted-send queue. Sends are processed strictly from
    /// the head.
    pub fn post_send(&mut self, id: RequestId) {
        self.posted_sends.push_back(id);
    }

    pub fn head_send(&self) -> Option<RequestId> {
        self.posted_sends.front().copied()
    }

    pub fn pop_head_send(&mut self) -> Option<RequestId> {
        self.posted_sends.pop_front()
    }

    pub fn pending_sends(&self) -> usize {
        self.posted_sends.len()
    }

    /// Append to the posted-receive queue.
    pub fn post_recv(&mut self, id: RequestId, source: SourceMatch, tag: TagMatch, comm: CommId) {
        self.posted_recvs.push_back(PostedRecv {
            id,
            source,
            tag,
            comm,
        });
    }

    pub fn pending_recvs(&self) -> usize {
        self.posted_recvs.len()
    }

    /// Find, remove, and return the first posted receive matching an
    /// incoming envelope: communicator exact, tag exact-or-any, source
    /// exact-or-any. `None` means the arrival is unexpected.
    pub fn take_posted_recv(&mut self, envelope: &Envelope) -> Option<RequestId> {
        let pos = self.posted_recvs.iter().position(|r| {
            r.comm == envelope.comm
                && r.tag.accepts(envelope.tag)
                && r.source.accepts(envelope.source_rank)
        })?;
        self.posted_recvs.remove(pos).map(|r| r.id)
    }

    /// Find, remove, and return the first-arrived unexpected record a new
    /// receive matches. Same rule as [`take_posted_recv`] with the roles
    /// reversed.
    ///
    /// [`take_posted_recv`]: RequestLedger::take_posted_recv
    pub fn take_unexpected(
        &mut self,
        source: SourceMatch,
        tag: TagMatch,
        comm: CommId,
    ) -> Option<UnexpectedMessage> {
        let pos = self.unexpected.iter().position(|u| {
            u.envelope.comm == comm
                && tag.accepts(u.envelope.tag)
                && source.accepts(u.envelope.source_rank)
        })?;
        self.unexpected.remove(pos)
    }

    pub fn push_unexpected(&mut self, record: UnexpectedMessage) {
        self.unexpected.push_back(record);
    }

    pub fn unexpected_len(&self) -> usize {
        self.unexpected.len()
    }
}
