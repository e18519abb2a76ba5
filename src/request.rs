//! Outstanding-request arena.
//!
//! Requests live in a slab; handles carry the slot index plus a generation
//! counter. The generation is bumped whenever a slot is vacated, so a stale
//! handle (including a completion key echoed back by a misbehaving peer)
//! is detected instead of reaching a recycled request.

use bytes::{Bytes, BytesMut};
use slab::Slab;

use crate::error::{CourierError, Result};
use crate::types::{CommId, DataType, Rank, SourceMatch, Tag, TagMatch};

/// Handle to an outstanding request.
///
/// Also serves as the wire completion key carried by rendezvous Match and
/// Ack envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl RequestId {
    pub(crate) fn from_wire(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> u32 {
        self.index
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req[{}.{}]", self.index, self.generation)
    }
}

/// Lifecycle of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Long message: waiting for memory registration to complete.
    Registering,
    /// In the posted-send queue, ready to be processed when it reaches the
    /// head.
    Queued,
    /// Eager: payload copy into scratch in progress (copy latency pending).
    Copying,
    /// Envelope handed to the transport, acceptance pending.
    Sending,
    /// Rendezvous: Match sent, waiting for the Ack bearing our key.
    AwaitingAck,
    /// Terminal. Never reused.
    Done,
}

/// Lifecycle of an incoming message request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Waiting for a matching envelope.
    Posted,
    /// Eager match: payload copy-out in progress (copy latency pending).
    Copying,
    /// Rendezvous match: one-sided read in flight.
    Reading,
    /// Terminal. Never reused.
    Done,
}

/// Delivery record filled in when a receive matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvStatus {
    /// Rank the message actually came from.
    pub source: Rank,
    /// Tag the message actually carried.
    pub tag: Tag,
    /// Element count the sender declared.
    pub count: u32,
}

/// One outgoing message.
#[derive(Debug)]
pub struct SendRequest {
    pub dest: Rank,
    pub tag: Tag,
    pub comm: CommId,
    pub datatype: DataType,
    pub count: u32,
    /// Source payload. Shared and immutable until the request is done,
    /// which is exactly the validity window the transport requires of
    /// registered memory.
    pub data: Bytes,
    pub state: SendState,
    /// Remote-readable address, once registration completes.
    pub read_addr: Option<u64>,
}

impl SendRequest {
    pub fn payload_len(&self) -> usize {
        self.count as usize * self.datatype.size_in_bytes()
    }

    pub fn is_done(&self) -> bool {
        self.state == SendState::Done
    }
}

/// One incoming message request.
#[derive(Debug)]
pub struct RecvRequest {
    pub source: SourceMatch,
    pub tag: TagMatch,
    pub comm: CommId,
    pub datatype: DataType,
    pub count: u32,
    /// Destination buffer, owned here while pending and returned at reap.
    pub dest: Option<BytesMut>,
    pub state: RecvState,
    pub status: Option<RecvStatus>,
}

impl RecvRequest {
    pub fn capacity(&self) -> usize {
        self.count as usize * self.datatype.size_in_bytes()
    }

    pub fn is_done(&self) -> bool {
        self.state == RecvState::Done
    }
}

/// Either kind of request, as stored in the arena.
#[derive(Debug)]
pub enum Request {
    Send(SendRequest),
    Recv(RecvRequest),
}

impl Request {
    pub fn is_done(&self) -> bool {
        match self {
            Request::Send(s) => s.is_done(),
            Request::Recv(r) => r.is_done(),
        }
    }
}

/// Slab-backed arena of outstanding requests with generation checking.
#[derive(Debug, Default)]
pub struct RequestArena {
    slots: Slab<Request>,
    generations: Vec<u32>,
}

impl RequestArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: Request) -> RequestId {
        let index = self.slots.insert(request);
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 0);
        }
        RequestId {
            index: index as u32,
            generation: self.generations[index],
        }
    }

    fn check(&self, id: RequestId) -> Result<usize> {
        let index = id.index as usize;
        let live = self.generations.get(index).copied().unwrap_or(0);
        if live != id.generation || !self.slots.contains(index) {
            return Err(CourierError::StaleRequest {
                index: id.index,
                live,
                held: id.generation,
            });
        }
        Ok(index)
    }

    pub fn get(&self, id: RequestId) -> Result<&Request> {
        let index = self.check(id)?;
        Ok(&self.slots[index])
    }

    pub fn get_mut(&mut self, id: RequestId) -> Result<&mut Request> {
        let index = self.check(id)?;
        Ok(&mut self.slots[index])
    }

    /// Access a send request, failing on stale handles or kind mismatch.
    pub fn send_mut(&mut self, id: RequestId) -> Result<&mut SendRequest> {
        match self.get_mut(id)? {
            Request::Send(s) => Ok(s),
            Request::Recv(_) => Err(CourierError::StaleRequest {
                index: id.index,
                live: id.generation,
                held: id.generation,
            }),
        }
    }

    /// Access a receive request, failing on stale handles or kind mismatch.
    pub fn recv_mut(&mut self, id: RequestId) -> Result<&mut RecvRequest> {
        match self.get_mut(id)? {
            Request::Recv(r) => Ok(r),
            Request::Send(_) => Err(CourierError::StaleRequest {
                index: id.index,
                live: id.generation,
                held: id.generation,
            }),
        }
    }

    /// Resolve an Ack's completion key to the rendezvous send it completes.
    ///
    /// A key whose generation does not match the live slot is refused; it
    /// names a request that no longer exists.
    pub fn resolve_key(&mut self, key: RequestId) -> Result<&mut SendRequest> {
        let index = self
            .check(key)
            .map_err(|_| CourierError::StaleCompletionKey {
                index: key.index,
                generation: key.generation,
            })?;
        match &mut self.slots[index] {
            Request::Send(s) => Ok(s),
            Request::Recv(_) => Err(CourierError::StaleCompletionKey {
                index: key.index,
                generation: key.generation,
            }),
        }
    }

    /// Remove a request, bumping the slot generation so the handle (and any
    /// completion key derived from it) can never resolve again.
    pub fn remove(&mut self, id: RequestId) -> Result<Request> {
        let index = self.check(id)?;
        let request = self.slots.remove(index);
        self.generations[index] = self.generations[index].wrapping_add(1);
        Ok(request)
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Mark a send done, refusing double completion.
pub(crate) fn complete_send(send: &mut SendRequest, index: u32) -> Result<()> {
    if send.state == SendState::Done {
        return Err(CourierError::DoubleCompletion { index });
    }
    send.state = SendState::Done;
    Ok(())
}

/// Mark a receive done, refusing double completion.
pub(crate) fn complete_recv(recv: &mut RecvRequest, index: u32) -> Result<()> {
    if recv.state == RecvState::Done {
        return Err(CourierError::DoubleCompletion { index });
    }
    recv.state = RecvState::Done;
    Ok(())
}
