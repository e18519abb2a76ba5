//! Consumed contracts: the RDMA transport adapter and the simulation clock.
//!
//! Both collaborators are non-blocking. An operation call either takes
//! effect immediately (`post_receive`) or returns a token; the host later
//! delivers the matching [`TransportEvent`] or timer firing to
//! [`Engine::handle_event`]. The same engine code therefore runs against
//! the in-crate simulated network or any other host that honors these
//! traits.
//!
//! [`Engine::handle_event`]: crate::engine::Engine::handle_event

use bytes::Bytes;

use crate::error::Result;
use crate::types::{QueueId, Rank, SimTime};

/// Token naming one in-flight asynchronous transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpToken(pub u64);

/// Token naming one armed clock timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Index of a landing buffer in the receive pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LandingId(pub u32);

/// A message that has landed in a posted receive buffer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Node the message came from.
    pub peer: Rank,
    /// Landing buffer the message occupies. Must not be reposted until the
    /// message is fully processed.
    pub landing: LandingId,
    /// Envelope bytes followed by any eager payload.
    pub data: Bytes,
}

/// Completion of an asynchronous transport operation.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// `create_queue` finished; the queue accepts postings.
    QueueReady { op: OpToken },
    /// `register_memory` finished; the region is remote-readable at `addr`.
    Registered { op: OpToken, addr: u64 },
    /// `send_envelope` was accepted by the transport (handed off, not
    /// necessarily delivered).
    SendAccepted { op: OpToken },
    /// `rdma_read` finished; `data` holds the bytes read from the peer.
    ReadDone { op: OpToken, data: Bytes },
    /// A `wait_receive_ready` armed earlier fired: at least one message may
    /// be ready on the queue. Poll to claim it.
    ReceiveReady { op: OpToken },
}

/// One-sided RDMA transport, as seen by the protocol engine.
///
/// Failure of any operation is fatal to the engine; there is no
/// partial-failure model inside the simulated network.
pub trait Transport {
    /// Create a receive queue. Completes with [`TransportEvent::QueueReady`].
    fn create_queue(&mut self, queue: QueueId) -> Result<OpToken>;

    /// Register `data` for remote one-sided reads. Completes with
    /// [`TransportEvent::Registered`] carrying the advertised address. The
    /// engine keeps `data` alive and unmodified (it is a shared `Bytes`)
    /// until the owning request is done.
    fn register_memory(&mut self, data: Bytes) -> Result<OpToken>;

    /// Post a landing buffer to a queue. Accepted synchronously.
    fn post_receive(&mut self, queue: QueueId, landing: LandingId, capacity: usize) -> Result<()>;

    /// Claim one landed message, if any. Never blocks.
    fn poll_receive_ready(&mut self, queue: QueueId) -> Result<Option<Delivery>>;

    /// Arm a wakeup for the next landed message (the blocking flavor of the
    /// readiness check). Completes with [`TransportEvent::ReceiveReady`],
    /// immediately if a message is already waiting.
    fn wait_receive_ready(&mut self, queue: QueueId) -> Result<OpToken>;

    /// Send envelope (+ eager payload) bytes to `dest`'s queue. Completes
    /// with [`TransportEvent::SendAccepted`] once handed off; `data` must
    /// stay valid until then.
    fn send_envelope(&mut self, dest: Rank, queue: QueueId, data: &[u8]) -> Result<OpToken>;

    /// One-sided read of `len` bytes from a remote registered region.
    /// Completes with [`TransportEvent::ReadDone`].
    fn rdma_read(&mut self, peer: Rank, addr: u64, len: usize) -> Result<OpToken>;
}

/// The discrete-event clock hosting this engine.
pub trait Clock {
    /// Current virtual time.
    fn now(&self) -> SimTime;

    /// Arm a timer `delay` from now. The host delivers the firing as
    /// [`Event::Timer`].
    ///
    /// [`Event::Timer`]: crate::engine::Event::Timer
    fn schedule_after(&mut self, delay: SimTime) -> TimerToken;
}
