//! The protocol engine: eager/rendezvous selection, request matching, and
//! the continuation table that replaces the callback chains such protocols
//! are usually written with.
//!
//! The engine is purely reactive. Issuing operations (`isend`, `irecv`)
//! and delivering completions (`handle_event`) are the only entry points;
//! both run to completion without blocking. Anything asynchronous (memory
//! registration, copy latency, envelope acceptance, a one-sided read, a
//! readiness wakeup) is represented by a token whose continuation is kept
//! in a table until the host delivers the matching [`Event`].

mod dispatch;
mod progress;

pub use progress::{Completion, Progress};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::config::CourierConfig;
use crate::error::{CourierError, Result};
use crate::ledger::RequestLedger;
use crate::pool::{LandingLedger, ScratchBuf, ScratchPool};
use crate::protocol::{Envelope, EnvelopeKind, ENVELOPE_SIZE};
use crate::request::{
    RecvRequest, RecvState, Request, RequestArena, RequestId, SendRequest, SendState,
};
use crate::transport::{Clock, LandingId, OpToken, TimerToken, Transport, TransportEvent};
use crate::types::{CommId, DataType, QueueId, Rank, SourceMatch, Tag, TagMatch};

/// Receive queue id used by every engine instance. Peers address each
/// other's queues by convention, so all engines share one id.
pub const ENGINE_QUEUE: QueueId = 0xF00D;

/// A completion or timer firing delivered to the engine by its host.
#[derive(Debug, Clone)]
pub enum Event {
    Transport(TransportEvent),
    Timer(TimerToken),
}

/// Continuation for an in-flight transport operation.
enum OpCont {
    /// Queue creation finished: post all landing buffers, become ready.
    QueueCreated,
    /// Registration for a rendezvous send finished.
    SendRegistered { req: RequestId },
    /// An envelope (eager payload or rendezvous Match) was handed to the
    /// transport. The scratch buffer returns to the pool when this fires.
    EnvelopeSent { req: RequestId, scratch: ScratchBuf },
    /// An Ack was handed to the transport; the landing buffer that held
    /// the rendezvous Match can then be reposted.
    AckSent { landing: LandingId, scratch: ScratchBuf },
    /// A one-sided read for a matched rendezvous receive is in flight.
    ReadPending {
        req: RequestId,
        landing: LandingId,
        envelope: Envelope,
        peer: Rank,
    },
    /// Blocking-progress wakeup: dispatch one message, then re-arm unless
    /// the tracked request has completed.
    WaitReady { target: RequestId },
}

/// Continuation for an armed copy-latency timer.
enum TimerCont {
    /// Eager send: payload staged in scratch, copy latency elapsed, hand
    /// the envelope to the transport.
    SendCopyDone { req: RequestId, scratch: ScratchBuf },
    /// Eager receive: payload already in the destination buffer, copy
    /// latency elapsed, complete and repost the landing buffer.
    RecvCopyDone { req: RequestId, landing: LandingId },
}

/// A point-to-point protocol engine bound to one transport queue.
pub struct Engine<T: Transport, C: Clock> {
    cfg: CourierConfig,
    transport: T,
    clock: C,
    my_rank: Rank,
    world_size: u32,
    ready: bool,
    arena: RequestArena,
    ledger: RequestLedger,
    landing: LandingLedger,
    scratch: Arc<ScratchPool>,
    ops: HashMap<OpToken, OpCont>,
    timers: HashMap<TimerToken, TimerCont>,
}

impl<T: Transport, C: Clock> Engine<T, C> {
    /// Build an engine. It accepts no requests until [`Engine::init`] has
    /// been called and the queue-ready completion has been delivered.
    pub fn new(
        cfg: CourierConfig,
        transport: T,
        clock: C,
        world_size: u32,
        my_rank: Rank,
    ) -> Result<Self> {
        cfg.validate()?;
        if my_rank >= world_size {
            return Err(CourierError::InvalidRank {
                rank: my_rank,
                world_size,
            });
        }
        let buf_capacity = ENVELOPE_SIZE + cfg.short_msg_length;
        let landing = LandingLedger::new(cfg.recv_buffer_count, buf_capacity);
        let scratch = ScratchPool::new(cfg.send_scratch_count, buf_capacity);
        Ok(Self {
            cfg,
            transport,
            clock,
            my_rank,
            world_size,
            ready: false,
            arena: RequestArena::new(),
            ledger: RequestLedger::new(),
            landing,
            scratch,
            ops: HashMap::new(),
            timers: HashMap::new(),
        })
    }

    /// Start initialization: create the receive queue. Landing buffers are
    /// posted when the queue-ready completion arrives.
    pub fn init(&mut self) -> Result<()> {
        let op = self.transport.create_queue(ENGINE_QUEUE)?;
        self.ops.insert(op, OpCont::QueueCreated);
        tracing::debug!(rank = self.my_rank, "engine init: creating receive queue");
        Ok(())
    }

    /// Whether initialization has completed.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn rank(&self) -> Rank {
        self.my_rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Requests issued but not yet reaped.
    pub fn outstanding(&self) -> usize {
        self.arena.len()
    }

    /// Depth of the unexpected-message queue.
    pub fn unexpected_messages(&self) -> usize {
        self.ledger.unexpected_len()
    }

    /// Issue a non-blocking send of `count` elements of `datatype`.
    ///
    /// `data` must hold exactly `count * size_in_bytes` bytes; it is shared
    /// with the engine (and, for rendezvous, the transport's registered
    /// region) until the request completes.
    pub fn isend(
        &mut self,
        data: Bytes,
        count: u32,
        datatype: DataType,
        dest: Rank,
        tag: Tag,
        comm: CommId,
    ) -> Result<RequestId> {
        if !self.ready {
            return Err(CourierError::NotReady);
        }
        if dest >= self.world_size {
            return Err(CourierError::InvalidRank {
                rank: dest,
                world_size: self.world_size,
            });
        }
        let expected = count as usize * datatype.size_in_bytes();
        if data.len() != expected {
            return Err(CourierError::CountMismatch {
                count,
                datatype,
                expected,
                actual: data.len(),
            });
        }

        let long = expected > self.cfg.short_msg_length;
        let state = if long {
            SendState::Registering
        } else {
            SendState::Queued
        };
        let payload = data.clone();
        let id = self.arena.insert(Request::Send(SendRequest {
            dest,
            tag,
            comm,
            datatype,
            count,
            data,
            state,
            read_addr: None,
        }));
        self.ledger.post_send(id);
        tracing::trace!(
            rank = self.my_rank,
            %id, dest, tag, comm, bytes = expected, long,
            "isend posted"
        );

        if long {
            let op = self.transport.register_memory(payload)?;
            self.ops.insert(op, OpCont::SendRegistered { req: id });
        }

        self.poll()?;
        self.pump_sends()?;
        Ok(id)
    }

    /// Issue a non-blocking receive into `dest_buf`.
    ///
    /// `dest_buf` must hold exactly `count * size_in_bytes` bytes; it is
    /// owned by the engine until the request is reaped, when it comes back
    /// filled inside [`Completion::Recv`].
    pub fn irecv(
        &mut self,
        dest_buf: BytesMut,
        count: u32,
        datatype: DataType,
        source: SourceMatch,
        tag: TagMatch,
        comm: CommId,
    ) -> Result<RequestId> {
        if !self.ready {
            return Err(CourierError::NotReady);
        }
        let expected = count as usize * datatype.size_in_bytes();
        if dest_buf.len() != expected {
            return Err(CourierError::CountMismatch {
                count,
                datatype,
                expected,
                actual: dest_buf.len(),
            });
        }

        let id = self.arena.insert(Request::Recv(RecvRequest {
            source,
            tag,
            comm,
            datatype,
            count,
            dest: Some(dest_buf),
            state: RecvState::Posted,
            status: None,
        }));
        tracing::trace!(
            rank = self.my_rank,
            %id, ?source, ?tag, comm, bytes = expected,
            "irecv posted"
        );

        if let Some(unexpected) = self.ledger.take_unexpected(source, tag, comm) {
            tracing::debug!(
                rank = self.my_rank,
                %id, source = unexpected.envelope.source_rank,
                "receive matched an unexpected arrival"
            );
            self.process_match(
                id,
                unexpected.envelope,
                unexpected.payload,
                unexpected.peer,
                unexpected.landing,
            )?;
        } else {
            self.ledger.post_recv(id, source, tag, comm);
        }

        self.poll()?;
        self.pump_sends()?;
        Ok(id)
    }

    /// Advance the posted-send queue. Sends are strictly FIFO: the head is
    /// carried through its whole protocol (including a rendezvous Ack wait)
    /// before the next send starts, which preserves non-overtaking.
    fn pump_sends(&mut self) -> Result<()> {
        loop {
            let Some(head) = self.ledger.head_send() else {
                return Ok(());
            };
            let send = self.arena.send_mut(head)?;
            match send.state {
                SendState::Done => {
                    // Retire and look at the next send.
                    self.ledger.pop_head_send();
                    continue;
                }
                SendState::Registering
                | SendState::Copying
                | SendState::Sending
                | SendState::AwaitingAck => return Ok(()),
                SendState::Queued => {}
            }

            let bytes = send.payload_len();
            if bytes <= self.cfg.short_msg_length {
                // Eager: stage envelope + payload in scratch now, hand to
                // the transport once the copy latency has elapsed.
                let envelope = Envelope {
                    kind: EnvelopeKind::Match,
                    source_rank: self.my_rank,
                    tag: send.tag,
                    count: send.count,
                    datatype: send.datatype,
                    comm: send.comm,
                    read_addr: None,
                    key: None,
                };
                let mut scratch = self.scratch.checkout(ENVELOPE_SIZE + bytes)?;
                scratch[..ENVELOPE_SIZE].copy_from_slice(&envelope.encode());
                scratch[ENVELOPE_SIZE..].copy_from_slice(&send.data);
                send.state = SendState::Copying;
                let timer = self.clock.schedule_after(self.cfg.copy_latency(bytes));
                self.timers
                    .insert(timer, TimerCont::SendCopyDone { req: head, scratch });
                tracing::trace!(rank = self.my_rank, %head, bytes, "eager send staged");
            } else {
                // Rendezvous: advertise the registered address and our
                // completion key; payload moves when the peer reads it.
                let Some(addr) = send.read_addr else {
                    return Err(CourierError::Transport(
                        "rendezvous send reached the queue head without a registered region"
                            .into(),
                    ));
                };
                let envelope = Envelope {
                    kind: EnvelopeKind::Match,
                    source_rank: self.my_rank,
                    tag: send.tag,
                    count: send.count,
                    datatype: send.datatype,
                    comm: send.comm,
                    read_addr: Some(addr),
                    key: Some(head),
                };
                let dest = send.dest;
                let mut scratch = self.scratch.checkout(ENVELOPE_SIZE)?;
                scratch.copy_from_slice(&envelope.encode());
                send.state = SendState::Sending;
                let op = self.transport.send_envelope(dest, ENGINE_QUEUE, &scratch)?;
                self.ops
                    .insert(op, OpCont::EnvelopeSent { req: head, scratch });
                tracing::trace!(rank = self.my_rank, %head, bytes, addr, "rendezvous match sent");
            }
            return Ok(());
        }
    }

    /// Repost a landing buffer after its message has been fully processed.
    fn repost_landing(&mut self, landing: LandingId) -> Result<()> {
        self.transport
            .post_receive(ENGINE_QUEUE, landing, self.landing.buffer_capacity())?;
        self.landing.mark_posted(landing);
        Ok(())
    }

    /// Arm the transport's blocking readiness wait on behalf of `target`.
    /// The wait re-arms after every dispatched message until `target`
    /// completes.
    fn arm_wait(&mut self, target: RequestId) -> Result<()> {
        let op = self.transport.wait_receive_ready(ENGINE_QUEUE)?;
        self.ops.insert(op, OpCont::WaitReady { target });
        Ok(())
    }
}
