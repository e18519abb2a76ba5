//! Event dispatch: the transition handlers behind the continuation table.

use bytes::Bytes;

use crate::error::{CourierError, Result};
use crate::ledger::UnexpectedMessage;
use crate::protocol::{Envelope, EnvelopeKind, ENVELOPE_SIZE};
use crate::request::{complete_recv, complete_send, RecvState, RequestId, SendState};
use crate::transport::{Clock, Delivery, LandingId, Transport, TransportEvent};
use crate::types::Rank;

use super::{Engine, Event, OpCont, TimerCont, ENGINE_QUEUE};

impl<T: Transport, C: Clock> Engine<T, C> {
    /// Deliver one transport completion or timer firing.
    ///
    /// The host must route every event produced for this engine here,
    /// in the order the underlying operations completed.
    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Timer(token) => {
                let cont = self
                    .timers
                    .remove(&token)
                    .ok_or(CourierError::UnknownToken { token: token.0 })?;
                self.on_timer(cont)
            }
            Event::Transport(te) => self.on_transport(te),
        }
    }

    fn on_timer(&mut self, cont: TimerCont) -> Result<()> {
        match cont {
            TimerCont::SendCopyDone { req, scratch } => {
                // Copy latency elapsed: hand the staged envelope+payload off.
                let send = self.arena.send_mut(req)?;
                send.state = SendState::Sending;
                let dest = send.dest;
                let op = self.transport.send_envelope(dest, ENGINE_QUEUE, &scratch)?;
                self.ops.insert(op, OpCont::EnvelopeSent { req, scratch });
                Ok(())
            }
            TimerCont::RecvCopyDone { req, landing } => {
                let recv = self.arena.recv_mut(req)?;
                complete_recv(recv, req.index())?;
                tracing::debug!(rank = self.my_rank, %req, "eager receive complete");
                self.repost_landing(landing)?;
                Ok(())
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> Result<()> {
        let (op, payload) = match event {
            TransportEvent::QueueReady { op } => (op, None),
            TransportEvent::Registered { op, addr } => (op, Some(TransportPayload::Addr(addr))),
            TransportEvent::SendAccepted { op } => (op, None),
            TransportEvent::ReadDone { op, data } => (op, Some(TransportPayload::Data(data))),
            TransportEvent::ReceiveReady { op } => (op, None),
        };
        let cont = self
            .ops
            .remove(&op)
            .ok_or(CourierError::UnknownToken { token: op.0 })?;

        match (cont, payload) {
            (OpCont::QueueCreated, None) => {
                // Queue exists: post every landing buffer, then open for
                // business.
                for id in self.landing.ids().collect::<Vec<_>>() {
                    self.transport
                        .post_receive(ENGINE_QUEUE, id, self.landing.buffer_capacity())?;
                    self.landing.mark_posted(id);
                }
                self.ready = true;
                tracing::debug!(
                    rank = self.my_rank,
                    buffers = self.landing.count(),
                    "engine ready"
                );
                Ok(())
            }
            (OpCont::SendRegistered { req }, Some(TransportPayload::Addr(addr))) => {
                let send = self.arena.send_mut(req)?;
                send.read_addr = Some(addr);
                send.state = SendState::Queued;
                tracing::trace!(rank = self.my_rank, %req, addr, "send region registered");
                self.pump_sends()
            }
            (OpCont::EnvelopeSent { req, scratch }, None) => {
                drop(scratch); // back to the pool
                let threshold = self.cfg.short_msg_length;
                let send = self.arena.send_mut(req)?;
                if send.payload_len() <= threshold {
                    // Eager completion is hand-off, not delivery.
                    complete_send(send, req.index())?;
                    tracing::debug!(rank = self.my_rank, %req, "eager send complete");
                    self.pump_sends()
                } else {
                    // Rendezvous: hold the queue head and drive progress
                    // until the Ack bearing our key arrives.
                    send.state = SendState::AwaitingAck;
                    tracing::trace!(rank = self.my_rank, %req, "awaiting rendezvous ack");
                    self.arm_wait(req)
                }
            }
            (OpCont::AckSent { landing, scratch }, None) => {
                drop(scratch);
                self.repost_landing(landing)
            }
            (
                OpCont::ReadPending {
                    req,
                    landing,
                    envelope,
                    peer,
                },
                Some(TransportPayload::Data(data)),
            ) => self.on_read_done(req, landing, envelope, peer, data),
            (OpCont::WaitReady { target }, None) => {
                if let Some(delivery) = self.transport.poll_receive_ready(ENGINE_QUEUE)? {
                    self.dispatch_delivery(delivery)?;
                }
                self.pump_sends()?;
                // Re-arm unless the tracked request finished (or was
                // already reaped).
                let done = self
                    .arena
                    .get(target)
                    .map(|r| r.is_done())
                    .unwrap_or(true);
                if done {
                    Ok(())
                } else {
                    self.arm_wait(target)
                }
            }
            (_, _) => Err(CourierError::Transport(
                "transport completion did not match its continuation".into(),
            )),
        }
    }

    /// Rendezvous read finished: fill the destination, complete the
    /// receive, and send exactly one Ack echoing the sender's key.
    fn on_read_done(
        &mut self,
        req: RequestId,
        landing: LandingId,
        envelope: Envelope,
        peer: Rank,
        data: Bytes,
    ) -> Result<()> {
        let recv = self.arena.recv_mut(req)?;
        let dest = recv
            .dest
            .as_mut()
            .ok_or_else(|| CourierError::Transport("read completed after reap".into()))?;
        dest[..data.len()].copy_from_slice(&data);
        complete_recv(recv, req.index())?;
        tracing::debug!(
            rank = self.my_rank,
            %req,
            bytes = data.len(),
            "rendezvous receive complete, sending ack"
        );

        let ack = Envelope {
            kind: EnvelopeKind::Ack,
            source_rank: self.my_rank,
            tag: envelope.tag,
            count: envelope.count,
            datatype: envelope.datatype,
            comm: envelope.comm,
            read_addr: None,
            key: envelope.key,
        };
        let mut scratch = self.scratch.checkout(ENVELOPE_SIZE)?;
        scratch.copy_from_slice(&ack.encode());
        let op = self.transport.send_envelope(peer, ENGINE_QUEUE, &scratch)?;
        self.ops.insert(op, OpCont::AckSent { landing, scratch });
        Ok(())
    }

    /// Route one landed message: Ack resolution, posted-receive match, or
    /// the unexpected queue.
    pub(super) fn dispatch_delivery(&mut self, delivery: Delivery) -> Result<()> {
        self.landing.mark_held(delivery.landing);
        let envelope = Envelope::decode(&delivery.data).ok_or_else(|| {
            CourierError::DecodeFailed(format!(
                "landing buffer {} held {} undecodable bytes",
                delivery.landing.0,
                delivery.data.len()
            ))
        })?;

        if envelope.kind == EnvelopeKind::Ack {
            let key = envelope
                .key
                .ok_or_else(|| CourierError::DecodeFailed("ack without completion key".into()))?;
            let send = self.arena.resolve_key(key)?;
            if send.state != SendState::AwaitingAck {
                return Err(CourierError::StaleCompletionKey {
                    index: key.index(),
                    generation: key.generation(),
                });
            }
            complete_send(send, key.index())?;
            tracing::debug!(rank = self.my_rank, %key, "rendezvous send complete");
            self.repost_landing(delivery.landing)?;
            self.pump_sends()?;
            return Ok(());
        }

        let payload = delivery.data.slice(ENVELOPE_SIZE..);
        match self.ledger.take_posted_recv(&envelope) {
            Some(req) => self.process_match(req, envelope, payload, delivery.peer, delivery.landing),
            None => {
                tracing::trace!(
                    rank = self.my_rank,
                    source = envelope.source_rank,
                    tag = envelope.tag,
                    "unexpected arrival queued"
                );
                self.ledger.push_unexpected(UnexpectedMessage {
                    envelope,
                    peer: delivery.peer,
                    payload,
                    landing: delivery.landing,
                });
                if self.ledger.unexpected_len() > self.cfg.unexpected_watermark {
                    tracing::warn!(
                        rank = self.my_rank,
                        depth = self.ledger.unexpected_len(),
                        held_buffers = self.landing.held(),
                        "unexpected-message queue above watermark; \
                         landing buffers are pinned until receives are posted"
                    );
                }
                Ok(())
            }
        }
    }

    /// A receive and an envelope matched (either order of arrival): run
    /// the protocol-specific completion path.
    pub(super) fn process_match(
        &mut self,
        req: RequestId,
        envelope: Envelope,
        payload: Bytes,
        peer: Rank,
        landing: LandingId,
    ) -> Result<()> {
        let bytes = envelope.payload_len();
        let recv = self.arena.recv_mut(req)?;
        let capacity = recv.capacity();
        if bytes > capacity {
            return Err(CourierError::ReceiveTruncation {
                incoming: bytes,
                capacity,
            });
        }
        recv.status = Some(crate::request::RecvStatus {
            source: envelope.source_rank,
            tag: envelope.tag,
            count: envelope.count,
        });

        if bytes <= self.cfg.short_msg_length {
            // Eager: the payload traveled with the envelope.
            if payload.len() < bytes {
                return Err(CourierError::DecodeFailed(format!(
                    "eager payload holds {} bytes, envelope declares {}",
                    payload.len(),
                    bytes
                )));
            }
            let dest = recv
                .dest
                .as_mut()
                .ok_or_else(|| CourierError::Transport("match after reap".into()))?;
            dest[..bytes].copy_from_slice(&payload[..bytes]);
            recv.state = RecvState::Copying;
            let timer = self.clock.schedule_after(self.cfg.copy_latency(bytes));
            self.timers
                .insert(timer, TimerCont::RecvCopyDone { req, landing });
            Ok(())
        } else {
            // Rendezvous: pull the payload from the sender's region.
            let Some(addr) = envelope.read_addr else {
                return Err(CourierError::DecodeFailed(
                    "rendezvous match without read address".into(),
                ));
            };
            if envelope.key.is_none() {
                return Err(CourierError::DecodeFailed(
                    "rendezvous match without completion key".into(),
                ));
            }
            recv.state = RecvState::Reading;
            let op = self.transport.rdma_read(peer, addr, bytes)?;
            self.ops.insert(
                op,
                OpCont::ReadPending {
                    req,
                    landing,
                    envelope,
                    peer,
                },
            );
            tracing::trace!(rank = self.my_rank, %req, addr, bytes, "rendezvous read issued");
            Ok(())
        }
    }
}

enum TransportPayload {
    Addr(u64),
    Data(Bytes),
}
