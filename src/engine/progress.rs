//! The progress driver: non-blocking poll passes and completion reaping.

use bytes::BytesMut;

use crate::error::{CourierError, Result};
use crate::request::{RecvStatus, Request, RequestId};
use crate::transport::{Clock, Transport};

use super::{Engine, ENGINE_QUEUE};

/// Outcome of one non-blocking progress pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// One message was dispatched through the protocol engine.
    Dispatched,
    /// Nothing was ready. Normal, not an error.
    Idle,
}

/// What a reaped request hands back to the caller.
#[derive(Debug)]
pub enum Completion {
    /// A send finished; for eager sends this means handed to the
    /// transport, for rendezvous sends that the Ack arrived.
    Send,
    /// A receive finished; `data` is the filled destination buffer.
    Recv { status: RecvStatus, data: BytesMut },
}

impl<T: Transport, C: Clock> Engine<T, C> {
    /// One non-blocking progress pass: dispatch at most one ready message.
    ///
    /// Bounding each pass to a single message bounds the latency this call
    /// injects into its caller; callers that want to drain call it in a
    /// loop until it reports [`Progress::Idle`].
    pub fn poll(&mut self) -> Result<Progress> {
        if !self.ready {
            return Err(CourierError::NotReady);
        }
        match self.transport.poll_receive_ready(ENGINE_QUEUE)? {
            Some(delivery) => {
                self.dispatch_delivery(delivery)?;
                self.pump_sends()?;
                Ok(Progress::Dispatched)
            }
            None => Ok(Progress::Idle),
        }
    }

    /// Non-blocking completion check: one progress pass, then reap the
    /// request if it has finished.
    ///
    /// A completed request is removed from the arena and its slot
    /// generation bumped, so the handle (and any completion key derived
    /// from it) can never be used again.
    pub fn test(&mut self, req: RequestId) -> Result<Option<Completion>> {
        self.poll()?;
        self.try_reap(req)
    }

    /// Completion check with the original blocking flavor.
    ///
    /// With `blocking` set and the request still pending, the engine arms
    /// the transport's blocking readiness wait: every subsequent arrival is
    /// dispatched and the wait re-armed until the request completes. The
    /// caller observes completion through a later [`Engine::test`] once the
    /// host has delivered the events; in an event-driven host nothing can
    /// literally block.
    pub fn test_or_wait(&mut self, req: RequestId, blocking: bool) -> Result<Option<Completion>> {
        let done = self.test(req)?;
        if done.is_some() || !blocking {
            return Ok(done);
        }
        self.arm_wait(req)?;
        Ok(None)
    }

    fn try_reap(&mut self, req: RequestId) -> Result<Option<Completion>> {
        if !self.arena.get(req)?.is_done() {
            return Ok(None);
        }
        match self.arena.remove(req)? {
            Request::Send(_) => Ok(Some(Completion::Send)),
            Request::Recv(mut recv) => {
                let status = recv.status.take().ok_or_else(|| {
                    CourierError::Transport("completed receive without a status record".into())
                })?;
                let data = recv.dest.take().ok_or_else(|| {
                    CourierError::Transport("completed receive without a buffer".into())
                })?;
                Ok(Some(Completion::Recv { status, data }))
            }
        }
    }
}
