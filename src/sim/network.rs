//! In-memory one-sided RDMA network.
//!
//! Models exactly the transport contract the engine consumes: per-node
//! receive queues with posted landing buffers, arrival stall when no
//! buffer is posted, a per-node address space of registered regions for
//! one-sided reads, and a simple latency model. Operation counters let
//! tests assert protocol shape (how many Matches, Acks, reads,
//! registrations a scenario produced).

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;

use crate::engine::Event;
use crate::error::{CourierError, Result};
use crate::transport::{Delivery, LandingId, OpToken, Transport, TransportEvent};
use crate::types::{QueueId, Rank, SimTime};

use super::queue::{EventQueue, SimItem};

/// Latency model for the simulated network.
#[derive(Debug, Clone)]
pub struct SimNetConfig {
    /// Receive-queue creation time.
    pub queue_setup_ns: SimTime,
    /// Memory-registration time.
    pub registration_ns: SimTime,
    /// Delay until a handed-off send is accepted back to the sender.
    pub send_accept_ns: SimTime,
    /// Fixed wire latency per envelope.
    pub wire_base_ns: SimTime,
    /// Additional wire latency per KiB carried.
    pub wire_ns_per_kib: SimTime,
    /// Fixed latency of a one-sided read.
    pub read_base_ns: SimTime,
    /// Additional read latency per KiB pulled.
    pub read_ns_per_kib: SimTime,
}

impl Default for SimNetConfig {
    fn default() -> Self {
        Self {
            queue_setup_ns: 500,
            registration_ns: 1_000,
            send_accept_ns: 50,
            wire_base_ns: 400,
            wire_ns_per_kib: 120,
            read_base_ns: 800,
            read_ns_per_kib: 120,
        }
    }
}

impl SimNetConfig {
    fn wire_latency(&self, bytes: usize) -> SimTime {
        self.wire_base_ns + (bytes as u64 * self.wire_ns_per_kib) / 1024
    }

    fn read_latency(&self, bytes: usize) -> SimTime {
        self.read_base_ns + (bytes as u64 * self.read_ns_per_kib) / 1024
    }
}

/// Counters of transport operations, for protocol-shape assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetStats {
    /// Match envelopes handed to the wire (eager and rendezvous).
    pub match_envelopes: u64,
    /// Ack envelopes handed to the wire.
    pub ack_envelopes: u64,
    /// One-sided reads issued.
    pub rdma_reads: u64,
    /// Memory regions registered.
    pub registrations: u64,
    /// Arrivals that found no posted landing buffer and had to wait.
    pub stalled_arrivals: u64,
}

#[derive(Debug, Default)]
struct NicQueue {
    /// Landing buffers posted by the engine, paired with arrivals in FIFO
    /// order.
    posted: VecDeque<(LandingId, usize)>,
    /// Arrivals waiting for a posted buffer.
    arrivals: VecDeque<(Rank, Bytes)>,
    /// Landed messages not yet claimed by a poll.
    ready: VecDeque<Delivery>,
    /// Armed blocking waits to wake on the next landing.
    waiters: Vec<OpToken>,
}

#[derive(Debug, Default)]
struct NodeNic {
    queues: HashMap<QueueId, NicQueue>,
    regions: HashMap<u64, Bytes>,
    next_addr: u64,
}

/// Shared state of the whole simulated network.
#[derive(Debug)]
pub(crate) struct NetState {
    cfg: SimNetConfig,
    nodes: Vec<NodeNic>,
    stats: NetStats,
}

impl NetState {
    pub fn new(world_size: u32, cfg: SimNetConfig) -> Self {
        let mut nodes = Vec::with_capacity(world_size as usize);
        for _ in 0..world_size {
            nodes.push(NodeNic {
                queues: HashMap::new(),
                regions: HashMap::new(),
                // Address 0 stays invalid; the wire encodes "no read
                // address" as 0.
                next_addr: 0x1000,
            });
        }
        Self {
            cfg,
            nodes,
            stats: NetStats::default(),
        }
    }

    pub fn stats(&self) -> NetStats {
        self.stats.clone()
    }

    fn queue_mut(&mut self, node: Rank, queue: QueueId) -> Result<&mut NicQueue> {
        self.nodes
            .get_mut(node as usize)
            .and_then(|n| n.queues.get_mut(&queue))
            .ok_or_else(|| {
                CourierError::Transport(format!("node {node} has no receive queue {queue:#x}"))
            })
    }

    /// Wire arrival at a node: queue it, land whatever now pairs with a
    /// posted buffer, and return the blocking waits to wake.
    pub fn deliver(
        &mut self,
        dest: Rank,
        queue: QueueId,
        peer: Rank,
        data: Bytes,
    ) -> Result<Vec<OpToken>> {
        let q = self.queue_mut(dest, queue)?;
        let stalled = q.posted.is_empty();
        q.arrivals.push_back((peer, data));
        let wakes = pair_arrivals(q)?;
        if stalled {
            self.stats.stalled_arrivals += 1;
            tracing::trace!(dest, "arrival waiting for a landing buffer");
        }
        Ok(wakes)
    }
}

/// Move arrivals into posted landing buffers while both exist; if anything
/// is ready afterwards, drain the armed waiters for waking.
fn pair_arrivals(q: &mut NicQueue) -> Result<Vec<OpToken>> {
    while !q.arrivals.is_empty() && !q.posted.is_empty() {
        let Some((peer, data)) = q.arrivals.pop_front() else {
            break;
        };
        let Some((landing, capacity)) = q.posted.pop_front() else {
            break;
        };
        if data.len() > capacity {
            return Err(CourierError::Transport(format!(
                "arrival of {} bytes overruns landing buffer of {capacity}",
                data.len()
            )));
        }
        q.ready.push_back(Delivery {
            peer,
            landing,
            data,
        });
    }
    if q.ready.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(q.waiters.drain(..).collect())
    }
}

/// Transport handle for one simulated node.
pub struct SimTransport {
    node: Rank,
    net: Rc<RefCell<NetState>>,
    events: Rc<RefCell<EventQueue>>,
    next_op: u64,
}

impl SimTransport {
    pub(crate) fn new(
        node: Rank,
        net: Rc<RefCell<NetState>>,
        events: Rc<RefCell<EventQueue>>,
    ) -> Self {
        Self {
            node,
            net,
            events,
            next_op: 0,
        }
    }

    fn next_token(&mut self) -> OpToken {
        let op = OpToken(self.next_op);
        self.next_op += 1;
        op
    }

    fn complete(&self, delay: SimTime, event: TransportEvent) {
        self.events.borrow_mut().schedule(
            delay,
            SimItem::Engine {
                node: self.node,
                event: Event::Transport(event),
            },
        );
    }
}

impl Transport for SimTransport {
    fn create_queue(&mut self, queue: QueueId) -> Result<OpToken> {
        let op = self.next_token();
        let delay = {
            let mut guard = self.net.borrow_mut();
            let net = &mut *guard;
            net.nodes
                .get_mut(self.node as usize)
                .ok_or_else(|| CourierError::Transport(format!("no node {}", self.node)))?
                .queues
                .insert(queue, NicQueue::default());
            net.cfg.queue_setup_ns
        };
        self.complete(delay, TransportEvent::QueueReady { op });
        Ok(op)
    }

    fn register_memory(&mut self, data: Bytes) -> Result<OpToken> {
        let op = self.next_token();
        let (addr, delay) = {
            let mut guard = self.net.borrow_mut();
            let net = &mut *guard;
            let node = net
                .nodes
                .get_mut(self.node as usize)
                .ok_or_else(|| CourierError::Transport(format!("no node {}", self.node)))?;
            let addr = node.next_addr;
            let span = (data.len() as u64).max(1);
            node.next_addr = addr + span.next_multiple_of(0x1000);
            node.regions.insert(addr, data);
            net.stats.registrations += 1;
            (addr, net.cfg.registration_ns)
        };
        self.complete(delay, TransportEvent::Registered { op, addr });
        Ok(op)
    }

    fn post_receive(&mut self, queue: QueueId, landing: LandingId, capacity: usize) -> Result<()> {
        let wakes = {
            let mut net = self.net.borrow_mut();
            let q = net.queue_mut(self.node, queue)?;
            q.posted.push_back((landing, capacity));
            pair_arrivals(q)?
        };
        for op in wakes {
            self.complete(0, TransportEvent::ReceiveReady { op });
        }
        Ok(())
    }

    fn poll_receive_ready(&mut self, queue: QueueId) -> Result<Option<Delivery>> {
        let mut net = self.net.borrow_mut();
        let q = net.queue_mut(self.node, queue)?;
        Ok(q.ready.pop_front())
    }

    fn wait_receive_ready(&mut self, queue: QueueId) -> Result<OpToken> {
        let op = self.next_token();
        let ready_now = {
            let mut net = self.net.borrow_mut();
            let q = net.queue_mut(self.node, queue)?;
            if q.ready.is_empty() {
                q.waiters.push(op);
                false
            } else {
                true
            }
        };
        if ready_now {
            self.complete(0, TransportEvent::ReceiveReady { op });
        }
        Ok(op)
    }

    fn send_envelope(&mut self, dest: Rank, queue: QueueId, data: &[u8]) -> Result<OpToken> {
        let op = self.next_token();
        let (accept, wire) = {
            let mut guard = self.net.borrow_mut();
            let net = &mut *guard;
            if dest as usize >= net.nodes.len() {
                return Err(CourierError::Transport(format!(
                    "send to nonexistent node {dest}"
                )));
            }
            match data.first() {
                Some(&1) => net.stats.ack_envelopes += 1,
                _ => net.stats.match_envelopes += 1,
            }
            (net.cfg.send_accept_ns, net.cfg.wire_latency(data.len()))
        };
        let payload = Bytes::copy_from_slice(data);
        let mut events = self.events.borrow_mut();
        events.schedule(
            accept,
            SimItem::Engine {
                node: self.node,
                event: Event::Transport(TransportEvent::SendAccepted { op }),
            },
        );
        events.schedule(
            wire,
            SimItem::Deliver {
                dest,
                queue,
                peer: self.node,
                data: payload,
            },
        );
        Ok(op)
    }

    fn rdma_read(&mut self, peer: Rank, addr: u64, len: usize) -> Result<OpToken> {
        let op = self.next_token();
        let (data, delay) = {
            let mut guard = self.net.borrow_mut();
            let net = &mut *guard;
            let region = net
                .nodes
                .get(peer as usize)
                .and_then(|n| n.regions.get(&addr))
                .ok_or_else(|| {
                    CourierError::Transport(format!(
                        "no registered region at {addr:#x} on node {peer}"
                    ))
                })?;
            if len > region.len() {
                return Err(CourierError::Transport(format!(
                    "read of {len} bytes past end of {}-byte region at {addr:#x}",
                    region.len()
                )));
            }
            let data = region.slice(..len);
            net.stats.rdma_reads += 1;
            (data, net.cfg.read_latency(len))
        };
        self.complete(delay, TransportEvent::ReadDone { op, data });
        Ok(op)
    }
}
