//! Multi-engine simulation harness.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::CourierConfig;
use crate::engine::{Completion, Engine};
use crate::error::{CourierError, Result};
use crate::request::RequestId;
use crate::types::{Rank, SimTime};

use super::network::{NetState, NetStats, SimNetConfig, SimTransport};
use super::queue::{EventQueue, SimClock, SimItem};

/// An engine bound to the simulated network and clock.
pub type SimEngine = Engine<SimTransport, SimClock>;

/// A cluster of engines over one simulated network, plus the event loop
/// that drives them.
pub struct SimWorld {
    events: Rc<RefCell<EventQueue>>,
    net: Rc<RefCell<NetState>>,
    engines: Vec<SimEngine>,
}

impl SimWorld {
    /// Build and fully initialize `world_size` engines with the default
    /// network latency model.
    pub fn bootstrap(world_size: u32, cfg: CourierConfig) -> Result<Self> {
        Self::bootstrap_with(world_size, cfg, SimNetConfig::default())
    }

    /// Build and fully initialize `world_size` engines with a custom
    /// network latency model.
    pub fn bootstrap_with(
        world_size: u32,
        cfg: CourierConfig,
        net_cfg: SimNetConfig,
    ) -> Result<Self> {
        let events = Rc::new(RefCell::new(EventQueue::new()));
        let net = Rc::new(RefCell::new(NetState::new(world_size, net_cfg)));

        let mut engines = Vec::with_capacity(world_size as usize);
        for rank in 0..world_size {
            let transport = SimTransport::new(rank, Rc::clone(&net), Rc::clone(&events));
            let clock = SimClock::new(rank, Rc::clone(&events));
            let mut engine = Engine::new(cfg.clone(), transport, clock, world_size, rank)?;
            engine.init()?;
            engines.push(engine);
        }

        let mut world = Self {
            events,
            net,
            engines,
        };
        world.run_until_idle()?;
        if !world.engines.iter().all(|e| e.is_ready()) {
            return Err(CourierError::Stalled);
        }
        Ok(world)
    }

    pub fn engine(&self, rank: Rank) -> &SimEngine {
        &self.engines[rank as usize]
    }

    pub fn engine_mut(&mut self, rank: Rank) -> &mut SimEngine {
        &mut self.engines[rank as usize]
    }

    /// Current virtual time.
    pub fn now(&self) -> SimTime {
        self.events.borrow().now()
    }

    /// Snapshot of the network's operation counters.
    pub fn stats(&self) -> NetStats {
        self.net.borrow().stats()
    }

    /// Process one scheduled item. Returns `false` once the queue is empty.
    pub fn step(&mut self) -> Result<bool> {
        let next = self.events.borrow_mut().pop();
        let Some(scheduled) = next else {
            return Ok(false);
        };
        match scheduled.item {
            SimItem::Engine { node, event } => {
                self.engines[node as usize].handle_event(event)?;
            }
            SimItem::Deliver {
                dest,
                queue,
                peer,
                data,
            } => {
                let wakes = self.net.borrow_mut().deliver(dest, queue, peer, data)?;
                let mut events = self.events.borrow_mut();
                for op in wakes {
                    events.schedule(
                        0,
                        SimItem::Engine {
                            node: dest,
                            event: crate::engine::Event::Transport(
                                crate::transport::TransportEvent::ReceiveReady { op },
                            ),
                        },
                    );
                }
            }
        }
        Ok(true)
    }

    /// Run until no scheduled work remains.
    pub fn run_until_idle(&mut self) -> Result<()> {
        while self.step()? {}
        Ok(())
    }

    /// Drive the simulation until `req` on `rank` completes, then reap it.
    ///
    /// Fails with [`CourierError::Stalled`] if the event queue drains
    /// first: a visible deadlock instead of a hang.
    pub fn wait(&mut self, rank: Rank, req: RequestId) -> Result<Completion> {
        loop {
            if let Some(done) = self.engines[rank as usize].test(req)? {
                return Ok(done);
            }
            if !self.step()? {
                return Err(CourierError::Stalled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use crate::types::{DataType, SourceMatch, TagMatch};

    #[test]
    fn test_bootstrap_brings_every_engine_up() {
        let world = SimWorld::bootstrap(3, CourierConfig::default()).unwrap();
        for rank in 0..3 {
            assert!(world.engine(rank).is_ready());
            assert_eq!(world.engine(rank).rank(), rank);
            assert_eq!(world.engine(rank).world_size(), 3);
        }
        assert!(world.now() > 0);
    }

    #[test]
    fn test_minimal_round_trip() {
        let mut world = SimWorld::bootstrap(2, CourierConfig::default()).unwrap();
        let payload = Bytes::from_static(&[0xAB; 8]);
        let send = world
            .engine_mut(0)
            .isend(payload, 8, DataType::U8, 1, 42, 0)
            .unwrap();
        let recv = world
            .engine_mut(1)
            .irecv(
                BytesMut::zeroed(8),
                8,
                DataType::U8,
                SourceMatch::Exact(0),
                TagMatch::Exact(42),
                0,
            )
            .unwrap();

        match world.wait(1, recv).unwrap() {
            Completion::Recv { status, data } => {
                assert_eq!(status.source, 0);
                assert_eq!(status.tag, 42);
                assert_eq!(&data[..], &[0xAB; 8]);
            }
            Completion::Send => panic!("receive reaped as a send"),
        }
        assert!(matches!(world.wait(0, send).unwrap(), Completion::Send));
    }

    #[test]
    fn test_wait_on_unmatched_recv_reports_stall() {
        let mut world = SimWorld::bootstrap(2, CourierConfig::default()).unwrap();
        let recv = world
            .engine_mut(1)
            .irecv(
                BytesMut::zeroed(4),
                4,
                DataType::U8,
                SourceMatch::Any,
                TagMatch::Any,
                0,
            )
            .unwrap();
        assert!(matches!(
            world.wait(1, recv),
            Err(CourierError::Stalled)
        ));
    }
}
