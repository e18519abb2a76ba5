//! courier: point-to-point message passing over one-sided RDMA, built for
//! discrete-event simulation hosts.
//!
//! The engine matches asynchronous sends and receives by (source, tag,
//! communicator), switches between an eager copy protocol and a rendezvous
//! read protocol at a byte threshold, parks out-of-order arrivals in an
//! unexpected-message queue, and makes progress through non-blocking polls
//! and host-delivered completion events: no threads, no blocking calls.
//!
//! The transport and clock are traits ([`Transport`], [`Clock`]); the
//! [`sim`] module provides deterministic in-memory implementations of both
//! plus a multi-engine harness, so protocol behavior is reproducible under
//! test.

pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod sim;
pub mod transport;
pub mod types;

pub use config::CourierConfig;
pub use engine::{Completion, Engine, Event, Progress, ENGINE_QUEUE};
pub use error::{CourierError, Result};
pub use protocol::{Envelope, EnvelopeKind, ENVELOPE_SIZE};
pub use request::{RecvStatus, RequestId};
pub use sim::{NetStats, SimNetConfig, SimWorld};
pub use transport::{Clock, Delivery, LandingId, OpToken, TimerToken, Transport, TransportEvent};
pub use types::{CommId, DataType, Rank, SimTime, SourceMatch, Tag, TagMatch};
