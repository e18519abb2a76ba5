use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, CourierError>;

/// Errors surfaced by the protocol engine.
///
/// Every variant is fatal: this engine runs inside a closed, fully
/// controlled simulated network, so anything that can fail is either a
/// programming-contract violation or resource misconfiguration. "Nothing
/// ready to process" is reported as [`crate::engine::Progress::Idle`],
/// never as an error, and there is no retry policy.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("count {count} x {datatype} ({expected} bytes) does not match buffer of {actual} bytes")]
    CountMismatch {
        count: u32,
        datatype: DataType,
        expected: usize,
        actual: usize,
    },

    #[error("incoming message is {incoming} bytes but the receive buffer holds {capacity}")]
    ReceiveTruncation { incoming: usize, capacity: usize },

    #[error("invalid destination rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("stale request handle: slot {index} is at generation {live}, handle carries {held}")]
    StaleRequest { index: u32, live: u32, held: u32 },

    #[error("completion key names no outstanding rendezvous send (slot {index}, generation {generation})")]
    StaleCompletionKey { index: u32, generation: u32 },

    #[error("request in slot {index} was already completed")]
    DoubleCompletion { index: u32 },

    #[error("engine used before initialization finished")]
    NotReady,

    #[error("send scratch pool exhausted: all {capacity} buffers are in flight")]
    ScratchExhausted { capacity: usize },

    #[error("envelope decode failed: {0}")]
    DecodeFailed(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("no continuation registered for completed operation {token}")]
    UnknownToken { token: u64 },

    #[error("simulation stalled: event queue drained while a request was still pending")]
    Stalled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
