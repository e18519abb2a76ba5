//! Wire format: the envelope prefixed to every transport send.

mod envelope;

pub use envelope::{Envelope, EnvelopeKind, ENVELOPE_SIZE};
