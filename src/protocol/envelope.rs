use crate::request::RequestId;
use crate::types::{CommId, DataType, Rank, Tag};

/// Size of the wire envelope in bytes.
pub const ENVELOPE_SIZE: usize = 40;

/// Sentinel for an absent completion key on the wire.
const NO_KEY: u32 = u32::MAX;

/// What the envelope announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// A message offer: eager payload follows, or a rendezvous read address
    /// is advertised.
    Match = 0,
    /// Completion signal for a rendezvous send, carrying back its key.
    Ack = 1,
}

impl EnvelopeKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EnvelopeKind::Match),
            1 => Some(EnvelopeKind::Ack),
            _ => None,
        }
    }
}

/// 40-byte wire envelope prepended to every transport send.
///
/// ```text
/// [0]      kind: u8 (0 = Match, 1 = Ack)
/// [1]      datatype: u8
/// [2..4]   reserved (must be 0)
/// [4..8]   source_rank: u32 LE
/// [8..12]  tag: u32 LE
/// [12..16] count: u32 LE
/// [16..20] comm: u32 LE
/// [20..24] completion key index: u32 LE (MAX = absent)
/// [24..28] completion key generation: u32 LE (MAX = absent)
/// [28..32] reserved (must be 0)
/// [32..40] read_addr: u64 LE (0 = absent)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub source_rank: Rank,
    pub tag: Tag,
    pub count: u32,
    pub datatype: DataType,
    pub comm: CommId,
    /// Remote address the receiver may read the payload from. Rendezvous
    /// Match only.
    pub read_addr: Option<u64>,
    /// Sender-side request slot this envelope refers to. Present on a
    /// rendezvous Match (so the Ack can echo it) and on every Ack.
    pub key: Option<RequestId>,
}

impl Envelope {
    /// Encode to the fixed wire layout (little-endian).
    pub fn encode(&self) -> [u8; ENVELOPE_SIZE] {
        let mut buf = [0u8; ENVELOPE_SIZE];
        buf[0] = self.kind as u8;
        buf[1] = self.datatype as u8;
        buf[4..8].copy_from_slice(&self.source_rank.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tag.to_le_bytes());
        buf[12..16].copy_from_slice(&self.count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.comm.to_le_bytes());
        let (idx, generation) = match self.key {
            Some(key) => (key.index(), key.generation()),
            None => (NO_KEY, NO_KEY),
        };
        buf[20..24].copy_from_slice(&idx.to_le_bytes());
        buf[24..28].copy_from_slice(&generation.to_le_bytes());
        buf[32..40].copy_from_slice(&self.read_addr.unwrap_or(0).to_le_bytes());
        buf
    }

    /// Decode from the fixed wire layout.
    ///
    /// Returns `None` if the buffer is too short or a discriminant byte is
    /// invalid.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ENVELOPE_SIZE {
            return None;
        }
        let kind = EnvelopeKind::from_u8(buf[0])?;
        let datatype = DataType::from_u8(buf[1])?;
        let source_rank = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        let tag = u32::from_le_bytes(buf[8..12].try_into().ok()?);
        let count = u32::from_le_bytes(buf[12..16].try_into().ok()?);
        let comm = u32::from_le_bytes(buf[16..20].try_into().ok()?);
        let idx = u32::from_le_bytes(buf[20..24].try_into().ok()?);
        let generation = u32::from_le_bytes(buf[24..28].try_into().ok()?);
        let read_addr = u64::from_le_bytes(buf[32..40].try_into().ok()?);
        Some(Envelope {
            kind,
            source_rank,
            tag,
            count,
            datatype,
            comm,
            read_addr: (read_addr != 0).then_some(read_addr),
            key: (idx != NO_KEY || generation != NO_KEY)
                .then(|| RequestId::from_wire(idx, generation)),
        })
    }

    /// Bytes of payload this envelope describes.
    pub fn payload_len(&self) -> usize {
        self.count as usize * self.datatype.size_in_bytes()
    }
}
