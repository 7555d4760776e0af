//! Individual (de)serialization for migration.
//!
//! The exchange subsystem never looks inside an individual; it hands batches
//! of them to a [`Codec`] supplied by the host evolutionary loop. The wire
//! format this codec produces is for migration only — it is distinct from any
//! checkpoint or human-readable representation the host may also have.

use bytes::BytesMut;

/// Failure to encode or decode one individual.
#[derive(Debug, thiserror::Error)]
#[error("codec error: {0}")]
pub struct CodecError(String);

impl CodecError {
    pub fn new(msg: impl Into<String>) -> Self {
        CodecError(msg.into())
    }
}

/// Encoder/decoder for one individual representation.
///
/// Encodings must be self-delimiting: `decode` consumes exactly the bytes
/// `encode` produced, so batches can be laid out back-to-back in a single
/// migration payload with no per-individual framing.
pub trait Codec<I>: Send + Sync + 'static {
    fn encode(&self, individual: &I, buf: &mut BytesMut) -> Result<(), CodecError>;

    fn decode(&self, buf: &mut &[u8]) -> Result<I, CodecError>;
}

/// Encode a batch of individuals into one contiguous migration payload.
pub fn encode_batch<'a, I: 'a + 'static>(
    codec: &dyn Codec<I>,
    individuals: impl IntoIterator<Item = &'a I>,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::new();
    for individual in individuals {
        codec.encode(individual, &mut buf)?;
    }
    Ok(buf.to_vec())
}

/// Decode exactly `count` individuals from a migration payload.
///
/// Leftover bytes mean the two ends disagree about the encoding (or the
/// compression setting) and are reported as an error rather than ignored.
pub fn decode_batch<I: 'static>(
    codec: &dyn Codec<I>,
    count: usize,
    payload: &[u8],
) -> Result<Vec<I>, crate::wire::WireError> {
    let mut buf = payload;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(codec.decode(&mut buf)?);
    }
    if !buf.is_empty() {
        return Err(crate::wire::WireError::TrailingBytes(buf.len()));
    }
    Ok(out)
}
