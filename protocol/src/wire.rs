//! Low-level wire primitives shared by the rendezvous server, the exchange
//! client and the mailbox.
//!
//! Everything on an archipelago socket is one of three things: a big-endian
//! `i32` scalar, a length-prefixed UTF-8 string, or a length-prefixed payload
//! blob. Control tokens are ordinary strings; the protocol state of each
//! endpoint — not a tag byte — decides whether the next read is a token, a
//! scalar or a frame.

use std::io::{Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of an identity string or control token on the wire.
pub const MAX_STRING_LEN: usize = 1024;

/// Maximum length of a migration payload blob (compressed size on the wire).
pub const MAX_BLOB_LEN: usize = 32 * 1024 * 1024;

/// Wire-level fault: I/O, framing, or a token the protocol does not know.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("string of {0} bytes exceeds the wire limit ({MAX_STRING_LEN})")]
    StringTooLong(usize),
    #[error("payload of {0} bytes exceeds the wire limit ({MAX_BLOB_LEN})")]
    BlobTooLarge(usize),
    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("unknown control token {0:?}")]
    UnknownToken(String),
    #[error("negative scalar {0} where a count was expected")]
    NegativeCount(i32),
    #[error("{0} bytes left over after decoding a migration batch")]
    TrailingBytes(usize),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
}

/// Control tokens relayed between islands and the rendezvous server.
///
/// These share the byte stream with migration frames; both ends must agree
/// on protocol state for the stream to stay interpretable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// Acknowledgement / barrier release.
    Okay,
    /// An island has reached the synchronous barrier.
    Sync,
    /// An island reports the ideal individual was found.
    Found,
    /// The server tells islands the run is over.
    Goodbye,
    /// The server releases all islands into steady state.
    Run,
}

impl ControlToken {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlToken::Okay => "okay",
            ControlToken::Sync => "sync",
            ControlToken::Found => "found",
            ControlToken::Goodbye => "bye-bye",
            ControlToken::Run => "run",
        }
    }

    pub fn parse(s: &str) -> Result<Self, WireError> {
        match s {
            "okay" => Ok(ControlToken::Okay),
            "sync" => Ok(ControlToken::Sync),
            "found" => Ok(ControlToken::Found),
            "bye-bye" => Ok(ControlToken::Goodbye),
            "run" => Ok(ControlToken::Run),
            other => Err(WireError::UnknownToken(other.to_string())),
        }
    }
}

/// Whether migration payload blobs are deflate-compressed.
///
/// Chosen by local configuration on both ends of a link, never negotiated on
/// the wire. A mismatch is a configuration error and surfaces as a decode
/// failure on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Deflate,
}

pub async fn write_i32<W: AsyncWrite + Unpin>(w: &mut W, value: i32) -> Result<(), WireError> {
    w.write_i32(value).await?;
    Ok(())
}

pub async fn read_i32<R: AsyncRead + Unpin>(r: &mut R) -> Result<i32, WireError> {
    Ok(r.read_i32().await?)
}

/// Read an `i32` that the protocol requires to be non-negative.
pub async fn read_count<R: AsyncRead + Unpin>(r: &mut R) -> Result<usize, WireError> {
    let value = r.read_i32().await?;
    usize::try_from(value).map_err(|_| WireError::NegativeCount(value))
}

pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<(), WireError> {
    if s.len() > MAX_STRING_LEN {
        return Err(WireError::StringTooLong(s.len()));
    }
    w.write_u32(s.len() as u32).await?;
    w.write_all(s.as_bytes()).await?;
    Ok(())
}

pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, WireError> {
    let len = r.read_u32().await? as usize;
    if len > MAX_STRING_LEN {
        return Err(WireError::StringTooLong(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8(buf)?)
}

pub async fn write_token<W: AsyncWrite + Unpin>(
    w: &mut W,
    token: ControlToken,
) -> Result<(), WireError> {
    write_string(w, token.as_str()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_token<R: AsyncRead + Unpin>(r: &mut R) -> Result<ControlToken, WireError> {
    let s = read_string(r).await?;
    ControlToken::parse(&s)
}

/// Write a length-prefixed payload blob, deflating it first when compression
/// is configured.
pub async fn write_blob<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
    compression: Compression,
) -> Result<(), WireError> {
    let owned;
    let bytes: &[u8] = match compression {
        Compression::None => payload,
        Compression::Deflate => {
            let mut encoder =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload)?;
            owned = encoder.finish()?;
            &owned
        }
    };
    if bytes.len() > MAX_BLOB_LEN {
        return Err(WireError::BlobTooLarge(bytes.len()));
    }
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(bytes).await?;
    Ok(())
}

/// Read a length-prefixed payload blob, inflating it when compression is
/// configured. Both ends must agree on the compression setting.
pub async fn read_blob<R: AsyncRead + Unpin>(
    r: &mut R,
    compression: Compression,
) -> Result<Vec<u8>, WireError> {
    let len = r.read_u32().await? as usize;
    if len > MAX_BLOB_LEN {
        return Err(WireError::BlobTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    match compression {
        Compression::None => Ok(buf),
        Compression::Deflate => {
            let mut decoder = flate2::read::DeflateDecoder::new(&buf[..]);
            let mut out = Vec::new();
            // The inflated side is bounded too; a hostile or misconfigured
            // peer must not be able to balloon memory.
            decoder
                .by_ref()
                .take(MAX_BLOB_LEN as u64 + 1)
                .read_to_end(&mut out)?;
            if out.len() > MAX_BLOB_LEN {
                return Err(WireError::BlobTooLarge(out.len()));
            }
            Ok(out)
        }
    }
}

/// Write one migration frame: subpopulation index, batch size, payload blob.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    subpop: usize,
    count: usize,
    payload: &[u8],
    compression: Compression,
) -> Result<(), WireError> {
    w.write_i32(subpop as i32).await?;
    w.write_i32(count as i32).await?;
    write_blob(w, payload, compression).await?;
    w.flush().await?;
    Ok(())
}

/// Read the remainder of a migration frame once the subpopulation index has
/// already been consumed. Returns the batch size and the raw payload.
pub async fn read_frame_body<R: AsyncRead + Unpin>(
    r: &mut R,
    compression: Compression,
) -> Result<(usize, Vec<u8>), WireError> {
    let count = read_count(r).await?;
    let payload = read_blob(r, compression).await?;
    Ok((count, payload))
}

/// Read a whole migration frame: subpopulation index, batch size, payload.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    compression: Compression,
) -> Result<(usize, usize, Vec<u8>), WireError> {
    let subpop = read_count(r).await?;
    let (count, payload) = read_frame_body(r, compression).await?;
    Ok((subpop, count, payload))
}

/// Identity exchange for the side that dialed out: the mailbox speaks first,
/// so read the peer's id, then answer with our own.
pub async fn handshake_outbound<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    own_id: &str,
) -> Result<String, WireError> {
    let peer = read_string(stream).await?;
    write_string(stream, own_id).await?;
    stream.flush().await?;
    Ok(peer)
}

/// Identity exchange for the accepting (mailbox) side: write our id first,
/// then read the peer's. Mirror image of [`handshake_outbound`].
pub async fn handshake_inbound<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    own_id: &str,
) -> Result<String, WireError> {
    write_string(stream, own_id).await?;
    stream.flush().await?;
    read_string(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pipe() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        tokio::io::duplex(64 * 1024)
    }

    #[tokio::test]
    async fn string_round_trip() {
        let (mut a, mut b) = pipe().await;
        write_string(&mut a, "island-7").await.unwrap();
        assert_eq!(read_string(&mut b).await.unwrap(), "island-7");
    }

    #[tokio::test]
    async fn oversized_string_rejected_on_write() {
        let (mut a, _b) = pipe().await;
        let huge = "x".repeat(MAX_STRING_LEN + 1);
        assert!(matches!(
            write_string(&mut a, &huge).await,
            Err(WireError::StringTooLong(_))
        ));
    }

    #[tokio::test]
    async fn oversized_string_rejected_on_read() {
        let (mut a, mut b) = pipe().await;
        a.write_u32(u32::MAX).await.unwrap();
        assert!(matches!(
            read_string(&mut b).await,
            Err(WireError::StringTooLong(_))
        ));
    }

    #[tokio::test]
    async fn all_tokens_round_trip() {
        let tokens = [
            ControlToken::Okay,
            ControlToken::Sync,
            ControlToken::Found,
            ControlToken::Goodbye,
            ControlToken::Run,
        ];
        let (mut a, mut b) = pipe().await;
        for token in tokens {
            write_token(&mut a, token).await.unwrap();
            assert_eq!(read_token(&mut b).await.unwrap(), token);
        }
    }

    #[tokio::test]
    async fn unknown_token_is_an_error() {
        let (mut a, mut b) = pipe().await;
        write_string(&mut a, "howdy").await.unwrap();
        assert!(matches!(
            read_token(&mut b).await,
            Err(WireError::UnknownToken(s)) if s == "howdy"
        ));
    }

    #[tokio::test]
    async fn frame_round_trip_uncompressed() {
        let (mut a, mut b) = pipe().await;
        let payload = vec![1u8, 2, 3, 4, 5, 6];
        write_frame(&mut a, 2, 3, &payload, Compression::None)
            .await
            .unwrap();
        let (subpop, count, got) = read_frame(&mut b, Compression::None).await.unwrap();
        assert_eq!(subpop, 2);
        assert_eq!(count, 3);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn frame_round_trip_deflate() {
        let (mut a, mut b) = pipe().await;
        let payload = vec![42u8; 4096];
        write_frame(&mut a, 0, 8, &payload, Compression::Deflate)
            .await
            .unwrap();
        let (subpop, count, got) = read_frame(&mut b, Compression::Deflate).await.unwrap();
        assert_eq!((subpop, count), (0, 8));
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn compression_mismatch_is_a_decode_failure() {
        // Sender deflates, receiver reads raw: the blob arrives but the bytes
        // are garbage to the codec layer. Reading raw at least must not hang.
        let (mut a, mut b) = pipe().await;
        let payload = vec![7u8; 128];
        write_blob(&mut a, &payload, Compression::Deflate).await.unwrap();
        let raw = read_blob(&mut b, Compression::None).await.unwrap();
        assert_ne!(raw, payload);
    }

    #[tokio::test]
    async fn negative_batch_size_rejected() {
        let (mut a, mut b) = pipe().await;
        a.write_i32(-5).await.unwrap();
        assert!(matches!(
            read_count(&mut b).await,
            Err(WireError::NegativeCount(-5))
        ));
    }

    #[tokio::test]
    async fn handshake_directions_pair_up() {
        let (mut outbound, mut inbound) = pipe().await;
        let (their_id, our_id) = tokio::join!(
            handshake_outbound(&mut outbound, "alpha"),
            handshake_inbound(&mut inbound, "beta"),
        );
        assert_eq!(their_id.unwrap(), "beta");
        assert_eq!(our_id.unwrap(), "alpha");
    }
}
