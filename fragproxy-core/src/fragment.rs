//! TLS ClientHello fragmentation.
//!
//! Inspection middleboxes that extract the SNI hostname expect the whole
//! ClientHello inside one contiguous TLS record. Re-emitting the captured
//! handshake as several smaller, independently framed records breaks that
//! assumption while leaving the byte stream semantically identical to the
//! upstream server, which reassembles records transparently.

use rand::Rng;
use std::io;
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const TLS_HANDSHAKE: u8 = 0x16;
const FRAGMENT_VERSION: [u8; 2] = [0x03, 0x04];
const RECORD_HEADER_SIZE: usize = 5;
/// Single-read cap on the ClientHello body. Bodies split across reads or
/// larger than this are not reassembled; the split plan covers whatever the
/// one read returned.
const MAX_HELLO_BODY: usize = 2048;

/// Computes the split plan for a captured handshake body.
///
/// The first chunk ends at the first 0x00 byte, inclusive, a coarse marker
/// for the end of the hostname region; it is deterministic for a given body.
/// The remainder is cut into uniformly random chunks of `[1, remaining]`
/// bytes. The returned ranges cover `0..body.len()` exactly, in order.
pub fn plan_fragments<R: Rng>(body: &[u8], rng: &mut R) -> Vec<Range<usize>> {
    let mut parts = Vec::new();
    let mut offset = 0;

    if let Some(zero) = body.iter().position(|&b| b == 0x00) {
        parts.push(0..zero + 1);
        offset = zero + 1;
    }

    while offset < body.len() {
        let len = rng.gen_range(1..=body.len() - offset);
        parts.push(offset..offset + len);
        offset += len;
    }

    parts
}

/// Frames one payload chunk as an independent TLS handshake record.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u16;
    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    record.push(TLS_HANDSHAKE);
    record.extend_from_slice(&FRAGMENT_VERSION);
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(payload);
    record
}

/// Captures the client's first TLS record and re-emits it to the upstream.
///
/// Reads exactly 5 header bytes (EOF before that fails the session), then
/// performs ONE read of up to 2048 body bytes. When a blocklist is
/// configured and the body mentions none of its names, header and body are
/// forwarded verbatim in their original framing. Otherwise the body is
/// split per [`plan_fragments`] and each chunk written as its own record.
///
/// Returns whether fragmentation actually happened.
pub async fn fragment_client_hello<C, U>(
    client: &mut C,
    upstream: &mut U,
    blocklist: Option<&[String]>,
) -> io::Result<bool>
where
    C: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut header = [0u8; RECORD_HEADER_SIZE];
    client.read_exact(&mut header).await?;

    let mut body = [0u8; MAX_HELLO_BODY];
    let n = client.read(&mut body).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before ClientHello body",
        ));
    }
    let body = &body[..n];

    if let Some(blocklist) = blocklist
        && !fragproxy_config::blocklist_matches(body, blocklist)
    {
        debug!(body_len = n, "ClientHello not blocklisted, forwarding intact");
        upstream.write_all(&header).await?;
        upstream.write_all(body).await?;
        return Ok(false);
    }

    let plan = plan_fragments(body, &mut rand::thread_rng());
    debug!(
        body_len = n,
        fragments = plan.len(),
        "Re-emitting ClientHello as fragmented records"
    );

    for range in plan {
        upstream.write_all(&frame(&body[range])).await?;
    }

    Ok(true)
}
