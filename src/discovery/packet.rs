//! Zlib framing of announcement datagrams.
//!
//! Announcers deflate every blob. Receivers inflate, and take a datagram
//! that is not a zlib stream as a raw blob.

use std::borrow::Cow;
use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::trace;

/// Largest inflated blob accepted.
pub const MAX_BLOB: usize = 1 << 20;

/// Deflate `blob` into one datagram payload.
pub fn compress(blob: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(blob.len()), Compression::default());
    encoder.write_all(blob)?;
    encoder.finish()
}

/// Inflate `datagram`, or return it unchanged when it does not inflate.
pub fn decompress(datagram: &[u8]) -> Cow<'_, [u8]> {
    let mut out = Vec::new();
    let inflated = ZlibDecoder::new(datagram)
        .take(MAX_BLOB as u64 + 1)
        .read_to_end(&mut out);
    match inflated {
        Ok(_) if !out.is_empty() && out.len() <= MAX_BLOB => Cow::Owned(out),
        Ok(_) => {
            trace!(bytes = out.len(), "inflated datagram out of bounds, using raw");
            Cow::Borrowed(datagram)
        }
        Err(e) => {
            trace!(error = %e, "datagram is not zlib, using raw");
            Cow::Borrowed(datagram)
        }
    }
}
