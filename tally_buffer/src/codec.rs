//! Length-delimited framing for buffer files.
//!
//! A frame is a 4 byte big-endian length followed by that many payload bytes.
//! The format is private to this crate, files are never read by another
//! process.

use std::io::{self, Read, Write};

use crate::Error;

const HEADER_LEN: usize = 4;

/// Write `payload` as a single frame. The frame is assembled in memory first so
/// the underlying writer sees one `write_all`.
pub(crate) fn encode<W: Write>(writer: &mut W, payload: &[u8]) -> Result<usize, Error> {
    let len = u32::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    Ok(frame.len())
}

/// Read frames from `reader` until a clean end of input, calling `visit` once
/// per payload. Returns the number of frames visited.
pub(crate) fn iterate<R: Read>(reader: &mut R, visit: &mut dyn FnMut(&[u8])) -> Result<usize, Error> {
    let mut visited = 0;
    let mut payload = Vec::new();
    loop {
        let mut header = [0u8; HEADER_LEN];
        match read_full(reader, &mut header)? {
            0 => return Ok(visited),
            HEADER_LEN => {}
            _ => return Err(Error::TruncatedFrame),
        }
        // The header is untrusted, grow the payload only as bytes arrive.
        let len = u32::from_be_bytes(header);
        payload.clear();
        if reader.by_ref().take(u64::from(len)).read_to_end(&mut payload)? != len as usize {
            return Err(Error::TruncatedFrame);
        }
        visit(&payload);
        visited += 1;
    }
}

// Like `read_exact` but reports how many bytes were read before EOF rather than
// failing, so that a clean EOF can be told apart from a torn frame.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
