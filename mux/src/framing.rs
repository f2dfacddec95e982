//! length-prefixed stream framing for connections forced onto TCP.
//!
//! each frame is a 2-byte big-endian length followed by exactly that
//! many payload bytes. reads peek first so a partial prefix or payload
//! consumes nothing; a parsed-but-unsatisfied length persists in
//! `pending` between calls.

use log::trace;
use mio::net::TcpStream;
use std::io::{self, Read, Write};

/// frame length prefix size on the wire.
const PREFIX_LEN: usize = 2;

/// read one complete frame into `buf` if the stream holds it.
///
/// returns `Ok(None)` when no complete frame is available yet; the
/// stream is left exactly where it was apart from consumed prefixes.
pub(crate) fn read_frame(
    stream: &TcpStream,
    buf: &mut [u8],
    pending: &mut u16,
) -> io::Result<Option<usize>> {
    let mut reader: &TcpStream = stream;

    loop {
        if *pending == 0 {
            let mut prefix = [0u8; PREFIX_LEN];
            match stream.peek(&mut prefix) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) if n < PREFIX_LEN => return Ok(None),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
            reader.read_exact(&mut prefix)?;

            let len = u16::from_be_bytes(prefix);
            if len == 0 {
                // empty frame: consume it and keep parsing, the poller
                // is edge-triggered and will not re-report what is
                // already buffered
                trace!("discarding empty frame");
                continue;
            }
            if usize::from(len) > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds receive buffer", len),
                ));
            }
            *pending = len;
        }

        let len = usize::from(*pending);
        match stream.peek(&mut buf[..len]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) if n < len => return Ok(None),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        }
        reader.read_exact(&mut buf[..len])?;
        *pending = 0;
        return Ok(Some(len));
    }
}

/// frame `data` and write it to the stream.
pub(crate) fn write_frame(stream: &TcpStream, data: &[u8]) -> io::Result<usize> {
    if data.len() >= usize::from(u16::MAX) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload too large to frame",
        ));
    }

    let mut writer: &TcpStream = stream;
    let prefix = (data.len() as u16).to_be_bytes();
    writer.write_all(&prefix)?;
    writer.write_all(data)?;
    Ok(data.len())
}
