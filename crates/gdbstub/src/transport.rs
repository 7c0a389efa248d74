//! Non-blocking socket transport (§4.9): readiness is checked with a
//! per-operation timeout rather than an async runtime, matching the
//! teacher workspace's `std`-only preference for transport primitives.

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

pub const SELECT_TIMEOUT: Duration = Duration::from_secs(1);
const CHUNK_SIZE: usize = 4096;

/// Drains everything currently readable from `stream` into a growing
/// buffer. `Ok(None)` signals a graceful close (EOF); `Ok(Some(bytes))` with
/// an empty vector means the per-operation timeout elapsed with nothing to
/// read, not a close.
pub fn read_all(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];

    match stream.read(&mut chunk) {
        Ok(0) => return Ok(None),
        Ok(n) => buf.extend_from_slice(&chunk[..n]),
        Err(e) if is_timeout(&e) => return Ok(Some(buf)),
        Err(e) => return Err(e),
    }

    stream.set_nonblocking(true)?;
    let result = loop {
        match stream.read(&mut chunk) {
            Ok(0) => break Ok(Some(buf.clone())),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if is_timeout(&e) => break Ok(Some(buf.clone())),
            Err(e) => break Err(e),
        }
    };
    stream.set_nonblocking(false)?;
    result
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}
