//! Packet framing for the GDB Remote Serial Protocol (§4.8): `$payload#xx`
//! with a mod-256 checksum trailer, plus the bare `+`/`-` ack bytes and the
//! `0x03` interrupt byte that can appear between packets.

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("checksum mismatch in packet {payload:?}: expected {expected:02x}, got {actual:02x}")]
    ChecksumMismatch { payload: String, expected: u8, actual: u8 },

    #[error("malformed checksum trailer")]
    BadChecksumTrailer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Ack,
    Nack,
    Interrupt,
    Packet(String),
    Notification(String),
}

/// Scans `buf` for the next ack byte, interrupt byte, or complete
/// `$...#xx`/`%...#xx` frame, consuming whatever it recognizes (including
/// stray bytes before a recognized start) from the front of `buf`. Returns
/// `Ok(None)` when `buf` holds only an incomplete frame — the caller should
/// wait for more bytes before calling again.
pub fn take_event(buf: &mut Vec<u8>) -> Result<Option<Event>, ProtocolError> {
    loop {
        match buf.first() {
            Some(b'+') => {
                buf.remove(0);
                return Ok(Some(Event::Ack));
            }
            Some(b'-') => {
                buf.remove(0);
                return Ok(Some(Event::Nack));
            }
            Some(0x03) => {
                buf.remove(0);
                return Ok(Some(Event::Interrupt));
            }
            Some(b'$') | Some(b'%') => break,
            Some(_) => {
                buf.remove(0);
            }
            None => return Ok(None),
        }
    }

    let is_notification = buf[0] == b'%';
    let Some(hash_pos) = buf.iter().position(|&b| b == b'#') else {
        return Ok(None);
    };
    if buf.len() < hash_pos + 3 {
        return Ok(None);
    }

    let payload_bytes = buf[1..hash_pos].to_vec();
    let trailer = std::str::from_utf8(&buf[hash_pos + 1..hash_pos + 3])
        .map_err(|_| ProtocolError::BadChecksumTrailer)?;
    let expected =
        u8::from_str_radix(trailer, 16).map_err(|_| ProtocolError::BadChecksumTrailer)?;
    let actual = payload_bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    let payload = String::from_utf8_lossy(&payload_bytes).into_owned();

    buf.drain(..hash_pos + 3);

    if actual != expected {
        return Err(ProtocolError::ChecksumMismatch { payload, expected, actual });
    }

    Ok(Some(if is_notification { Event::Notification(payload) } else { Event::Packet(payload) }))
}

/// Frames `payload` as an outgoing reply: `[+]$payload#xx`, where the
/// leading ack is present only while the session is not in no-ack mode.
pub fn frame_reply(payload: &str, no_ack: bool) -> Vec<u8> {
    let checksum = payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    let mut out = Vec::with_capacity(payload.len() + 6);
    if !no_ack {
        out.push(b'+');
    }
    out.push(b'$');
    out.extend_from_slice(payload.as_bytes());
    out.push(b'#');
    out.extend_from_slice(format!("{checksum:02x}").as_bytes());
    out
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_a_complete_packet_and_validates_checksum() {
        let mut buf = b"$OK#9a".to_vec();
        let event = take_event(&mut buf).unwrap().unwrap();
        assert_eq!(event, Event::Packet("OK".into()));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_a_bad_checksum() {
        let mut buf = b"$OK#00".to_vec();
        let err = take_event(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::ChecksumMismatch { .. }));
    }

    #[test]
    fn incomplete_packet_waits_for_more_bytes() {
        let mut buf = b"$qSupp".to_vec();
        assert_eq!(take_event(&mut buf).unwrap(), None);
        assert_eq!(buf, b"$qSupp");
    }

    #[test]
    fn leading_ack_and_stray_bytes_are_consumed_first() {
        let mut buf = b"+$OK#9a".to_vec();
        assert_eq!(take_event(&mut buf).unwrap(), Some(Event::Ack));
        assert_eq!(take_event(&mut buf).unwrap(), Some(Event::Packet("OK".into())));
    }

    #[test]
    fn interrupt_byte_is_recognized_mid_stream() {
        let mut buf = vec![0x03];
        assert_eq!(take_event(&mut buf).unwrap(), Some(Event::Interrupt));
    }

    #[test]
    fn frame_reply_omits_ack_prefix_once_no_ack_is_set() {
        let framed = frame_reply("OK", false);
        assert_eq!(framed, b"+$OK#9a");
        let framed = frame_reply("OK", true);
        assert_eq!(framed, b"$OK#9a");
    }

    #[test]
    fn hex_round_trips() {
        let bytes = vec![0x00, 0x2a, 0xff];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
    }
}
