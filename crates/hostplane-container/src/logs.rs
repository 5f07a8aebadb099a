//! Decoding of Docker's multiplexed stdout/stderr stream.
//!
//! Containers started without a TTY return log and exec output as a series
//! of frames: one byte stream type, three zero bytes, a big-endian `u32`
//! payload length, then the payload.

const HEADER_LEN: usize = 8;

/// Decode an engine output body into text.
///
/// Bodies that do not look multiplexed (TTY containers) are returned as-is.
pub fn decode_output(body: &[u8]) -> String {
    if !looks_multiplexed(body) {
        return String::from_utf8_lossy(body).into_owned();
    }

    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;

    while rest.len() >= HEADER_LEN {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
        #[allow(clippy::as_conversions)]
        let len = len as usize;
        let end = (HEADER_LEN + len).min(rest.len());
        out.extend_from_slice(&rest[HEADER_LEN..end]);
        rest = &rest[end..];
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn looks_multiplexed(body: &[u8]) -> bool {
    body.len() >= HEADER_LEN && body[0] <= 2 && body[1..4] == [0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &str) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        #[allow(clippy::as_conversions)]
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload.as_bytes());
        out
    }

    #[test]
    fn demultiplexes_frames_in_order() {
        let mut body = frame(1, "hello\n");
        body.extend(frame(2, "warn\n"));
        body.extend(frame(1, "bye\n"));

        assert_eq!(decode_output(&body), "hello\nwarn\nbye\n");
    }

    #[test]
    fn raw_output_passes_through() {
        assert_eq!(decode_output(b"plain tty output"), "plain tty output");
    }

    #[test]
    fn truncated_frame_keeps_available_bytes() {
        let mut body = frame(1, "complete\n");
        body.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 50]);
        body.extend_from_slice(b"part");

        assert_eq!(decode_output(&body), "complete\npart");
    }
}
