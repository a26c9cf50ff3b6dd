//! RFCOMM frame codec: STX/ETX delimiting with
//! byte-stuffing over the raw RFCOMM byte stream.

/// Start of frame.
pub const STX: u8 = 0xCC;
/// End of frame.
pub const ETX: u8 = 0x47;
/// Escape byte; `STX`, `ETX`, and `ESC` itself are escaped as `ESC, byte ^
/// ESCAPE_XOR` when they occur inside a frame's payload.
pub const ESC: u8 = 0x77;
const ESCAPE_XOR: u8 = 0x20;

/// Encodes a single payload as a complete STX-delimited, byte-stuffed
/// frame ready to write to the RFCOMM socket.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(STX);
    for &b in payload {
        if b == STX || b == ETX || b == ESC {
            out.push(ESC);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out.push(ETX);
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    OutsideFrame,
    InFrame,
    AfterEscape,
}

/// Streaming deframer. A 3-state machine that tolerates arbitrary
/// fragmentation of the underlying byte stream and emits one complete
/// payload per call to [`Deframer::feed`] that completes a frame.
/// Fragmentation across `feed` calls is fine; a new connection should
/// call [`Deframer::reset`] to discard any partial buffer.
#[derive(Debug)]
pub struct Deframer {
    state: State,
    buf: Vec<u8>,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deframer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: State::OutsideFrame,
            buf: Vec::new(),
        }
    }

    /// Discards any partially accumulated frame. Call on a fresh
    /// connection (§4.I).
    pub fn reset(&mut self) {
        self.state = State::OutsideFrame;
        self.buf.clear();
    }

    /// Feeds raw bytes from the socket and returns every complete,
    /// unescaped payload found. Bytes outside of a frame (before the
    /// first STX, or stray bytes between ETX and the next STX) are
    /// silently skipped -- they indicate the stream is resynchronizing
    /// after a [`crate::Error::Framing`] error upstream.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            match self.state {
                State::OutsideFrame => {
                    if b == STX {
                        self.buf.clear();
                        self.state = State::InFrame;
                    }
                }
                State::InFrame => match b {
                    ETX => {
                        frames.push(std::mem::take(&mut self.buf));
                        self.state = State::OutsideFrame;
                    }
                    ESC => self.state = State::AfterEscape,
                    _ => self.buf.push(b),
                },
                State::AfterEscape => {
                    self.buf.push(b ^ ESCAPE_XOR);
                    self.state = State::InFrame;
                }
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_for_arbitrary_bytes() {
        for payload in [
            vec![],
            vec![0x01, 0x02, 0x03],
            vec![STX, ETX, ESC, STX, ESC],
            (0u8..=255).collect::<Vec<_>>(),
        ] {
            let framed = encode_frame(&payload);
            let mut d = Deframer::new();
            let out = d.feed(&framed);
            assert_eq!(out, vec![payload]);
        }
    }

    #[test]
    fn tolerates_arbitrary_fragmentation() {
        let payload = vec![1, STX, 2, ETX, 3, ESC, 4];
        let framed = encode_frame(&payload);
        let mut d = Deframer::new();
        let mut out = Vec::new();
        for chunk in framed.chunks(1) {
            out.extend(d.feed(chunk));
        }
        assert_eq!(out, vec![payload]);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut d = Deframer::new();
        assert!(d.feed(&[STX, 1, 2, 3]).is_empty());
        d.reset();
        let out = d.feed(&[STX, 9, ETX]);
        assert_eq!(out, vec![vec![9]]);
    }

    #[test]
    fn stray_bytes_before_stx_are_skipped() {
        let mut d = Deframer::new();
        let out = d.feed(&[0xAA, 0xBB, STX, 5, ETX]);
        assert_eq!(out, vec![vec![5]]);
    }

    #[test]
    fn two_frames_in_one_feed() {
        let mut d = Deframer::new();
        let out = d.feed(&[STX, 1, ETX, STX, 2, ETX]);
        assert_eq!(out, vec![vec![1], vec![2]]);
    }
}
