use crate::errors::*;
use amq_protocol::frame::{parse_frame, AMQPFrame};
use amq_protocol::types::parsing::parse_long_uint;
use bytes::{Buf, BytesMut};
use log::{trace, warn};

// 1-byte type, 2-byte channel, 4-byte payload length.
const FRAME_HEADER_SIZE: usize = 7;

// Header plus the single frame-end octet.
pub(crate) const FRAME_OVERHEAD: usize = 8;

// position (from start of frame) where the "size of payload" bytes are located
const FRAME_SIZE_POS: std::ops::Range<usize> = 3..7;

/// Bounded accumulator for the inbound byte stream.
///
/// Bytes are pushed in whatever chunks the transport delivers them;
/// [`drain_one`](#method.drain_one) peels off exactly one complete frame per
/// call so the event loop can interleave other work between frames.
pub(crate) struct FrameBuffer {
    buf: BytesMut,
    max_size: usize,
}

impl FrameBuffer {
    pub(crate) fn new(max_size: usize) -> FrameBuffer {
        FrameBuffer {
            buf: BytesMut::new(),
            max_size,
        }
    }

    /// Adopt a new bound; the server's negotiated frame max becomes the
    /// buffer bound after tuning.
    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    #[cfg(test)]
    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes from the transport. Exceeding the bound means we can no
    /// longer trust any frame boundary, so the whole buffer is dropped and
    /// the connection is left to the transport's own failure reporting.
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.max_size {
            warn!(
                "inbound buffer exceeded {} bytes; discarding {} buffered bytes",
                self.max_size,
                self.buf.len()
            );
            self.buf.clear();
        }
    }

    // Total size of the frame at the front of the buffer, or None if we do
    // not have a full header yet.
    fn next_frame_size(&self) -> Option<usize> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            None
        } else {
            // Parsing a u32 from 4 bytes can't fail; safe to unwrap.
            let (_, size) = parse_long_uint(&self.buf[FRAME_SIZE_POS]).unwrap();
            Some(size as usize + FRAME_OVERHEAD)
        }
    }

    pub(crate) fn has_complete_frame(&self) -> bool {
        match self.next_frame_size() {
            Some(size) => self.buf.len() >= size,
            None => false,
        }
    }

    /// Split off exactly one frame's bytes and hand them to the codec.
    /// Returns `Ok(None)` if a complete frame is not buffered yet.
    pub(crate) fn drain_one(&mut self) -> Result<Option<AMQPFrame>> {
        let size = match self.next_frame_size() {
            Some(size) if self.buf.len() >= size => size,
            _ => return Ok(None),
        };

        // parse is only successful if there were no errors _and_ it consumed
        // exactly the bytes the header told us belong to this frame.
        match parse_frame(&self.buf[..size]) {
            Ok((rest, frame)) if rest.is_empty() => {
                self.buf.advance(size);
                trace!("drained frame {:?}", frame);
                Ok(Some(frame))
            }
            _ => {
                // desync; same safety valve as overflow
                self.buf.clear();
                MalformedFrameSnafu.fail()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::OutputBuffer;
    use amq_protocol::protocol::connection::{AMQPMethod as AmqpConnection, TuneOk};
    use amq_protocol::protocol::AMQPClass;

    fn tune_ok_frame_bytes() -> Vec<u8> {
        let mut out = OutputBuffer::empty();
        out.push_method(
            7,
            AmqpConnection::TuneOk(TuneOk {
                channel_max: 9,
                frame_max: 131072,
                heartbeat: 60,
            }),
        )
        .unwrap();
        out[0..].to_vec()
    }

    fn heartbeat_frame_bytes() -> Vec<u8> {
        let mut out = OutputBuffer::empty();
        out.push_heartbeat();
        out[0..].to_vec()
    }

    #[test]
    fn whole_frame_in_one_chunk() {
        let bytes = tune_ok_frame_bytes();
        let mut buf = FrameBuffer::new(128 * 1024);
        buf.feed(&bytes);
        assert!(buf.has_complete_frame());

        match buf.drain_one().unwrap() {
            Some(AMQPFrame::Method(7, AMQPClass::Connection(AmqpConnection::TuneOk(t)))) => {
                assert_eq!(t.frame_max, 131072);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn reassembly_from_any_split() {
        let bytes = tune_ok_frame_bytes();
        for split in 1..bytes.len() {
            let mut buf = FrameBuffer::new(128 * 1024);
            buf.feed(&bytes[..split]);
            // a partial frame never drains
            assert!(buf.drain_one().unwrap().is_none());
            buf.feed(&bytes[split..]);
            match buf.drain_one().unwrap() {
                Some(AMQPFrame::Method(7, _)) => (),
                other => panic!("split {}: unexpected {:?}", split, other),
            }
            assert!(buf.drain_one().unwrap().is_none());
        }
    }

    #[test]
    fn one_frame_per_drain() {
        let mut bytes = heartbeat_frame_bytes();
        bytes.extend_from_slice(&heartbeat_frame_bytes());
        let mut buf = FrameBuffer::new(128 * 1024);
        buf.feed(&bytes);

        assert!(buf.drain_one().unwrap().is_some());
        assert!(buf.has_complete_frame());
        assert!(buf.drain_one().unwrap().is_some());
        assert!(!buf.has_complete_frame());
        assert!(buf.drain_one().unwrap().is_none());
    }

    #[test]
    fn overflow_discards_everything() {
        let bytes = tune_ok_frame_bytes();
        let mut buf = FrameBuffer::new(bytes.len() - 1);
        buf.feed(&bytes);
        assert_eq!(buf.len(), 0);
        assert!(buf.drain_one().unwrap().is_none());
    }

    #[test]
    fn overflow_applies_across_feeds() {
        let bytes = heartbeat_frame_bytes();
        let mut buf = FrameBuffer::new(bytes.len() + 2);
        buf.feed(&bytes);
        // second feed pushes total past the bound; everything goes
        buf.feed(&bytes);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn malformed_frame_clears_buffer() {
        let mut bytes = heartbeat_frame_bytes();
        let end = bytes.len() - 1;
        bytes[end] = 0x00; // corrupt the frame-end octet

        let mut buf = FrameBuffer::new(128 * 1024);
        buf.feed(&bytes);
        match buf.drain_one() {
            Err(Error::MalformedFrame) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(buf.len(), 0);
    }
}
