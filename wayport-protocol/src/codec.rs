//! Wire framing for the control connection
//!
//! Every event of the exchange vocabulary (`request`, `*-pipe`, `*-pipes`,
//! `*-pipe-end`, `*-pipe-error`, `request-error`, `response`) and every
//! control frame travels as one length-delimited record:
//!
//! ```text
//! +----------------+-------------------------------------------+
//! | length: u32 BE | bincode (standard config) of one `Frame`  |
//! +----------------+-------------------------------------------+
//! ```
//!
//! The serialized enum tag names the event and the request id rides inside
//! the variant, so the peer demultiplexes without relying on arrival order.
//! Records larger than the configured cap are rejected in both directions;
//! on decode this happens before the body is buffered.

use crate::constants::MAX_FRAME_SIZE;
use crate::frame::Frame;
use bytes::{Buf, BufMut, BytesMut};
use std::cell::RefCell;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix
const LENGTH_PREFIX: usize = 4;

const SCRATCH_CAPACITY: usize = 8192;

thread_local! {
    /// Per-thread scratch space reused by every encode on that thread
    static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Length-delimited bincode codec for [`Frame`]s
#[derive(Debug, Clone, Copy)]
pub struct TunnelCodec {
    max_frame_size: usize,
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE as usize)
    }
}

impl TunnelCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap on one record body, the length prefix excluded
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_size(&self, len: usize) -> io::Result<()> {
        if len > self.max_frame_size {
            return Err(invalid(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

impl Decoder for TunnelCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(prefix) = src.get(..LENGTH_PREFIX) else {
            return Ok(None);
        };
        let mut len = [0u8; LENGTH_PREFIX];
        len.copy_from_slice(prefix);
        let len = u32::from_be_bytes(len) as usize;
        self.check_size(len)?;

        let record = LENGTH_PREFIX + len;
        if src.len() < record {
            src.reserve(record - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        let (frame, _) = bincode_next::serde::decode_from_slice(&body, bincode_next::config::standard())
            .map_err(|e| invalid(format!("undecodable frame: {e}")))?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for TunnelCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        SCRATCH.with(|scratch| {
            let mut body = scratch.borrow_mut();
            body.clear();
            body.reserve(SCRATCH_CAPACITY);

            bincode_next::serde::encode_into_std_write(&frame, &mut *body, bincode_next::config::standard())
                .map_err(|e| invalid(format!("unencodable {} frame: {e}", frame.event_name())))?;

            self.check_size(body.len())?;
            let len = u32::try_from(body.len()).map_err(|_| invalid("frame length overflows u32".into()))?;

            dst.reserve(LENGTH_PREFIX + body.len());
            dst.put_u32(len);
            dst.extend_from_slice(&body);
            Ok(())
        })
    }
}
