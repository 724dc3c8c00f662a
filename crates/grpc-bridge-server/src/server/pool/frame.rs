//! Worker wire frames.
//!
//! Each message exchanged with a worker process is one length-delimited frame
//! (4-byte big-endian length prefix, handled by
//! [`LengthDelimitedCodec`](tokio_util::codec::LengthDelimitedCodec)) whose
//! content is:
//!
//! ```text
//! [codec: u8][flags: u8][context_len: u32 BE][context][body]
//! ```
//!
//! A response with [`FLAG_ERROR`] set carries the worker's error message as
//! its body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use grpc_bridge_core::{Payload, PayloadCodec, PoolError};

/// The worker failed the call; the body is its error message.
pub const FLAG_ERROR: u8 = 0x01;

pub const HEADER_LEN: usize = 6;

/// Serializes a payload into frame content.
///
/// # Errors
///
/// Fails if the context does not fit in a `u32` length.
pub fn encode(payload: &Payload, flags: u8) -> Result<Bytes, PoolError> {
    let context_len = u32::try_from(payload.context.len()).map_err(|_| PoolError::Protocol {
        reason: format!("context of {} bytes is too large", payload.context.len()),
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.context.len() + payload.body.len());
    buf.put_u8(payload.codec.as_u8());
    buf.put_u8(flags);
    buf.put_u32(context_len);
    buf.put_slice(&payload.context);
    buf.put_slice(&payload.body);
    Ok(buf.freeze())
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Payload,
}

impl Frame {
    /// Converts a response frame into the worker's reply or its error.
    pub fn into_result(self) -> Result<Payload, PoolError> {
        if self.flags & FLAG_ERROR != 0 {
            Err(PoolError::worker(self.payload.body))
        } else {
            Ok(self.payload)
        }
    }
}

/// Parses frame content. The body shares the frame's buffer.
///
/// # Errors
///
/// Fails on a short header, an unknown codec, or a context length that runs
/// past the end of the frame.
pub fn decode(mut frame: Bytes) -> Result<Frame, PoolError> {
    if frame.len() < HEADER_LEN {
        return Err(PoolError::Protocol {
            reason: format!("frame of {} bytes is shorter than its header", frame.len()),
        });
    }

    let codec = PayloadCodec::try_from(frame.get_u8()).map_err(|tag| PoolError::Protocol {
        reason: format!("unknown payload codec {tag:#04x}"),
    })?;
    let flags = frame.get_u8();
    let context_len = frame.get_u32() as usize;

    if context_len > frame.len() {
        return Err(PoolError::Protocol {
            reason: format!(
                "context length {context_len} exceeds remaining {} bytes",
                frame.len()
            ),
        });
    }

    let context = frame.split_to(context_len).to_vec();
    Ok(Frame {
        flags,
        payload: Payload {
            codec,
            context,
            body: frame,
        },
    })
}
