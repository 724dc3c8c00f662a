//! Pass-through codec for opaque gRPC message bodies.
//!
//! Services served by the bridge are only known at runtime, so no message
//! types are compiled in. [`RawCodec`] hands the transport layer the exact
//! bytes of each message: encoding writes them unchanged and decoding copies
//! the whole frame out unchanged. Compression is handled by tonic before the
//! codec sees the frame.

use bytes::{Buf, BufMut, Bytes};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// A [`Codec`] whose request and response messages are raw [`Bytes`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(item.as_ref());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        // A zero-length frame is a valid message (e.g. `google.protobuf.Empty`),
        // so always yield a body, even an empty one.
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}
