use std::io;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;
use tokio_util::codec::LengthDelimitedCodec;

use super::PacketType;
use super::QuorumPacket;
use crate::WireError;
use crate::Zxid;

/// Hard ceiling on a single frame. SNAP packets carry a full snapshot, so
/// this is generous; everything else is orders of magnitude smaller.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn new_length_delimited_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Wraps [`LengthDelimitedCodec`] with [`QuorumPacket`] body layout:
/// `type: u32, zxid: i64, payload-len: i32 + bytes, auth-len: i32 + bytes`,
/// where a length of −1 marks an absent buffer.
#[derive(Debug)]
pub struct PacketCodec {
    inner: LengthDelimitedCodec,
}

impl PacketCodec {
    pub fn new() -> Self {
        PacketCodec {
            inner: new_length_delimited_codec(),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PacketCodec {
    fn clone(&self) -> Self {
        Self::new()
    }
}

fn get_buffer(body: &mut Bytes) -> Result<Option<Bytes>, WireError> {
    if body.remaining() < 4 {
        return Err(WireError::Truncated {
            needed: 4 - body.remaining(),
        });
    }
    let len = body.get_i32();
    if len < 0 {
        if len != -1 {
            return Err(WireError::InvalidLength(len));
        }
        return Ok(None);
    }
    let len = len as usize;
    if body.remaining() < len {
        return Err(WireError::Truncated {
            needed: len - body.remaining(),
        });
    }
    Ok(Some(body.split_to(len)))
}

fn put_buffer(dst: &mut BytesMut, buf: &Option<Bytes>) {
    match buf {
        Some(bytes) => {
            dst.put_i32(bytes.len() as i32);
            dst.put_slice(bytes);
        }
        None => dst.put_i32(-1),
    }
}

fn decode_body(mut body: Bytes) -> Result<QuorumPacket, WireError> {
    if body.remaining() < 12 {
        return Err(WireError::Truncated {
            needed: 12 - body.remaining(),
        });
    }
    let ptype = PacketType::from_code(body.get_u32())?;
    let zxid = Zxid::from_i64(body.get_i64());
    let data = get_buffer(&mut body)?;
    let auth = get_buffer(&mut body)?;
    Ok(QuorumPacket {
        ptype,
        zxid,
        data,
        auth,
    })
}

fn encode_body(packet: &QuorumPacket) -> Bytes {
    let body_len = 12
        + 8
        + packet.data.as_ref().map(Bytes::len).unwrap_or(0)
        + packet.auth.as_ref().map(Bytes::len).unwrap_or(0);
    let mut body = BytesMut::with_capacity(body_len);
    body.put_u32(packet.ptype.code());
    body.put_i64(packet.zxid.as_i64());
    put_buffer(&mut body, &packet.data);
    put_buffer(&mut body, &packet.auth);
    body.freeze()
}

impl Decoder for PacketCodec {
    type Item = QuorumPacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(body) => {
                let packet = decode_body(body.freeze())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<QuorumPacket> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, packet: QuorumPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(encode_body(&packet), dst)
    }
}
