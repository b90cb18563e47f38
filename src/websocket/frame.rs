// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Error;

// Frames larger than this are rejected rather than buffered.
const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub(crate) fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => return Err(Error::Protocol(format!("unknown opcode {other:#x}"))),
        })
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        match op {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Frame {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn close(code: Option<u16>) -> Self {
        let payload = match code {
            Some(code) => Bytes::copy_from_slice(&code.to_be_bytes()),
            None => Bytes::new(),
        };
        Frame::new(OpCode::Close, payload)
    }

    /// The status code carried by a close frame, if any.
    pub fn close_code(&self) -> Option<u16> {
        (self.opcode == OpCode::Close && self.payload.len() >= 2)
            .then(|| BigEndian::read_u16(&self.payload[..2]))
    }

    /// Appends the wire form of the frame to `dst`. Client frames must carry a mask.
    pub fn encode(&self, mask: Option<[u8; 4]>, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.reserve(len + 14);
        dst.put_u8(((self.fin as u8) << 7) | u8::from(self.opcode));

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                dst.put_slice(&key);
                dst.extend(
                    self.payload
                        .iter()
                        .enumerate()
                        .map(|(i, b)| b ^ key[i % 4]),
                );
            }
            None => dst.put_slice(&self.payload),
        }
    }

    /// Decodes one frame from the front of `src`, returning `None` until a full frame is
    /// buffered. Consumed bytes are removed from `src`.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (src[0], src[1]);
        if b0 & 0x70 != 0 {
            return Err(Error::Protocol("reserved bits set".to_string()));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::try_from(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;

        let (len, mut header_len) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (BigEndian::read_u16(&src[2..4]) as u64, 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                (BigEndian::read_u64(&src[2..10]), 10)
            }
            n => (n as u64, 2),
        };
        if len > MAX_PAYLOAD {
            return Err(Error::Protocol(format!("frame of {len} bytes is too large")));
        }
        if opcode.is_control() && (!fin || len > 125) {
            return Err(Error::Protocol("malformed control frame".to_string()));
        }

        let mask = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                src[header_len],
                src[header_len + 1],
                src[header_len + 2],
                src[header_len + 3],
            ];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        let len = len as usize;
        if src.len() < header_len + len {
            return Ok(None);
        }
        src.advance(header_len);
        let mut payload = src.split_to(len);
        if let Some(key) = mask {
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
        }
        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn rfc_unmasked_text() {
        // RFC 6455 section 5.7
        let mut buf = BytesMut::from(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f][..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::new(OpCode::Text, "Hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn rfc_masked_text() {
        let wire = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let mut buf = BytesMut::from(&wire[..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"Hello"));

        let mut out = BytesMut::new();
        frame.encode(Some([0x37, 0xfa, 0x21, 0x3d]), &mut out);
        assert_eq!(&out[..], &wire[..]);
    }

    #[test_case(0; "empty")]
    #[test_case(125; "short")]
    #[test_case(126; "sixteen bit length")]
    #[test_case(70_000; "sixty four bit length")]
    fn length_encodings(len: usize) {
        let frame = Frame::new(OpCode::Binary, vec![7u8; len]);
        let mut buf = BytesMut::new();
        frame.encode(Some([1, 2, 3, 4]), &mut buf);
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn partial() {
        let mut full = BytesMut::new();
        Frame::new(OpCode::Binary, vec![1u8; 300]).encode(None, &mut full);
        let mut buf = BytesMut::from(&full[..3]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[3..100]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[100..]);
        assert!(Frame::decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn close_code() {
        let mut buf = BytesMut::new();
        Frame::close(Some(1000)).encode(None, &mut buf);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.close_code(), Some(1000));
        assert_eq!(Frame::close(None).close_code(), None);
    }

    #[test]
    fn rejects_bad_frames() {
        let mut reserved = BytesMut::from(&[0xC1, 0x00][..]);
        assert!(Frame::decode(&mut reserved).is_err());
        let mut opcode = BytesMut::from(&[0x83, 0x00][..]);
        assert!(Frame::decode(&mut opcode).is_err());
        let mut fragmented_ping = BytesMut::from(&[0x09, 0x00][..]);
        assert!(Frame::decode(&mut fragmented_ping).is_err());
    }
}
