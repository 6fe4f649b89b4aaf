// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Encoding/decoding of engine control protocol frames.
//!
//! Each frame is a one-byte message kind, a big-endian `u32` payload length,
//! and the payload itself. Payloads are self-describing: every value carries
//! a type tag, recursively, so nested attribute trees decode without an
//! external schema.
//!
//! The decoder is a resumable state machine. A partial frame leaves the
//! buffer untouched and yields `Ok(None)`; the caller appends more bytes and
//! retries. Any structural violation is a hard error that must terminate the
//! session, since frame boundaries can no longer be trusted.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{ConnectionKind, FailureKind, Message, RemoteFailure, Value};

/// The maximum allowable payload size of a single frame.
///
/// Frames claiming a larger payload are rejected before any allocation.
pub const MAX_FRAME_SIZE: usize = 16 << 20;

/// Maximum nesting depth of a decoded [`Value`].
const MAX_VALUE_DEPTH: usize = 64;

const KIND_HELLO: u8 = b'H';
const KIND_WELCOME: u8 = b'W';
const KIND_REQUEST: u8 = b'Q';
const KIND_REPLY: u8 = b'R';
const KIND_EVENT: u8 = b'E';

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_NODE: u8 = 7;

/// An error encoding or decoding a protocol frame.
///
/// Every variant except `Io` indicates a framing violation that is fatal to
/// the session.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A frame declared a payload larger than [`MAX_FRAME_SIZE`].
    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_SIZE} byte ceiling")]
    FrameTooBig(usize),
    /// A frame carried an unknown message kind byte.
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    /// A frame payload did not decode as its declared kind.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The underlying transport failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    fn malformed(what: impl Into<String>) -> CodecError {
        CodecError::Malformed(what.into())
    }
}

/// A codec for protocol frames, for use with
/// [`Framed`](tokio_util::codec::Framed).
///
/// The codec itself performs no I/O and holds no resources other than the
/// decode state, so it is cheap to construct per connection.
#[derive(Debug)]
pub struct Codec {
    decode_state: DecodeState,
}

#[derive(Debug)]
enum DecodeState {
    /// Waiting for a complete frame header.
    Head,
    /// Waiting for the payload of a frame whose header has been read.
    Data(u8, usize),
}

impl Codec {
    /// Creates a new `Codec`.
    pub fn new() -> Codec {
        Codec {
            decode_state: DecodeState::Head,
        }
    }
}

impl Default for Codec {
    fn default() -> Codec {
        Codec::new()
    }
}

impl Encoder<Message> for Codec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let byte = match &msg {
            Message::Hello { .. } => KIND_HELLO,
            Message::Welcome { .. } => KIND_WELCOME,
            Message::Request { .. } => KIND_REQUEST,
            Message::Reply { .. } => KIND_REPLY,
            Message::Event { .. } => KIND_EVENT,
        };
        dst.put_u8(byte);

        // Write a length placeholder. The true length is filled in later.
        let base = dst.len();
        dst.put_u32(0);

        match msg {
            Message::Hello {
                secret,
                kind,
                version,
            } => {
                put_string(dst, &secret);
                put_string(dst, kind.as_str());
                dst.put_u32(version);
            }
            Message::Welcome { accepted, version } => {
                dst.put_u8(u8::from(accepted));
                dst.put_u32(version);
            }
            Message::Request { seq, method, args } => {
                dst.put_u64(seq);
                put_string(dst, &method);
                dst.put_u32(args.len().try_into().map_err(|_| {
                    CodecError::malformed("request argument count does not fit into a u32")
                })?);
                for arg in &args {
                    put_value(dst, arg);
                }
            }
            Message::Reply { seq, outcome } => {
                dst.put_u64(seq);
                match outcome {
                    Ok(value) => {
                        dst.put_u8(0);
                        put_value(dst, &value);
                    }
                    Err(failure) => {
                        dst.put_u8(1);
                        let kind = match failure.kind {
                            FailureKind::MethodNotFound => 0,
                            FailureKind::InvalidArgs => 1,
                            FailureKind::Error => 2,
                        };
                        dst.put_u8(kind);
                        put_string(dst, &failure.message);
                    }
                }
            }
            Message::Event { topic, payload } => {
                put_string(dst, &topic);
                put_value(dst, &payload);
            }
        }

        // Overwrite the placeholder with the true payload length.
        let len = dst.len() - base - 4;
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooBig(len));
        }
        let len = u32::try_from(len).expect("bounded by MAX_FRAME_SIZE");
        dst[base..base + 4].copy_from_slice(&len.to_be_bytes());

        Ok(())
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            match self.decode_state {
                DecodeState::Head => {
                    if src.len() < 5 {
                        src.reserve(5);
                        return Ok(None);
                    }
                    let msg_kind = src[0];
                    let frame_len =
                        usize::try_from(u32::from_be_bytes([src[1], src[2], src[3], src[4]]))
                            .expect("u32 fits in usize");
                    if frame_len > MAX_FRAME_SIZE {
                        return Err(CodecError::FrameTooBig(frame_len));
                    }
                    src.advance(5);
                    src.reserve(frame_len);
                    self.decode_state = DecodeState::Data(msg_kind, frame_len);
                }

                DecodeState::Data(msg_kind, frame_len) => {
                    if src.len() < frame_len {
                        return Ok(None);
                    }
                    let buf = src.split_to(frame_len).freeze();
                    let mut buf = Cursor::new(&buf);
                    let msg = match msg_kind {
                        KIND_HELLO => decode_hello(&mut buf)?,
                        KIND_WELCOME => decode_welcome(&mut buf)?,
                        KIND_REQUEST => decode_request(&mut buf)?,
                        KIND_REPLY => decode_reply(&mut buf)?,
                        KIND_EVENT => decode_event(&mut buf)?,
                        _ => return Err(CodecError::UnknownKind(msg_kind)),
                    };
                    if buf.remaining() != 0 {
                        return Err(CodecError::malformed(format!(
                            "{} bytes of trailing garbage after {} payload",
                            buf.remaining(),
                            msg.name(),
                        )));
                    }
                    src.reserve(5);
                    self.decode_state = DecodeState::Head;
                    return Ok(Some(msg));
                }
            }
        }
    }
}

fn put_string(dst: &mut BytesMut, s: &str) {
    // Strings are bounded by MAX_FRAME_SIZE, which fits a u32; oversized
    // frames are caught when the length placeholder is backfilled.
    dst.put_u32(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

fn put_value(dst: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => dst.put_u8(TAG_NULL),
        Value::Bool(b) => {
            dst.put_u8(TAG_BOOL);
            dst.put_u8(u8::from(*b));
        }
        Value::Int(i) => {
            dst.put_u8(TAG_INT);
            dst.put_i64(*i);
        }
        Value::Float(f) => {
            dst.put_u8(TAG_FLOAT);
            dst.put_u64(f.to_bits());
        }
        Value::Text(s) => {
            dst.put_u8(TAG_TEXT);
            put_string(dst, s);
        }
        Value::Bytes(b) => {
            dst.put_u8(TAG_BYTES);
            dst.put_u32(b.len() as u32);
            dst.put_slice(b);
        }
        Value::List(items) => {
            dst.put_u8(TAG_LIST);
            dst.put_u32(items.len() as u32);
            for item in items {
                put_value(dst, item);
            }
        }
        Value::Node(name, children) => {
            dst.put_u8(TAG_NODE);
            put_string(dst, name);
            dst.put_u32(children.len() as u32);
            for child in children {
                put_value(dst, child);
            }
        }
    }
}

/// A reader over a single frame's payload.
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::malformed(format!(
                "payload truncated: needed {} bytes, {} remain",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.read_exact(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.read_exact(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64()? as i64)
    }

    /// Reads a length, verifying that at least `min_each` bytes per counted
    /// item remain, so a hostile length cannot force a huge allocation.
    fn read_count(&mut self, min_each: usize) -> Result<usize, CodecError> {
        let count = usize::try_from(self.read_u32()?).expect("u32 fits in usize");
        if count.saturating_mul(min_each) > self.buf.len() {
            return Err(CodecError::malformed(format!(
                "claimed count {} exceeds remaining payload",
                count
            )));
        }
        Ok(count)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_count(1)?;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::malformed("string is not valid UTF-8"))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_count(1)?;
        Ok(self.read_exact(len)?.to_vec())
    }
}

fn decode_hello(buf: &mut Cursor) -> Result<Message, CodecError> {
    let secret = buf.read_string()?;
    let kind = buf.read_string()?;
    let kind = ConnectionKind::from_str(&kind)
        .ok_or_else(|| CodecError::malformed(format!("unknown connection kind {:?}", kind)))?;
    let version = buf.read_u32()?;
    Ok(Message::Hello {
        secret,
        kind,
        version,
    })
}

fn decode_welcome(buf: &mut Cursor) -> Result<Message, CodecError> {
    let accepted = match buf.read_u8()? {
        0 => false,
        1 => true,
        b => return Err(CodecError::malformed(format!("bad welcome verdict {}", b))),
    };
    let version = buf.read_u32()?;
    Ok(Message::Welcome { accepted, version })
}

fn decode_request(buf: &mut Cursor) -> Result<Message, CodecError> {
    let seq = buf.read_u64()?;
    let method = buf.read_string()?;
    let argc = buf.read_count(1)?;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(decode_value(buf, 0)?);
    }
    Ok(Message::Request { seq, method, args })
}

fn decode_reply(buf: &mut Cursor) -> Result<Message, CodecError> {
    let seq = buf.read_u64()?;
    let outcome = match buf.read_u8()? {
        0 => Ok(decode_value(buf, 0)?),
        1 => {
            let kind = match buf.read_u8()? {
                0 => FailureKind::MethodNotFound,
                1 => FailureKind::InvalidArgs,
                2 => FailureKind::Error,
                b => {
                    return Err(CodecError::malformed(format!("bad failure kind {}", b)));
                }
            };
            let message = buf.read_string()?;
            Err(RemoteFailure { kind, message })
        }
        b => return Err(CodecError::malformed(format!("bad reply outcome tag {}", b))),
    };
    Ok(Message::Reply { seq, outcome })
}

fn decode_event(buf: &mut Cursor) -> Result<Message, CodecError> {
    let topic = buf.read_string()?;
    let payload = decode_value(buf, 0)?;
    Ok(Message::Event { topic, payload })
}

fn decode_value(buf: &mut Cursor, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(CodecError::malformed(format!(
            "value nesting exceeds depth {}",
            MAX_VALUE_DEPTH
        )));
    }
    let value = match buf.read_u8()? {
        TAG_NULL => Value::Null,
        TAG_BOOL => match buf.read_u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            b => return Err(CodecError::malformed(format!("bad bool encoding {}", b))),
        },
        TAG_INT => Value::Int(buf.read_i64()?),
        TAG_FLOAT => Value::Float(f64::from_bits(buf.read_u64()?)),
        TAG_TEXT => Value::Text(buf.read_string()?),
        TAG_BYTES => Value::Bytes(buf.read_bytes()?),
        TAG_LIST => {
            let count = buf.read_count(1)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(buf, depth + 1)?);
            }
            Value::List(items)
        }
        TAG_NODE => {
            let name = buf.read_string()?;
            let count = buf.read_count(1)?;
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                children.push(decode_value(buf, depth + 1)?);
            }
            Value::Node(name, children)
        }
        tag => return Err(CodecError::malformed(format!("unknown value tag {}", tag))),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::message::PROTOCOL_VERSION;

    fn encode_one(msg: Message) -> BytesMut {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).expect("encodable");
        buf
    }

    fn decode_one(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        Codec::new().decode(buf)
    }

    fn round_trip(msg: Message) {
        let mut buf = encode_one(msg.clone());
        let decoded = decode_one(&mut buf).expect("decodable").expect("complete");
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    fn attr_tree() -> Value {
        Value::Node(
            "PseudocolorAttributes".into(),
            vec![
                Value::Node("min".into(), vec![Value::Float(0.25)]),
                Value::Node("max".into(), vec![Value::Float(13.5)]),
                Value::Node(
                    "colorTable".into(),
                    vec![Value::Text("hot".into()), Value::Bool(true)],
                ),
                Value::List(vec![Value::Int(-3), Value::Null]),
            ],
        )
    }

    #[test]
    fn round_trip_handshake() {
        round_trip(Message::Hello {
            secret: "bob".into(),
            kind: ConnectionKind::Interactive,
            version: PROTOCOL_VERSION,
        });
        round_trip(Message::Hello {
            secret: String::new(),
            kind: ConnectionKind::None,
            version: 7,
        });
        round_trip(Message::Welcome {
            accepted: true,
            version: 1,
        });
        round_trip(Message::Welcome {
            accepted: false,
            version: 0,
        });
    }

    #[test]
    fn round_trip_request_reply_event() {
        round_trip(Message::Request {
            seq: u64::MAX,
            method: "AddPlot".into(),
            args: vec![Value::Text("Pseudocolor".into()), attr_tree()],
        });
        round_trip(Message::Reply {
            seq: 42,
            outcome: Ok(attr_tree()),
        });
        round_trip(Message::Reply {
            seq: 42,
            outcome: Err(RemoteFailure {
                kind: FailureKind::MethodNotFound,
                message: "AddPolt".into(),
            }),
        });
        round_trip(Message::Event {
            topic: "render-complete".into(),
            payload: Value::Bytes(vec![0, 1, 2, 255]),
        });
    }

    #[test]
    fn streaming_decode_is_resumable() {
        let mut whole = BytesMut::new();
        let mut codec = Codec::new();
        let messages = vec![
            Message::Request {
                seq: 1,
                method: "OpenDatabase".into(),
                args: vec![Value::Text("noise.silo".into())],
            },
            Message::Event {
                topic: "status".into(),
                payload: Value::Int(50),
            },
            Message::Reply {
                seq: 1,
                outcome: Ok(Value::Null),
            },
        ];
        for msg in &messages {
            codec.encode(msg.clone(), &mut whole).unwrap();
        }

        // Feed the stream one byte at a time; the decoder must produce the
        // same sequence it would for the whole buffer.
        let mut decoder = Codec::new();
        let mut partial = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in &whole[..] {
            partial.extend_from_slice(&[*byte]);
            while let Some(msg) = decoder.decode(&mut partial).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, messages);
    }

    #[test]
    fn oversized_frame_is_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Q');
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        match decode_one(&mut buf) {
            Err(CodecError::FrameTooBig(_)) => (),
            other => panic!("expected FrameTooBig, got {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_is_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'z');
        buf.put_u32(0);
        match decode_one(&mut buf) {
            Err(CodecError::UnknownKind(b'z')) => (),
            other => panic!("expected UnknownKind, got {:?}", other),
        }
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let mut buf = encode_one(Message::Event {
            topic: "render-complete".into(),
            payload: Value::Text("done".into()),
        });
        // Shorten the declared payload so the string length inside overruns.
        let declared = buf.len() - 5;
        buf.truncate(buf.len() - 2);
        buf[1..5].copy_from_slice(&u32::try_from(declared - 2).unwrap().to_be_bytes());
        match decode_one(&mut buf) {
            Err(CodecError::Malformed(_)) => (),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn trailing_garbage_is_corrupt() {
        let mut buf = encode_one(Message::Welcome {
            accepted: true,
            version: 1,
        });
        let declared = buf.len() - 5;
        buf.put_u8(0xaa);
        buf[1..5].copy_from_slice(&u32::try_from(declared + 1).unwrap().to_be_bytes());
        match decode_one(&mut buf) {
            Err(CodecError::Malformed(_)) => (),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn hostile_count_is_rejected_without_allocation() {
        // An event frame whose payload claims a list of u32::MAX elements.
        let mut buf = BytesMut::new();
        buf.put_u8(b'E');
        let base = buf.len();
        buf.put_u32(0);
        put_string(&mut buf, "t");
        buf.put_u8(TAG_LIST);
        buf.put_u32(u32::MAX);
        let len = u32::try_from(buf.len() - base - 4).unwrap();
        buf[base..base + 4].copy_from_slice(&len.to_be_bytes());
        match decode_one(&mut buf) {
            Err(CodecError::Malformed(_)) => (),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1e12f64..1e12f64).prop_map(Value::Float),
            "[a-zA-Z0-9 ._-]{0,24}".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                ("[a-z]{1,12}", proptest::collection::vec(inner, 0..4))
                    .prop_map(|(name, children)| Value::Node(name, children)),
            ]
        })
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            ("[ -~]{0,16}", any::<bool>(), any::<u32>()).prop_map(|(secret, interactive, version)| {
                Message::Hello {
                    secret,
                    kind: if interactive {
                        ConnectionKind::Interactive
                    } else {
                        ConnectionKind::None
                    },
                    version,
                }
            }),
            (any::<bool>(), any::<u32>())
                .prop_map(|(accepted, version)| Message::Welcome { accepted, version }),
            (
                any::<u64>(),
                "[A-Za-z]{1,16}",
                proptest::collection::vec(arb_value(), 0..4)
            )
                .prop_map(|(seq, method, args)| Message::Request { seq, method, args }),
            (any::<u64>(), arb_value())
                .prop_map(|(seq, value)| Message::Reply {
                    seq,
                    outcome: Ok(value)
                }),
            (any::<u64>(), 0..3u8, "[ -~]{0,32}").prop_map(|(seq, kind, message)| {
                let kind = match kind {
                    0 => FailureKind::MethodNotFound,
                    1 => FailureKind::InvalidArgs,
                    _ => FailureKind::Error,
                };
                Message::Reply {
                    seq,
                    outcome: Err(RemoteFailure { kind, message }),
                }
            }),
            ("[a-z-]{1,16}", arb_value())
                .prop_map(|(topic, payload)| Message::Event { topic, payload }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn message_round_trip(msg in arb_message()) {
            let mut buf = encode_one(msg.clone());
            let decoded = decode_one(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, msg);
            prop_assert!(buf.is_empty());
        }
    }
}
