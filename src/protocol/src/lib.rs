// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The engine control protocol.
//!
//! This crate defines the messages exchanged between a viewer and a remote
//! compute engine, and the codec that frames them over a byte stream. The
//! protocol is deliberately small: a handshake pair ([`Message::Hello`] and
//! [`Message::Welcome`]), sequence-numbered request/reply pairs, and
//! fire-and-forget events. Payload values are self-describing trees of
//! [`Value`]s, so composite attribute data round-trips without an external
//! schema.
//!
//! The codec lives in [`codec`] and is designed for use with
//! [`tokio_util::codec::Framed`]. Decoding is resumable: the decoder retains
//! partial frames across calls and never blocks waiting for bytes.

mod codec;
mod message;

pub use codec::{Codec, CodecError, MAX_FRAME_SIZE};
pub use message::{
    ConnectionKind, FailureKind, Message, RemoteFailure, Value, ValueKind, PROTOCOL_VERSION,
};
