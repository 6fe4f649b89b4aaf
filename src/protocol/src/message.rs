// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Message types for the engine control protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The protocol version spoken by this crate.
///
/// The handshake negotiates the minimum of the two endpoints' versions. There
/// is no compatibility machinery beyond that: endpoints that cannot agree on
/// a version refuse the connection.
pub const PROTOCOL_VERSION: u32 = 1;

/// The kind of connection a client declares in its [`Message::Hello`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// A connection driven by an interactive client.
    Interactive,
    /// A headless connection with no user attached.
    None,
}

impl ConnectionKind {
    /// Returns the wire representation of the connection kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Interactive => "interactive",
            ConnectionKind::None => "none",
        }
    }

    /// Parses a wire representation produced by [`ConnectionKind::as_str`].
    pub fn from_str(s: &str) -> Option<ConnectionKind> {
        match s {
            "interactive" => Some(ConnectionKind::Interactive),
            "none" => Some(ConnectionKind::None),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A self-describing payload value.
///
/// Values nest arbitrarily. The `Node` variant carries a name and an ordered
/// list of children, which is sufficient to represent the name/value
/// attribute trees that engine commands traffic in.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Node(String, Vec<Value>),
}

impl Value {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Node(_, _) => ValueKind::Node,
        }
    }
}

/// The kind of a [`Value`], without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    List,
    Node,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
            ValueKind::Node => "node",
        };
        f.write_str(name)
    }
}

/// The class of an application-level failure reported in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The requested method is not registered on the remote side.
    MethodNotFound,
    /// The arguments did not match the method's declared signature.
    InvalidArgs,
    /// The handler ran and failed.
    Error,
}

/// An application-level failure carried in a reply.
///
/// These are scoped to the single call that produced them. They never
/// terminate the session.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            FailureKind::MethodNotFound => write!(f, "no such method: {}", self.message),
            FailureKind::InvalidArgs => write!(f, "invalid arguments: {}", self.message),
            FailureKind::Error => f.write_str(&self.message),
        }
    }
}

/// A protocol message.
///
/// The handshake variants appear exactly once per connection, as the first
/// frame in each direction. Every reply's sequence number matches exactly one
/// outstanding request. Events carry no sequence number and expect no reply;
/// they are ordered relative to each other on one session but not relative to
/// requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client credentials and connection declaration, sent first.
    Hello {
        secret: String,
        kind: ConnectionKind,
        version: u32,
    },
    /// The server's verdict on a `Hello`.
    Welcome { accepted: bool, version: u32 },
    /// An imperative call.
    Request {
        seq: u64,
        method: String,
        args: Vec<Value>,
    },
    /// The outcome of the request with the matching sequence number.
    Reply {
        seq: u64,
        outcome: Result<Value, RemoteFailure>,
    },
    /// An asynchronous notification on a topic.
    Event { topic: String, payload: Value },
}

impl Message {
    /// Returns the name of the message kind, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Welcome { .. } => "welcome",
            Message::Request { .. } => "request",
            Message::Reply { .. } => "reply",
            Message::Event { .. } => "event",
        }
    }
}
