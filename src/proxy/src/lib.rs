// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Connection management for remote compute engines.
//!
//! A viewer drives one or more long-running engine processes through this
//! crate. The client side is [`EngineProxy`]: it owns the transport to one
//! engine, performs the authentication handshake, multiplexes concurrent
//! calls over one session by sequence number, and fans incoming events out
//! to topic subscribers. The engine side is [`serve`]: an accept loop that
//! authenticates each connection and dispatches its requests through a
//! [`vz_rpc::Registry`].
//!
//! When the viewer launches the engine itself rather than attaching to a
//! running one, an [`EngineSupervisor`] tracks the child's liveness and
//! [`EngineProxy::supervise`] turns its exit into an [`SessionFault::EngineDied`]
//! failure of every pending operation, so no caller is left suspended on a
//! dead process.
//!
//! Connection configuration is explicit: every piece of bootstrap state
//! (host, port, shared secret, connection kind) lives in an [`Endpoint`]
//! value passed to [`EngineProxy::connect`]. There is no process-wide
//! connection state.

mod client;
mod server;
mod supervisor;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vz_protocol::ConnectionKind;

pub use client::{EngineProxy, Subscription};
pub use server::serve;
pub use supervisor::{EngineSupervisor, LaunchConfig};

/// How long [`EngineProxy::connect`] waits for the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long each side waits for the other's handshake frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how to reach an engine.
///
/// The endpoint is immutable once the handshake begins; reconnecting with
/// different parameters means constructing a new endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address of the engine.
    pub host: String,
    /// Port the engine listens on.
    pub port: u16,
    /// The shared secret presented during the handshake.
    pub secret: String,
    /// The connection kind declared to the engine.
    pub kind: ConnectionKind,
}

impl Endpoint {
    /// The `host:port` address string for this endpoint.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A condition that terminated the session.
///
/// Faults are session-fatal: the first fault recorded on a session is
/// surfaced to every caller with a pending operation and to every
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFault {
    /// The peer violated the framing protocol. The byte stream can no
    /// longer be trusted, so the session is torn down.
    #[error("corrupt frame: {0}")]
    Corrupt(String),
    /// The transport failed or was closed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The supervised engine process exited.
    #[error("engine process died: {0}")]
    EngineDied(String),
}

/// An error establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport could not be established within the bounded timeout.
    #[error("engine unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },
    /// The engine rejected the handshake.
    ///
    /// The rejection is uniform: it carries no indication of why.
    #[error("engine rejected the connection")]
    Auth,
    /// The handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// An error from a single call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The reply did not arrive within the caller's timeout.
    ///
    /// The remote outcome is unknown: the engine may still have executed
    /// the request. Idempotency of retries is the caller's responsibility.
    #[error("call timed out; the engine may still have executed it")]
    Timeout,
    /// The engine does not implement the requested method.
    #[error("no such method: {0}")]
    MethodNotFound(String),
    /// The engine reported an application-level failure. The session is
    /// unaffected.
    #[error("engine reported an error: {0}")]
    Remote(String),
    /// The session ended before the reply arrived.
    #[error(transparent)]
    Session(#[from] SessionFault),
}
