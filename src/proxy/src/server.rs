// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The engine half of a connection: accept, authenticate, dispatch.

use std::sync::Arc;

use anyhow::bail;
use futures::{SinkExt, StreamExt, TryStreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};
use uuid::Uuid;

use vz_protocol::{Codec, Message, PROTOCOL_VERSION};
use vz_rpc::{EventSink, Registry};

use crate::HANDSHAKE_TIMEOUT;

/// Serves engine connections on `listener` until the listener fails.
///
/// Each accepted connection is authenticated against `secret` and then
/// dispatches its requests through `registry`. Connections are independent:
/// a failure on one never affects another.
pub async fn serve(
    listener: TcpListener,
    secret: String,
    registry: Arc<Registry>,
) -> anyhow::Result<()> {
    info!(address = %listener.local_addr()?, "listening for viewer connections");
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "accepted viewer connection");

        let secret = secret.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, secret, registry).await {
                info!(%peer, "connection ended: {:#}", err);
            }
        });
    }
}

/// Drives one authenticated connection to completion.
async fn serve_connection(
    stream: TcpStream,
    secret: String,
    registry: Arc<Registry>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, Codec::new());

    // The first frame must be a Hello. Rejection is uniform: whatever is
    // wrong with the handshake, the client sees the same refusal frame and
    // a closed transport, nothing else.
    let hello = time::timeout(HANDSHAKE_TIMEOUT, framed.try_next()).await;
    let (kind, version) = match hello {
        Ok(Ok(Some(Message::Hello {
            secret: presented,
            kind,
            version,
        }))) if presented == secret => (kind, version),
        _ => {
            debug!("refusing connection");
            framed
                .send(Message::Welcome {
                    accepted: false,
                    version: PROTOCOL_VERSION,
                })
                .await?;
            return Ok(());
        }
    };

    let version = version.min(PROTOCOL_VERSION);
    framed
        .send(Message::Welcome {
            accepted: true,
            version,
        })
        .await?;

    let session_id = Uuid::new_v4();
    info!(session = %session_id, %kind, version, "session established");

    // Replies and events share the outgoing channel but are produced
    // independently: each request is dispatched on its own task, so a slow
    // handler delays neither events nor the replies of other requests.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (mut sink, mut stream) = framed.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            trace!(send = msg.name(), "sending frame");
            if let Err(err) = sink.send(msg).await {
                debug!("send error: {}", err);
                break;
            }
        }
    });

    let result = loop {
        match stream.try_next().await {
            Ok(Some(Message::Request { seq, method, args })) => {
                trace!(session = %session_id, seq, %method, "dispatching request");
                let registry = Arc::clone(&registry);
                let events = EventSink::new(out_tx.clone());
                let replies = out_tx.clone();
                tokio::spawn(async move {
                    let reply = registry.dispatch(seq, &method, args, events).await;
                    // The connection may have closed while the handler ran.
                    let _ = replies.send(reply);
                });
            }
            Ok(Some(other)) => {
                break Err(anyhow::anyhow!("unexpected {} frame from viewer", other.name()));
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err.into()),
        }
    };

    // Closing our half of the outgoing channel lets the writer drain any
    // replies already produced before it exits; in-flight dispatch tasks
    // holding clones keep it alive until they finish.
    drop(out_tx);
    match result {
        Ok(()) => {
            info!(session = %session_id, "viewer disconnected");
            Ok(())
        }
        Err(err) => {
            writer.abort();
            bail!("session {} torn down: {:#}", session_id, err);
        }
    }
}
