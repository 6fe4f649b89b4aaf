// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client half of an engine connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt, TryStreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace};
use uuid::Uuid;

use vz_protocol::{Codec, CodecError, FailureKind, Message, RemoteFailure, Value, PROTOCOL_VERSION};

use crate::supervisor::EngineSupervisor;
use crate::{CallError, ConnectError, Endpoint, SessionFault, CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT};

/// Outstanding messages buffered towards the transport.
const SEND_QUEUE_DEPTH: usize = 1024;

type ReplyTx = oneshot::Sender<Result<Value, RemoteFailure>>;

/// The authenticated state of one logical connection.
#[derive(Debug)]
struct Session {
    id: Uuid,
    version: u32,
    seq: AtomicU64,
}

impl Session {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// State shared between the proxy handle and its connection tasks.
#[derive(Debug)]
struct Shared {
    /// Callers awaiting the reply with their sequence number.
    pending: Mutex<HashMap<u64, ReplyTx>>,
    /// Topic subscribers.
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
    /// The first session-fatal condition, if any.
    fault: watch::Sender<Option<SessionFault>>,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            pending: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            fault: watch::Sender::new(None),
        }
    }

    fn fault(&self) -> Option<SessionFault> {
        self.fault.borrow().clone()
    }

    /// Records the session's terminal condition and releases every waiter.
    ///
    /// Only the first fault sticks; later ones are reported at debug level
    /// and dropped.
    fn fail(&self, fault: SessionFault) {
        let recorded = self.fault.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(fault.clone());
                true
            } else {
                false
            }
        });
        if !recorded {
            debug!(%fault, "session already failed; dropping fault");
            return;
        }
        // Dropping the reply senders wakes pending callers, which then read
        // the fault; dropping the topic senders ends every subscription.
        self.pending.lock().expect("lock poisoned").clear();
        self.topics.lock().expect("lock poisoned").clear();
    }

    /// Routes one incoming message, or reports why the session must end.
    fn route(&self, msg: Message) -> Result<(), SessionFault> {
        match msg {
            Message::Reply { seq, outcome } => {
                let tx = self.pending.lock().expect("lock poisoned").remove(&seq);
                match tx {
                    Some(tx) => {
                        // The caller may have timed out between our map
                        // lookup and this send; that drop is harmless.
                        let _ = tx.send(outcome);
                    }
                    None => trace!(seq, "discarding reply for cancelled call"),
                }
                Ok(())
            }
            Message::Event { topic, payload } => {
                let mut topics = self.topics.lock().expect("lock poisoned");
                if let Some(mut subscribers) = topics.remove(&topic) {
                    subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
                    if !subscribers.is_empty() {
                        topics.insert(topic, subscribers);
                    }
                }
                Ok(())
            }
            other => Err(SessionFault::Corrupt(format!(
                "unexpected {} frame from engine",
                other.name()
            ))),
        }
    }
}

/// A lazy, unbounded sequence of events on one topic.
///
/// The subscription ends (yields `None`) when the session ends or the
/// proxy disconnects; dropping it cancels the subscription. It cannot be
/// restarted; subscribe again for a fresh sequence.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Waits for the next event payload on this topic.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// The local handle for one connection to a remote engine.
///
/// One proxy serves many concurrent callers: [`EngineProxy::call`] suspends
/// only the calling task, and replies arriving out of request order are
/// routed back to the caller whose sequence number they carry.
#[derive(Debug)]
pub struct EngineProxy {
    session: Session,
    msg_tx: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<AbortOnDropHandle<()>>>,
}

impl EngineProxy {
    /// Connects to the engine at `endpoint` and performs the handshake.
    ///
    /// Fails with [`ConnectError::Unreachable`] if the transport cannot be
    /// established within [`CONNECT_TIMEOUT`], and with
    /// [`ConnectError::Auth`] if the engine rejects the credentials.
    pub async fn connect(endpoint: &Endpoint) -> Result<EngineProxy, ConnectError> {
        let address = endpoint.address();
        let unreachable = |reason: String| ConnectError::Unreachable {
            address: address.clone(),
            reason,
        };

        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| unreachable("connect timed out".into()))?
            .map_err(|err| unreachable(err.to_string()))?;
        stream.set_nodelay(true).ok();

        let mut framed = Framed::new(stream, Codec::new());
        framed
            .send(Message::Hello {
                secret: endpoint.secret.clone(),
                kind: endpoint.kind,
                version: PROTOCOL_VERSION,
            })
            .await
            .map_err(|err| ConnectError::Handshake(err.to_string()))?;

        let welcome = time::timeout(HANDSHAKE_TIMEOUT, framed.try_next())
            .await
            .map_err(|_| ConnectError::Handshake("handshake timed out".into()))?
            .map_err(|err| ConnectError::Handshake(err.to_string()))?;
        let version = match welcome {
            Some(Message::Welcome {
                accepted: true,
                version,
            }) => version.min(PROTOCOL_VERSION),
            Some(Message::Welcome {
                accepted: false, ..
            }) => return Err(ConnectError::Auth),
            Some(other) => {
                return Err(ConnectError::Handshake(format!(
                    "unexpected {} frame",
                    other.name()
                )));
            }
            None => {
                return Err(ConnectError::Handshake(
                    "connection closed during handshake".into(),
                ));
            }
        };

        let session = Session {
            id: Uuid::new_v4(),
            version,
            seq: AtomicU64::new(1),
        };
        info!(session = %session.id, %address, version, "connected to engine");

        let shared = Arc::new(Shared::new());
        let (msg_tx, msg_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (sink, stream) = framed.split();

        let send_task = tokio::spawn(Self::run_send_task(sink, msg_rx, Arc::clone(&shared)));
        let recv_task = tokio::spawn(Self::run_recv_task(stream, Arc::clone(&shared)));

        Ok(EngineProxy {
            session,
            msg_tx,
            shared,
            tasks: Mutex::new(vec![
                AbortOnDropHandle::new(send_task),
                AbortOnDropHandle::new(recv_task),
            ]),
        })
    }

    /// The session identifier assigned at connect time.
    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    /// The protocol version negotiated during the handshake.
    pub fn protocol_version(&self) -> u32 {
        self.session.version
    }

    /// The session's terminal condition, if it has ended.
    pub fn fault(&self) -> Option<SessionFault> {
        self.shared.fault()
    }

    /// Invokes `method` on the engine and waits for its reply.
    ///
    /// Suspends only the calling task. Concurrent calls on one proxy are
    /// multiplexed by sequence number; each caller receives exactly the
    /// reply matching its own request, regardless of arrival order.
    ///
    /// On [`CallError::Timeout`] the call is cancelled locally and a late
    /// reply is discarded, but the engine may still have executed the
    /// request.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let seq = self.session.next_seq();
        let (tx, rx) = oneshot::channel();
        {
            // Checked under the pending lock: `fail` records the fault
            // before clearing this map, so we either observe the fault here
            // or our entry is cleared along with the rest.
            let mut pending = self.shared.pending.lock().expect("lock poisoned");
            if let Some(fault) = self.shared.fault() {
                return Err(fault.into());
            }
            pending.insert(seq, tx);
        }
        trace!(session = %self.session.id, seq, method, "issuing call");

        let request = Message::Request {
            seq,
            method: method.to_owned(),
            args,
        };
        if self.msg_tx.send(request).await.is_err() {
            self.forget(seq);
            return Err(self.session_error());
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(failure))) => match failure.kind {
                FailureKind::MethodNotFound => Err(CallError::MethodNotFound(failure.message)),
                FailureKind::InvalidArgs | FailureKind::Error => {
                    Err(CallError::Remote(failure.to_string()))
                }
            },
            // The reply sender was dropped: the session failed.
            Ok(Err(_)) => Err(self.session_error()),
            Err(_) => {
                self.forget(seq);
                trace!(session = %self.session.id, seq, method, "call timed out");
                Err(CallError::Timeout)
            }
        }
    }

    /// Registers interest in `topic`.
    ///
    /// Events on the topic are delivered in the order the engine emitted
    /// them. The subscription buffers without bound, so a slow consumer
    /// never blocks replies or other subscribers.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut topics = self.shared.topics.lock().expect("lock poisoned");
            // On a session that already ended, drop the sender instead:
            // the subscription then ends immediately rather than waiting
            // for events that can never arrive.
            if self.shared.fault().is_none() {
                topics.entry(topic.into()).or_default().push(tx);
            }
        }
        Subscription { rx }
    }

    /// Shuts the session down.
    ///
    /// Best effort and idempotent: pending calls fail, subscriptions end,
    /// and calling this after the engine has already gone away is safe.
    pub fn disconnect(&self) {
        self.tasks.lock().expect("lock poisoned").clear();
        self.shared
            .fail(SessionFault::ConnectionLost("disconnected".into()));
    }

    /// Ties this session's fate to a supervised engine process.
    ///
    /// When the child exits, every pending call and subscription fails with
    /// [`SessionFault::EngineDied`] instead of waiting out its timeout.
    pub fn supervise(&self, supervisor: &EngineSupervisor) {
        let mut exit_rx = supervisor.exit_watch();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            if let Ok(status) = exit_rx.wait_for(|status| status.is_some()).await {
                let status = status.clone().expect("matched Some");
                shared.fail(SessionFault::EngineDied(status));
            }
        });
        self.tasks
            .lock()
            .expect("lock poisoned")
            .push(AbortOnDropHandle::new(task));
    }

    fn forget(&self, seq: u64) {
        self.shared
            .pending
            .lock()
            .expect("lock poisoned")
            .remove(&seq);
    }

    fn session_error(&self) -> CallError {
        self.shared
            .fault()
            .unwrap_or_else(|| SessionFault::ConnectionLost("session closed".into()))
            .into()
    }

    async fn run_send_task(
        mut sink: futures::stream::SplitSink<Framed<TcpStream, Codec>, Message>,
        mut msg_rx: mpsc::Receiver<Message>,
        shared: Arc<Shared>,
    ) {
        while let Some(msg) = msg_rx.recv().await {
            trace!(send = msg.name(), "sending frame");
            if let Err(err) = sink.send(msg).await {
                debug!("send error: {}", err);
                shared.fail(fault_from_codec(err));
                break;
            }
        }
    }

    async fn run_recv_task(
        mut stream: futures::stream::SplitStream<Framed<TcpStream, Codec>>,
        shared: Arc<Shared>,
    ) {
        loop {
            match stream.try_next().await {
                Ok(Some(msg)) => {
                    trace!(recv = msg.name(), "received frame");
                    if let Err(fault) = shared.route(msg) {
                        shared.fail(fault);
                        break;
                    }
                }
                Ok(None) => {
                    shared.fail(SessionFault::ConnectionLost(
                        "engine closed the connection".into(),
                    ));
                    break;
                }
                Err(err) => {
                    debug!("recv error: {}", err);
                    shared.fail(fault_from_codec(err));
                    break;
                }
            }
        }
    }
}

impl Drop for EngineProxy {
    fn drop(&mut self) {
        // Release any callers still parked on the session.
        self.shared
            .fail(SessionFault::ConnectionLost("proxy dropped".into()));
    }
}

fn fault_from_codec(err: CodecError) -> SessionFault {
    match err {
        CodecError::Io(err) => SessionFault::ConnectionLost(err.to_string()),
        other => SessionFault::Corrupt(other.to_string()),
    }
}
