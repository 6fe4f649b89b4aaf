// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Method registry and request dispatch.
//!
//! The engine side of a session owns a [`Registry`]: an explicit mapping
//! from method identifiers to statically-declared handler signatures,
//! populated once at startup and read-only during dispatch. Registration
//! validates that each method is declared exactly once, so identifier
//! clashes surface when the engine boots rather than when a client calls.
//!
//! [`Registry::dispatch`] converts every failure mode into a structured
//! reply. An unknown method, a signature mismatch, or a handler error is an
//! application-level outcome scoped to the one call that produced it; none
//! of them are connection faults. Handlers publish asynchronous events
//! through an [`EventSink`], a channel independent of the reply path, so a
//! long-running handler never delays event delivery.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use vz_protocol::{FailureKind, Message, RemoteFailure, Value, ValueKind};

/// The kind of value a handler parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Any value, including null.
    Any,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    List,
    Node,
}

impl ParamKind {
    fn admits(&self, value: &Value) -> bool {
        match self {
            ParamKind::Any => true,
            ParamKind::Bool => value.kind() == ValueKind::Bool,
            ParamKind::Int => value.kind() == ValueKind::Int,
            ParamKind::Float => value.kind() == ValueKind::Float,
            ParamKind::Text => value.kind() == ValueKind::Text,
            ParamKind::Bytes => value.kind() == ValueKind::Bytes,
            ParamKind::List => value.kind() == ValueKind::List,
            ParamKind::Node => value.kind() == ValueKind::Node,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ParamKind::Any => "any",
            ParamKind::Bool => "bool",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Text => "text",
            ParamKind::Bytes => "bytes",
            ParamKind::List => "list",
            ParamKind::Node => "node",
        };
        f.write_str(name)
    }
}

/// A method's declared parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    params: Vec<ParamKind>,
}

impl Signature {
    /// Declares a signature with the given parameter kinds.
    pub fn new(params: impl Into<Vec<ParamKind>>) -> Signature {
        Signature {
            params: params.into(),
        }
    }

    /// A signature taking no arguments.
    pub fn nullary() -> Signature {
        Signature { params: vec![] }
    }

    fn check(&self, args: &[Value]) -> Result<(), String> {
        if args.len() != self.params.len() {
            return Err(format!(
                "expected {} arguments, got {}",
                self.params.len(),
                args.len()
            ));
        }
        for (i, (param, arg)) in self.params.iter().zip(args).enumerate() {
            if !param.admits(arg) {
                return Err(format!(
                    "argument {} must be {}, got {}",
                    i,
                    param,
                    arg.kind()
                ));
            }
        }
        Ok(())
    }
}

/// A handle through which handlers publish asynchronous events.
///
/// The sink feeds the session's outgoing event channel directly; emitting
/// never blocks and never waits on the reply path.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl EventSink {
    /// Creates a sink feeding `tx`.
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> EventSink {
        EventSink { tx }
    }

    /// Publishes an event on `topic`.
    ///
    /// Delivery is best effort: events emitted after the session has closed
    /// are dropped.
    pub fn emit(&self, topic: impl Into<String>, payload: Value) {
        let _ = self.tx.send(Message::Event {
            topic: topic.into(),
            payload,
        });
    }
}

/// A registered method implementation.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invokes the handler with arguments already validated against the
    /// method's signature.
    async fn invoke(&self, args: Vec<Value>, events: EventSink) -> anyhow::Result<Value>;
}

/// Adapts an async closure to a [`Handler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(Vec<Value>, EventSink) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync,
{
    async fn invoke(&self, args: Vec<Value>, events: EventSink) -> anyhow::Result<Value> {
        (self.0)(args, events).await
    }
}

/// An error registering a method.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The method identifier already has a handler.
    #[error("method {0:?} is already registered")]
    Duplicate(String),
}

struct Method {
    signature: Signature,
    handler: Box<dyn Handler>,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Method")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// The method table for one engine.
///
/// Populate the registry at startup, then share it read-only with every
/// session that dispatches into it.
#[derive(Debug, Default)]
pub struct Registry {
    methods: BTreeMap<String, Method>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry {
            methods: BTreeMap::new(),
        }
    }

    /// Associates `handler` with `method`.
    ///
    /// Exactly one handler may be registered per method identifier;
    /// re-registration is an error.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        signature: Signature,
        handler: Box<dyn Handler>,
    ) -> Result<(), RegistryError> {
        let method = method.into();
        if self.methods.contains_key(&method) {
            return Err(RegistryError::Duplicate(method));
        }
        self.methods.insert(method, Method { signature, handler });
        Ok(())
    }

    /// Registers an async closure as a handler.
    pub fn register_fn<F, Fut>(
        &mut self,
        method: impl Into<String>,
        signature: Signature,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Vec<Value>, EventSink) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let f = move |args, events| -> BoxFuture<'static, anyhow::Result<Value>> {
            Box::pin(f(args, events))
        };
        self.register(method, signature, Box::new(FnHandler(f)))
    }

    /// The registered method identifiers, in order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Dispatches a request to its handler and renders the outcome as a
    /// reply.
    ///
    /// Failures here are application-level: an unknown method, a signature
    /// mismatch, or a handler error each produce a structured failure reply,
    /// never a connection fault.
    pub async fn dispatch(
        &self,
        seq: u64,
        method: &str,
        args: Vec<Value>,
        events: EventSink,
    ) -> Message {
        let failure = |kind, message: String| Message::Reply {
            seq,
            outcome: Err(RemoteFailure { kind, message }),
        };

        let Some(entry) = self.methods.get(method) else {
            debug!(seq, method, "dispatch: no such method");
            return failure(FailureKind::MethodNotFound, method.to_owned());
        };
        if let Err(message) = entry.signature.check(&args) {
            debug!(seq, method, %message, "dispatch: signature mismatch");
            return failure(FailureKind::InvalidArgs, message);
        }
        match entry.handler.invoke(args, events).await {
            Ok(value) => Message::Reply {
                seq,
                outcome: Ok(value),
            },
            Err(err) => {
                debug!(seq, method, "dispatch: handler failed: {:#}", err);
                failure(FailureKind::Error, format!("{:#}", err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_fn(
                "AddPlot",
                Signature::new([ParamKind::Text, ParamKind::Node]),
                |args, _events| async move { Ok(args.into_iter().next().expect("validated arity")) },
            )
            .unwrap();
        registry
            .register_fn("DrawPlots", Signature::nullary(), |_args, events| async move {
                for pct in [0, 50, 100] {
                    events.emit("render-progress", Value::Int(pct));
                }
                Ok(Value::Null)
            })
            .unwrap();
        registry
            .register_fn("Interrupt", Signature::nullary(), |_args, _events| async {
                anyhow::bail!("engine is not rendering")
            })
            .unwrap();
        registry
    }

    fn sink() -> (EventSink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(tx), rx)
    }

    fn plot_args() -> Vec<Value> {
        vec![
            Value::Text("Pseudocolor".into()),
            Value::Node("attrs".into(), vec![]),
        ]
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut registry = registry();
        let err = registry
            .register_fn("AddPlot", Signature::nullary(), |_, _| async {
                Ok(Value::Null)
            })
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("AddPlot".into()));
    }

    #[tokio::test]
    async fn dispatch_success() {
        let registry = registry();
        let (events, _rx) = sink();
        let reply = registry.dispatch(7, "AddPlot", plot_args(), events).await;
        assert_eq!(
            reply,
            Message::Reply {
                seq: 7,
                outcome: Ok(Value::Text("Pseudocolor".into())),
            }
        );
    }

    #[tokio::test]
    async fn unknown_method_is_a_reply_not_a_fault() {
        let registry = registry();
        let (events, _rx) = sink();
        let reply = registry.dispatch(8, "AddPolt", vec![], events).await;
        match reply {
            Message::Reply {
                seq: 8,
                outcome: Err(failure),
            } => {
                assert_eq!(failure.kind, FailureKind::MethodNotFound);
                assert_eq!(failure.message, "AddPolt");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn arity_and_kind_mismatches_are_invalid_args() {
        let registry = registry();

        let (events, _rx) = sink();
        let reply = registry.dispatch(9, "AddPlot", vec![], events).await;
        match reply {
            Message::Reply {
                outcome: Err(failure),
                ..
            } => {
                assert_eq!(failure.kind, FailureKind::InvalidArgs);
                assert!(failure.message.contains("expected 2 arguments"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let (events, _rx) = sink();
        let args = vec![Value::Int(3), Value::Node("attrs".into(), vec![])];
        let reply = registry.dispatch(10, "AddPlot", args, events).await;
        match reply {
            Message::Reply {
                outcome: Err(failure),
                ..
            } => {
                assert_eq!(failure.kind, FailureKind::InvalidArgs);
                assert!(failure.message.contains("argument 0 must be text"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn handler_failure_is_a_remote_error() {
        let registry = registry();
        let (events, _rx) = sink();
        let reply = registry.dispatch(11, "Interrupt", vec![], events).await;
        match reply {
            Message::Reply {
                seq: 11,
                outcome: Err(failure),
            } => {
                assert_eq!(failure.kind, FailureKind::Error);
                assert!(failure.message.contains("engine is not rendering"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn handlers_emit_events_on_an_independent_channel() {
        let registry = registry();
        let (events, mut rx) = sink();
        let reply = registry.dispatch(12, "DrawPlots", vec![], events).await;
        assert_eq!(
            reply,
            Message::Reply {
                seq: 12,
                outcome: Ok(Value::Null),
            }
        );
        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Message::Event { topic, payload } => {
                    assert_eq!(topic, "render-progress");
                    seen.push(payload);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(seen, vec![Value::Int(0), Value::Int(50), Value::Int(100)]);
    }
}
