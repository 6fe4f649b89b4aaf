// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Supervision of a locally launched engine process.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info};

/// How to launch an engine process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// The engine executable.
    pub program: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
}

/// Tracks the liveness of a launched engine process.
///
/// The supervisor owns the child: dropping it kills the process. Its exit,
/// expected or not, is published on a watch channel so that a proxy bound
/// via [`EngineProxy::supervise`](crate::EngineProxy::supervise) can fail
/// pending operations instead of leaving them suspended.
#[derive(Debug)]
pub struct EngineSupervisor {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<String>>,
    kill: Arc<Notify>,
    _task: AbortOnDropHandle<()>,
}

impl EngineSupervisor {
    /// Launches the engine described by `config` and begins supervising it.
    pub fn launch(config: &LaunchConfig) -> io::Result<EngineSupervisor> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        info!(program = %config.program, pid, "launched engine process");

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let kill_rx = Arc::clone(&kill);
        let task = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.notified() => {
                    debug!("killing engine process");
                    child.start_kill().ok();
                    child.wait().await
                }
            };
            let status = match status {
                Ok(status) => status.to_string(),
                Err(err) => format!("wait failed: {}", err),
            };
            info!(%status, "engine process exited");
            let _ = exit_tx.send(Some(status));
        });

        Ok(EngineSupervisor {
            pid,
            exit_rx,
            kill,
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// The child's OS process id, if it has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// A watch over the child's exit: `None` while it runs, then a
    /// description of its exit status.
    pub fn exit_watch(&self) -> watch::Receiver<Option<String>> {
        self.exit_rx.clone()
    }

    /// Requests a best-effort kill of the child.
    ///
    /// The exit still arrives through [`EngineSupervisor::exit_watch`].
    pub fn kill(&self) {
        self.kill.notify_one();
    }
}
