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

use tokio::sync::mpsc;
use tracing::info;

/// Shutdown completes on SIGINT/SIGTERM or when any trigger fires.
pub struct Shutdown {
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Shutdown {
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Waits for a signal or a manual trigger.
    pub async fn wait(mut self) {
        tokio::select! {
            _ = imp::shutdown() => {}
            _ = self.shutdown_rx.recv() => {
                info!("received manual shutdown");
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
    pub async fn shutdown_now(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(unix)]
mod imp {
    use std::future::pending;

    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{info, warn};

    pub(super) async fn shutdown() {
        tokio::select! {
            () = watch_signal(SignalKind::interrupt(), "SIGINT") => {}
            () = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn watch_signal(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut s) => {
                s.recv().await;
                info!("received signal {name}, starting shutdown");
            }
            Err(e) => {
                // Only a manual trigger can stop us now.
                warn!("failed to register {name} handler: {e}");
                pending::<()>().await
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::warn;

    pub(super) async fn shutdown() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to register ctrl-c handler: {e}");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_completes_wait() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.trigger();
        let waiter = tokio::spawn(shutdown.wait());
        trigger.shutdown_now().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
