// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Live backend devices.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::{
    config::BackendConfig,
    error::{Error, Result},
    frame::Pdu,
    transport::{self, Transport},
};

struct Job {
    req: Pdu,
    reply: oneshot::Sender<Result<Pdu>>,
}

/// A live backend device with a pool of transports.
///
/// Requests funnel through a bounded queue with one slot per transport.
/// Each worker task owns one transport and processes one request at a time,
/// so a transport never sees interleaved transactions; bursts beyond the
/// pool size block the callers until a worker frees up.
pub(crate) struct Backend {
    name: String,
    transports: Vec<Arc<dyn Transport>>,
    tx: RwLock<Option<mpsc::Sender<Job>>>,
}

impl Backend {
    pub(crate) fn new(cfg: Arc<BackendConfig>) -> Self {
        let transports = (0..cfg.connections)
            .map(|_| transport::new_transport(Arc::clone(&cfg)))
            .collect();
        Self {
            name: cfg.name.clone(),
            transports,
            tx: RwLock::new(None),
        }
    }

    #[cfg(test)]
    fn with_transports(name: &str, transports: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            name: name.to_owned(),
            transports,
            tx: RwLock::new(None),
        }
    }

    /// Spawn one worker task per transport.
    pub(crate) async fn start(&self) {
        let (tx, rx) = mpsc::channel(self.transports.len());
        let rx = Arc::new(Mutex::new(rx));
        for transport in &self.transports {
            let rx = Arc::clone(&rx);
            let transport = Arc::clone(transport);
            tokio::spawn(async move {
                loop {
                    // Take exactly one job, releasing the queue before the
                    // request runs so any free worker can pull the next one.
                    let job = rx.lock().await.recv().await;
                    let Some(Job { req, reply }) = job else {
                        break;
                    };
                    let result = transport.execute_request(&req).await;
                    // The caller may have gone away; nothing to do then.
                    let _ = reply.send(result);
                }
            });
        }
        *self.tx.write().await = Some(tx);
        log::info!("Start running backend {}", self.name);
    }

    /// Forward one request and await its response.
    ///
    /// Fails with [`Error::ClientClosed`] if the backend was stopped before
    /// a worker could deliver a reply.
    pub(crate) async fn execute_request(&self, req: Pdu) -> Result<Pdu> {
        let Some(tx) = self.tx.read().await.clone() else {
            return Err(Error::ClientClosed);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Job {
            req,
            reply: reply_tx,
        })
        .await
        .map_err(|_| Error::ClientClosed)?;
        reply_rx.await.map_err(|_| Error::ClientClosed)?
    }

    /// Close the queue and all transports.
    ///
    /// Workers drain the jobs that were already queued and then exit; a
    /// caller whose job is dropped undelivered observes `ClientClosed`
    /// through its reply slot instead of hanging.
    pub(crate) async fn stop(&self) {
        self.tx.write().await.take();
        for transport in &self.transports {
            transport.close().await;
        }
        log::info!("Stop backend {}", self.name);
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}
