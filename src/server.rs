// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The client-facing Modbus TCP server.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{codec::tcp::ServerCodec, router::Router};

/// The Modbus TCP listener with its accept loop.
pub struct TcpServer {
    listener: TcpListener,
    timeout: Option<Duration>,
    router: Arc<Router>,
}

impl TcpServer {
    /// Bind the listening socket.
    ///
    /// Binding happens here rather than in [`TcpServer::serve`] so that
    /// startup failures surface before the process settles into its accept
    /// loop.
    pub async fn bind(
        addr: SocketAddr,
        timeout_ms: u64,
        router: Arc<Router>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            router,
        })
    }

    /// The bound address, with the ephemeral port resolved.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept client connections until the task is dropped; each connection
    /// runs its request/response loop in its own task.
    pub async fn serve(&self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("Accept error: {err}");
                    continue;
                }
            };
            log::debug!("Client {peer} connected");
            let router = Arc::clone(&self.router);
            let read_timeout = self.timeout;
            tokio::spawn(async move {
                if let Err(err) = process(stream, &router, read_timeout).await {
                    log::warn!("Client {peer}: {err}");
                }
                log::debug!("Client {peer} disconnected");
            });
        }
    }
}

/// The per-connection request/response loop.
///
/// Requests are handled one at a time, so responses are written strictly in
/// request order and the client's original transaction id, protocol id and
/// unit id are preserved. Any framing error closes the connection without a
/// response.
async fn process(
    stream: TcpStream,
    router: &Router,
    read_timeout: Option<Duration>,
) -> io::Result<()> {
    let mut framed = Framed::new(stream, ServerCodec::default());
    loop {
        let next = match read_timeout {
            Some(deadline) => match timeout(deadline, framed.next()).await {
                Ok(next) => next,
                // Idle client.
                Err(_elapsed) => break,
            },
            None => framed.next().await,
        };
        let Some(frame) = next else {
            // Client closed the connection.
            break;
        };
        let (hdr, req) = frame?;
        let rsp = router.request_backend(hdr.unit_id, req).await;
        framed.send((hdr, rsp)).await?;
    }
    Ok(())
}
