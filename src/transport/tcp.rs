// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP backend transport with optional TLS.

use std::{
    fs::File,
    io::{self, BufReader},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::RwLock,
    time::timeout,
};
use tokio_rustls::{
    rustls::{self, ServerName},
    TlsConnector,
};
use tokio_util::codec::Framed;

use crate::{
    codec::tcp::ClientCodec,
    config::{BackendConfig, Protocol},
    error::{Error, Result},
    frame::{Header, Pdu, TransactionId},
    transport::Transport,
};

trait Connection: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Connection for T {}

type FramedConnection = Framed<Box<dyn Connection>, ClientCodec>;

/// One pooled connection to a Modbus TCP (or TLS-wrapped) backend.
///
/// The transaction id counter is per connection slot: because the owning
/// worker serializes requests, at most one transaction is ever in flight and
/// `last_txn` uniquely identifies the expected response.
pub(crate) struct TcpTransport {
    cfg: Arc<BackendConfig>,
    timeout: Option<Duration>,
    conn: RwLock<Option<FramedConnection>>,
    last_txn: AtomicU16,
}

impl TcpTransport {
    pub(crate) fn new(cfg: Arc<BackendConfig>) -> Self {
        let timeout = (cfg.timeout > 0).then(|| Duration::from_millis(cfg.timeout));
        Self {
            cfg,
            timeout,
            conn: RwLock::new(None),
            last_txn: AtomicU16::new(0),
        }
    }

    fn next_transaction_id(&self) -> TransactionId {
        let transaction_id = self.last_txn.load(Ordering::Relaxed).wrapping_add(1);
        self.last_txn.store(transaction_id, Ordering::Relaxed);
        transaction_id
    }

    async fn ensure_conn(&self) -> io::Result<()> {
        if self.conn.read().await.is_some() {
            return Ok(());
        }
        let stream = self.dial().await?;
        let mut guard = self.conn.write().await;
        // A concurrent open may have won the race; keep the established
        // connection and let the fresh one drop.
        if guard.is_none() {
            *guard = Some(Framed::new(stream, ClientCodec::default()));
        }
        Ok(())
    }

    async fn dial(&self) -> io::Result<Box<dyn Connection>> {
        match self.cfg.protocol {
            Protocol::Tcp => {
                let stream = self.with_deadline(dial_tcp(&self.cfg.address)).await?;
                Ok(Box::new(stream))
            }
            Protocol::Tls => {
                let connector = TlsConnector::from(Arc::new(tls_client_config(&self.cfg)?));
                let server_name = ServerName::try_from(self.cfg.host()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname")
                })?;
                // The deadline covers both the TCP connect and the TLS
                // handshake.
                let stream = self
                    .with_deadline(async {
                        let stream = dial_tcp(&self.cfg.address).await?;
                        connector.connect(server_name, stream).await
                    })
                    .await?;
                Ok(Box::new(stream))
            }
            Protocol::Serial => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a TCP backend",
            )),
        }
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        match self.timeout {
            Some(deadline) => timeout(deadline, fut)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend timed out"))?,
            None => fut.await,
        }
    }

    async fn execute_once(&self, req: &Pdu) -> io::Result<Pdu> {
        let mut guard = self.conn.write().await;
        let Some(framed) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        };
        let transaction_id = self.next_transaction_id();
        let hdr = Header {
            transaction_id,
            unit_id: req.unit_id,
        };
        let exchange = async {
            framed.send((hdr, req.clone())).await?;
            loop {
                let Some(frame) = framed.next().await else {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
                };
                let (rsp_hdr, rsp) = frame?;
                if rsp_hdr.transaction_id != transaction_id {
                    log::warn!(
                        "Received unexpected transaction id (expected: 0x{:0>4X}, got: 0x{:0>4X})",
                        transaction_id,
                        rsp_hdr.transaction_id
                    );
                    continue;
                }
                return Ok(rsp);
            }
        };
        match self.timeout {
            Some(deadline) => timeout(deadline, exchange)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend timed out"))?,
            None => exchange.await,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn execute_request(&self, req: &Pdu) -> Result<Pdu> {
        self.ensure_conn().await.map_err(Error::Connect)?;
        match self.execute_once(req).await {
            Err(err) if is_retryable(&err) => {
                // The pooled connection went stale while idle; reconnect and
                // give the request exactly one more try.
                log::warn!("Retry connect backend {}: {err}", self.cfg.name);
                self.close().await;
                self.ensure_conn().await.map_err(Error::Connect)?;
                self.execute_once(req).await.map_err(Error::Io)
            }
            Err(err) => Err(Error::Io(err)),
            Ok(rsp) => Ok(rsp),
        }
    }

    async fn close(&self) {
        // Dropping the framed stream closes the socket.
        self.conn.write().await.take();
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
    )
}

async fn dial_tcp(address: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn tls_client_config(cfg: &BackendConfig) -> io::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder().with_safe_defaults();
    let config = if cfg.tls_verify {
        let mut root_cert_store = rustls::RootCertStore::empty();
        if let Some(ca_path) = &cfg.tls_ca_cert {
            let mut pem = BufReader::new(File::open(ca_path)?);
            let certs = rustls_pemfile::certs(&mut pem)?;
            root_cert_store.add_parsable_certificates(&certs);
        }
        builder
            .with_root_certificates(root_cert_store)
            .with_no_client_auth()
    } else {
        builder
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Certificate verifier for `tls_verify: false` backends.
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
