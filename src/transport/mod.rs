// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backend transports.
//!
//! A transport wraps at most one live connection to a backend device and
//! knows how to frame a PDU onto that wire. Exactly one backend worker
//! drives a given transport at any time; the implementations only guard the
//! connection slot itself so that [`Transport::close`] can race a lazy open.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::{BackendConfig, Protocol},
    error::Result,
    frame::Pdu,
};

mod serial;
mod tcp;

pub(crate) use self::{serial::SerialTransport, tcp::TcpTransport};

#[async_trait]
pub(crate) trait Transport: Send + Sync {
    /// Forward `req` to the device and await its response.
    ///
    /// The connection is opened lazily on first use and reused afterwards.
    async fn execute_request(&self, req: &Pdu) -> Result<Pdu>;

    /// Drop the live connection, if any. Subsequent requests reconnect.
    async fn close(&self);
}

pub(crate) fn new_transport(cfg: Arc<BackendConfig>) -> Arc<dyn Transport> {
    match cfg.protocol {
        Protocol::Tcp | Protocol::Tls => Arc::new(TcpTransport::new(cfg)),
        Protocol::Serial => Arc::new(SerialTransport::new(cfg)),
    }
}
