// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::io;

use thiserror::Error;

use crate::frame::Exception;

/// Error type for requests forwarded to a backend device.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection to the backend could not be (re)established.
    #[error("connect to backend failed: {0}")]
    Connect(#[source] io::Error),

    /// I/O on an established backend connection failed.
    #[error("backend I/O failed: {0}")]
    Io(#[from] io::Error),

    /// An RTU frame arrived whose CRC does not match its contents.
    #[error("invalid CRC: expected = 0x{expected:0>4X}, actual = 0x{actual:0>4X}")]
    BadCrc {
        /// The CRC transmitted with the frame.
        expected: u16,
        /// The CRC computed over the received bytes.
        actual: u16,
    },

    /// Fewer bytes than the frame announced arrived before the read
    /// timed out.
    #[error("short frame")]
    ShortFrame,

    /// The peer sent bytes that cannot be part of a Modbus frame.
    #[error("invalid protocol")]
    InvalidProtocol,

    /// The backend was stopped while the request was pending.
    #[error("backend closed")]
    ClientClosed,
}

impl Error {
    /// The gateway exception reported to the client for this error.
    ///
    /// A failed connect means the target device never saw the request
    /// (`GatewayTargetDevice`); everything after a successful connect is a
    /// path failure (`GatewayPathUnavailable`).
    #[must_use]
    pub fn exception(&self) -> Exception {
        match self {
            Error::Connect(_) => Exception::GatewayTargetDevice,
            Error::Io(_)
            | Error::BadCrc { .. }
            | Error::ShortFrame
            | Error::InvalidProtocol
            | Error::ClientClosed => Exception::GatewayPathUnavailable,
        }
    }
}

/// Result type for requests forwarded to a backend device.
pub type Result<T> = std::result::Result<T, Error>;
