// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [Modbus](https://en.wikipedia.org/wiki/Modbus) TCP gateway
//! based on [tokio](https://tokio.rs).
//!
//! Clients connect over Modbus TCP; every request is routed by its unit
//! identifier to a configured backend device reachable over Modbus TCP, a
//! TLS-wrapped Modbus TCP connection, or a Modbus RTU serial link. The
//! gateway rewrites unit identifiers in flight, serializes requests per
//! backend connection, and answers with proper gateway exceptions
//! (`0x0A`/`0x0B`) when a backend is unreachable, so clients always see
//! valid Modbus semantics.
//!
//! ## Features
//!
//! - transparent payload forwarding (no function-code interpretation)
//! - backend connection pooling with at most one in-flight transaction
//!   per connection
//! - Modbus RTU timing (t1, t3.5) and bus re-synchronization
//! - hot configuration reload via SIGHUP
//!
//! # Protocol-Specification
//!
//! - [MODBUS Application Protocol Specification v1.1b3 (PDF)](http://modbus.org/docs/Modbus_Application_Protocol_V1_1b3.pdf)
//! - [MODBUS over serial line specification and implementation guide v1.02 (PDF)](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf)
//! - [MODBUS Messaging on TCP/IP Implementation Guide v1.0b (PDF)](http://modbus.org/docs/Modbus_Messaging_Implementation_Guide_V1_0b.pdf)

pub use bytes;

pub mod config;
pub mod frame;
pub mod router;
pub mod server;

mod backend;
mod codec;
mod error;
mod transport;

pub use self::error::{Error, Result};
