// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Frame types shared by the client-facing and backend-facing codecs.

use std::{error, fmt};

use crate::bytes::Bytes;

/// A Modbus function code is represented by an unsigned 8 bit integer.
pub type FunctionCode = u8;

/// A single byte for addressing Modbus devices behind the gateway.
pub type UnitId = u8;

/// A 16 bit value correlating requests and responses on a TCP connection.
pub type TransactionId = u16;

/// [MODBUS Messaging on TCP/IP Implementation Guide](http://www.modbus.org/docs/Modbus_Messaging_Implementation_Guide_V1_0b.pdf), page 5
/// "The size of the MODBUS PDU is limited by the size constraint inherited from
/// the first MODBUS implementation on Serial Line network (max. RS485 ADU = 256 bytes)."
pub const MAX_TCP_FRAME_LEN: usize = 260;

/// [Modbus over Serial Line Specification and Implementation Guide V1.02](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf), page 13
/// "The maximum size of a Modbus RTU frame is 256 bytes."
pub const MAX_RTU_FRAME_LEN: usize = 256;

/// A Modbus protocol data unit together with the unit it addresses.
///
/// The gateway is transparent to the payload: requests and responses pass
/// through without interpreting the function-specific data, aside from the
/// few bytes the RTU codec needs for sizing responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    /// The addressed unit; rewritten by the router on its way to a backend.
    pub unit_id: UnitId,
    /// The Modbus function code. Exception responses have the high bit set.
    pub function: FunctionCode,
    /// The function-specific data following the function code.
    pub payload: Bytes,
}

impl Pdu {
    /// Build a gateway exception response for a request with the given
    /// function code, addressed back to the client's unit id.
    #[must_use]
    pub fn exception(unit_id: UnitId, function: FunctionCode, exception: Exception) -> Self {
        Self {
            unit_id,
            function: function | 0x80,
            payload: Bytes::copy_from_slice(&[exception.into()]),
        }
    }

    /// Check if this PDU carries an exception response.
    #[must_use]
    pub fn is_exception(&self) -> bool {
        self.function & 0x80 != 0
    }
}

/// The variable fields of an MBAP header.
///
/// The protocol identifier is implicit: it is always zero for Modbus TCP,
/// and frames carrying any other value are rejected by the codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub transaction_id: TransactionId,
    pub unit_id: UnitId,
}

/// A server (slave) exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Exception {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

impl From<Exception> for u8 {
    fn from(from: Exception) -> Self {
        from as u8
    }
}

impl Exception {
    pub(crate) fn description(&self) -> &str {
        use crate::frame::Exception::*;

        match *self {
            IllegalFunction => "Illegal function",
            IllegalDataAddress => "Illegal data address",
            IllegalDataValue => "Illegal data value",
            ServerDeviceFailure => "Server device failure",
            Acknowledge => "Acknowledge",
            ServerDeviceBusy => "Server device busy",
            MemoryParityError => "Memory parity error",
            GatewayPathUnavailable => "Gateway path unavailable",
            GatewayTargetDevice => "Gateway target device failed to respond",
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl error::Error for Exception {}
