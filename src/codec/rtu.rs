// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    bytes::{BufMut, BytesMut},
    error::{Error, Result},
    frame::{FunctionCode, Pdu},
};

/// Number of bytes still to read after `unit id | function code | first body
/// byte` have arrived, exclusive of the trailing CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseLen {
    Known(usize),
    /// Read FIFO queue responses size themselves with a 16 bit byte count;
    /// one more byte is required before the length is known.
    NeedMore,
}

/// Computes the expected remaining length of a Modbus RTU response.
///
/// `len_byte` is the third byte of the frame, which for the read-style
/// functions holds the byte count of the data that follows.
pub(crate) fn response_len(function: FunctionCode, len_byte: u8) -> Result<ResponseLen> {
    // Exception responses are `unit | function | exception code`, which is
    // exactly the three bytes already read. This also covers 0x80 | 0x18.
    if function & 0x80 != 0 {
        return Ok(ResponseLen::Known(0));
    }
    let len = match function {
        // Read-style responses announce their data length in the third byte.
        0x01..=0x04 | 0x14 | 0x15 | 0x17 => usize::from(len_byte),
        // Write-style responses echo address and value/quantity.
        0x05 | 0x06 | 0x0F | 0x10 => 3,
        // Mask write echoes address, AND mask and OR mask.
        0x16 => 5,
        // Read FIFO queue.
        0x18 => return Ok(ResponseLen::NeedMore),
        _ => return Err(Error::InvalidProtocol),
    };
    Ok(ResponseLen::Known(len))
}

/// Encode `pdu` as an RTU ADU with its trailing CRC.
pub(crate) fn encode_frame(pdu: &Pdu) -> BytesMut {
    let mut buf = BytesMut::with_capacity(pdu.payload.len() + 4);
    buf.put_u8(pdu.unit_id);
    buf.put_u8(pdu.function);
    buf.put_slice(&pdu.payload);
    let crc = calc_crc(&buf);
    buf.put_u16(crc);
    buf
}

pub(crate) fn calc_crc(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF;
    for x in data {
        crc ^= u16::from(*x);
        for _ in 0..8 {
            let crc_odd = (crc & 0x0001) != 0;
            crc >>= 1;
            if crc_odd {
                crc ^= 0xA001;
            }
        }
    }
    crc << 8 | crc >> 8
}

pub(crate) fn check_crc(adu_data: &[u8], expected_crc: u16) -> Result<()> {
    let actual_crc = calc_crc(adu_data);
    if expected_crc != actual_crc {
        return Err(Error::BadCrc {
            expected: expected_crc,
            actual: actual_crc,
        });
    }
    Ok(())
}
