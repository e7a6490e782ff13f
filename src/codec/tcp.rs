// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Error, ErrorKind, Result};

use byteorder::{BigEndian, ByteOrder};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    bytes::{Buf, BufMut, BytesMut},
    frame::{Header, Pdu, MAX_TCP_FRAME_LEN},
};

use super::u16_len;

const HEADER_LEN: usize = 7;

const PROTOCOL_ID: u16 = 0x0000; // TCP

/// Codec for the client-facing side of the gateway.
///
/// Malformed frames are decode errors: the server closes the client
/// connection without writing a response.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ServerCodec;

/// Codec for the backend-facing side of the gateway.
///
/// Backends are long-lived shared devices, so this decoder resynchronizes
/// instead of failing: frames with an out-of-range length or a foreign
/// protocol identifier are skipped and the stream is scanned for the next
/// frame. Stale responses are filtered by transaction id one level up.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ClientCodec;

/// Validate the length field of the header at the start of `buf`.
///
/// Returns the PDU length (the length field minus the unit id byte).
fn check_pdu_len(buf: &BytesMut) -> Result<usize> {
    debug_assert!(buf.len() >= HEADER_LEN);
    // len = bytes of PDU + one byte (unit ID)
    let len = usize::from(BigEndian::read_u16(&buf[4..6]));
    if len <= 1 || len - 1 + HEADER_LEN > MAX_TCP_FRAME_LEN {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid data length: {len}"),
        ));
    }
    Ok(len - 1)
}

/// Split one complete ADU off the front of `buf`.
///
/// The caller has already verified the length field and that the buffer
/// holds the whole frame.
fn split_adu(buf: &mut BytesMut, pdu_len: usize) -> (Header, Pdu) {
    let header_data = buf.split_to(HEADER_LEN);
    let transaction_id = BigEndian::read_u16(&header_data[0..2]);
    let unit_id = header_data[6];
    let mut pdu_data = buf.split_to(pdu_len).freeze();
    let function = pdu_data.split_to(1)[0];
    (
        Header {
            transaction_id,
            unit_id,
        },
        Pdu {
            unit_id,
            function,
            payload: pdu_data,
        },
    )
}

fn encode_adu(hdr: Header, pdu: &Pdu, buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + 1 + pdu.payload.len());
    buf.put_u16(hdr.transaction_id);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16(u16_len(pdu.payload.len() + 2));
    buf.put_u8(hdr.unit_id);
    buf.put_u8(pdu.function);
    buf.put_slice(&pdu.payload);
}

impl Decoder for ServerCodec {
    type Item = (Header, Pdu);
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<(Header, Pdu)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let pdu_len = check_pdu_len(buf)?;
        if buf.len() < HEADER_LEN + pdu_len {
            return Ok(None);
        }
        let protocol_id = BigEndian::read_u16(&buf[2..4]);
        if protocol_id != PROTOCOL_ID {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Invalid protocol identifier: expected = {PROTOCOL_ID}, actual = {protocol_id}"
                ),
            ));
        }
        Ok(Some(split_adu(buf, pdu_len)))
    }
}

impl Decoder for ClientCodec {
    type Item = (Header, Pdu);
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<(Header, Pdu)>> {
        loop {
            if buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let pdu_len = match check_pdu_len(buf) {
                Ok(pdu_len) => pdu_len,
                Err(err) => {
                    // The length field is unusable, so the frame boundary is
                    // unknown; skip the header and scan on.
                    log::warn!("Skipping response frame: {err}");
                    buf.advance(HEADER_LEN);
                    continue;
                }
            };
            if buf.len() < HEADER_LEN + pdu_len {
                return Ok(None);
            }
            let protocol_id = BigEndian::read_u16(&buf[2..4]);
            if protocol_id != PROTOCOL_ID {
                log::warn!("Skipping response frame with protocol identifier 0x{protocol_id:0>4X}");
                buf.advance(HEADER_LEN + pdu_len);
                continue;
            }
            return Ok(Some(split_adu(buf, pdu_len)));
        }
    }
}

impl Encoder<(Header, Pdu)> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, (hdr, pdu): (Header, Pdu), buf: &mut BytesMut) -> Result<()> {
        encode_adu(hdr, &pdu, buf);
        Ok(())
    }
}

impl Encoder<(Header, Pdu)> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, (hdr, pdu): (Header, Pdu), buf: &mut BytesMut) -> Result<()> {
        encode_adu(hdr, &pdu, buf);
        Ok(())
    }
}
