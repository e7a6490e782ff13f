// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU backend transport over a serial line.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::{Mutex, RwLock},
    time::{sleep, sleep_until, timeout, Instant},
};
use tokio_serial::{DataBits, SerialPortBuilderExt as _, SerialStream, StopBits};

use crate::{
    bytes::Bytes,
    codec::rtu::{self, ResponseLen},
    config::{BackendConfig, Parity},
    error::{Error, Result},
    frame::{Pdu, MAX_RTU_FRAME_LEN},
    transport::Transport,
};

/// Quiet-time floor mandated for baud rates of 19200 and above.
///
/// [Modbus over Serial Line Specification and Implementation Guide V1.02](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf), page 13
const T35_FLOOR: Duration = Duration::from_micros(1750);

/// Bound for a single response read when no timeout is configured. Without
/// it a silent device would stall its worker forever.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long it takes to transmit one character on the wire: 1 start bit,
/// 8 data bits, 1 parity or stop bit and 1 stop bit.
fn char_time(baudrate: u32) -> Duration {
    Duration::from_secs(11) / baudrate
}

/// A Modbus RTU serial bus.
///
/// The transport enforces the t3.5 inter-frame silence around each
/// transmission and resynchronizes the bus after framing errors by draining
/// the receive buffer.
pub(crate) struct SerialTransport {
    cfg: Arc<BackendConfig>,
    read_timeout: Duration,
    t1: Duration,
    t35: Duration,
    conn: RwLock<Option<SerialStream>>,
    last_activity: Mutex<Instant>,
}

impl SerialTransport {
    pub(crate) fn new(cfg: Arc<BackendConfig>) -> Self {
        let t1 = char_time(cfg.baudrate);
        let t35 = if cfg.baudrate >= 19_200 {
            T35_FLOOR
        } else {
            t1 * 35 / 10
        };
        let read_timeout = if cfg.timeout > 0 {
            Duration::from_millis(cfg.timeout)
        } else {
            DEFAULT_READ_TIMEOUT
        };
        Self {
            cfg,
            read_timeout,
            t1,
            t35,
            conn: RwLock::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    async fn ensure_conn(&self) -> io::Result<()> {
        if self.conn.read().await.is_some() {
            return Ok(());
        }
        let port = self.open_port()?;
        let mut guard = self.conn.write().await;
        // A concurrent open may have won the race; keep the open port and
        // let the fresh one drop.
        if guard.is_none() {
            *guard = Some(port);
        }
        Ok(())
    }

    fn open_port(&self) -> io::Result<SerialStream> {
        let builder = tokio_serial::new(self.cfg.address.as_str(), self.cfg.baudrate)
            .data_bits(data_bits(self.cfg.databits)?)
            .stop_bits(stop_bits(self.cfg.stopbits)?)
            .parity(match self.cfg.parity {
                Parity::N => tokio_serial::Parity::None,
                Parity::E => tokio_serial::Parity::Even,
                Parity::O => tokio_serial::Parity::Odd,
            });
        builder
            .open_native_async()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }

    async fn execute_rtu<S>(&self, port: &mut S, req: &Pdu) -> Result<Pdu>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        // If the line was active less than 3.5 char times ago, let t3.5
        // expire before transmitting.
        let quiet_from = *self.last_activity.lock().await + self.t35;
        sleep_until(quiet_from).await;

        let frame = rtu::encode_frame(req);
        let started = Instant::now();
        port.write_all(&frame).await?;

        // Writes are usually buffered by the driver and return before the
        // line is idle again; estimate how long it stays busy transmitting.
        let busy_until = started + self.t1 * frame.len() as u32;
        *self.last_activity.lock().await = busy_until;
        sleep_until(busy_until + self.t35).await;

        let result = self.read_frame(port).await;

        if matches!(
            result,
            Err(Error::BadCrc { .. } | Error::InvalidProtocol | Error::ShortFrame)
        ) {
            // Wait a frame's worth of silence, then flush whatever is still
            // coming off the link so the devices can re-sync.
            sleep(self.t1 * MAX_RTU_FRAME_LEN as u32).await;
            self.drain(port).await;
        }

        // Mark the time if we heard anything back.
        *self.last_activity.lock().await = Instant::now();

        result
    }

    async fn read_frame<S>(&self, port: &mut S) -> Result<Pdu>
    where
        S: AsyncRead + Send + Unpin,
    {
        let mut buf = [0u8; MAX_RTU_FRAME_LEN];
        self.read_exact(port, &mut buf[..3]).await?;

        let function = buf[1];
        let mut start = 3;
        let rest = match rtu::response_len(function, buf[2])? {
            ResponseLen::Known(len) => len,
            ResponseLen::NeedMore => {
                // Read FIFO responses carry a 16 bit byte count in
                // bytes 2..4.
                self.read_exact(port, &mut buf[3..4]).await?;
                start = 4;
                usize::from(u16::from_be_bytes([buf[2], buf[3]]))
            }
        };
        let total = start + rest + 2;
        if total > MAX_RTU_FRAME_LEN {
            return Err(Error::InvalidProtocol);
        }
        self.read_exact(port, &mut buf[start..total]).await?;

        let expected_crc = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
        rtu::check_crc(&buf[..total - 2], expected_crc)?;

        Ok(Pdu {
            unit_id: buf[0],
            function,
            payload: Bytes::copy_from_slice(&buf[2..total - 2]),
        })
    }

    async fn read_exact<S>(&self, port: &mut S, buf: &mut [u8]) -> Result<()>
    where
        S: AsyncRead + Send + Unpin,
    {
        match timeout(self.read_timeout, port.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => Err(Error::ShortFrame),
            Ok(Err(err)) => Err(Error::Io(err)),
            Err(_elapsed) => Err(Error::ShortFrame),
        }
    }

    /// Discard pending receive data, up to 1 KiB. Best effort: the read
    /// timeout bounds how long this can block.
    async fn drain<S>(&self, port: &mut S)
    where
        S: AsyncRead + Send + Unpin,
    {
        let mut scratch = [0u8; 1024];
        let mut drained = 0;
        while drained < scratch.len() {
            match timeout(self.read_timeout, port.read(&mut scratch[drained..])).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => drained += n,
            }
        }
        if drained > 0 {
            log::debug!("Drained {drained} byte(s) to re-sync the bus");
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn execute_request(&self, req: &Pdu) -> Result<Pdu> {
        self.ensure_conn().await.map_err(Error::Connect)?;
        let mut guard = self.conn.write().await;
        let Some(port) = guard.as_mut() else {
            return Err(Error::ClientClosed);
        };
        self.execute_rtu(port, req).await
    }

    async fn close(&self) {
        self.conn.write().await.take();
    }
}

fn data_bits(databits: u8) -> io::Result<DataBits> {
    match databits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid data bits: {databits}"),
        )),
    }
}

fn stop_bits(stopbits: u8) -> io::Result<StopBits> {
    match stopbits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid stop bits: {stopbits}"),
        )),
    }
}
