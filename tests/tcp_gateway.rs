// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests: a real client socket against the gateway with a mock
//! Modbus TCP device as the backend.

use std::{
    io::Write as _,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tempfile::NamedTempFile;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    time::timeout,
};

use tokio_modbus_gateway::{config::Config, router::Router, server::TcpServer};

/// A mock Modbus TCP device answering read-holding-register requests with
/// the canned payload `04 00 0A 00 14`, echoing transaction and unit ids.
/// Counts accepted connections.
async fn spawn_mock_device() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_clone = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            accepted_clone.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; 7];
                    if stream.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    let len = usize::from(u16::from_be_bytes([header[4], header[5]]));
                    let mut body = vec![0u8; len - 1];
                    if stream.read_exact(&mut body).await.is_err() {
                        break;
                    }
                    let rsp = [
                        header[0], header[1], // transaction id echoed
                        0x00, 0x00, // protocol id
                        0x00, 0x07, // length
                        header[6], // unit id echoed
                        0x03, 0x04, 0x00, 0x0A, 0x00, 0x14,
                    ];
                    if stream.write_all(&rsp).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, accepted)
}

struct Gateway {
    addr: SocketAddr,
    router: Arc<Router>,
    config: Arc<Config>,
    // Keeps the temp file alive for reloads.
    _config_file: NamedTempFile,
}

async fn start_gateway(config_yaml: &str, timeout_ms: u64) -> Gateway {
    let mut config_file = NamedTempFile::new().unwrap();
    config_file.write_all(config_yaml.as_bytes()).unwrap();
    config_file.flush().unwrap();

    let config = Config::load(config_file.path()).unwrap();
    let router = Arc::new(Router::new(Arc::clone(&config)));
    let server = TcpServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        timeout_ms,
        Arc::clone(&router),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.serve().await });

    Gateway {
        addr,
        router,
        config,
        _config_file: config_file,
    }
}

fn single_backend_config(backend_addr: SocketAddr, unit_id: u8, target_unit_id: u8) -> String {
    format!(
        r"
backends:
  - name: device
    protocol: tcp
    address: {backend_addr}
    timeout: 1000
unit_map:
  - unit_id: {unit_id}
    backend: device
    target_unit_id: {target_unit_id}
"
    )
}

async fn exchange(stream: &mut TcpStream, request: &[u8], response_len: usize) -> Vec<u8> {
    stream.write_all(request).await.unwrap();
    let mut response = vec![0u8; response_len];
    timeout(Duration::from_secs(2), stream.read_exact(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    response
}

#[tokio::test]
async fn forwards_read_holding_registers() {
    let (backend_addr, _) = spawn_mock_device().await;
    let gateway = start_gateway(&single_backend_config(backend_addr, 1, 1), 0).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    let response = exchange(
        &mut client,
        &[
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
        ],
        13,
    )
    .await;
    assert_eq!(
        response,
        [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]
    );
}

#[tokio::test]
async fn rewrites_unit_ids_in_flight() {
    let (backend_addr, _) = spawn_mock_device().await;
    // Client-facing unit 1 maps to unit 17 on the device.
    let gateway = start_gateway(&single_backend_config(backend_addr, 1, 17), 0).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    let response = exchange(
        &mut client,
        &[
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
        ],
        13,
    )
    .await;
    // The mock echoes the unit id it saw (17); the gateway must restore the
    // client's original unit id.
    assert_eq!(response[6], 0x01);
}

#[tokio::test]
async fn unknown_unit_id_yields_gateway_exception() {
    let (backend_addr, _) = spawn_mock_device().await;
    let gateway = start_gateway(&single_backend_config(backend_addr, 1, 1), 0).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    // Unit 0x63 has no mapping.
    let response = exchange(
        &mut client,
        &[
            0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x63, 0x03, 0x00, 0x00, 0x00, 0x01,
        ],
        9,
    )
    .await;
    assert_eq!(
        response,
        [0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x63, 0x83, 0x0B]
    );
}

#[tokio::test]
async fn dead_backend_yields_gateway_exception() {
    // Reserve an ephemeral port, then free it so connects are refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = listener.local_addr().unwrap();
    drop(listener);

    let gateway = start_gateway(&single_backend_config(backend_addr, 5, 5), 0).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    let response = exchange(
        &mut client,
        &[
            0x00, 0x03, 0x00, 0x00, 0x00, 0x06, 0x05, 0x04, 0x00, 0x10, 0x00, 0x02,
        ],
        9,
    )
    .await;
    assert_eq!(
        response,
        [0x00, 0x03, 0x00, 0x00, 0x00, 0x03, 0x05, 0x84, 0x0B]
    );
}

#[tokio::test]
async fn invalid_protocol_id_closes_connection() {
    let (backend_addr, _) = spawn_mock_device().await;
    let gateway = start_gateway(&single_backend_config(backend_addr, 1, 1), 0).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    // Protocol id 1 is not Modbus TCP.
    client
        .write_all(&[
            0x00, 0x04, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
        ])
        .await
        .unwrap();

    // No response; the gateway closes the connection.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("expected the connection to close")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn responses_are_written_in_request_order() {
    let (backend_addr, _) = spawn_mock_device().await;
    let gateway = start_gateway(&single_backend_config(backend_addr, 1, 1), 0).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    // Two back-to-back requests on the same connection.
    client
        .write_all(&[
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02, //
            0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x10, 0x00, 0x02,
        ])
        .await
        .unwrap();

    let mut responses = [0u8; 26];
    timeout(Duration::from_secs(2), client.read_exact(&mut responses))
        .await
        .expect("responses timed out")
        .unwrap();
    // First transaction id answered first.
    assert_eq!(&responses[0..2], &[0x00, 0x01]);
    assert_eq!(&responses[13..15], &[0x00, 0x02]);
}

#[tokio::test]
async fn reload_reconnects_lazily() {
    let (backend_addr, accepted) = spawn_mock_device().await;
    let gateway = start_gateway(&single_backend_config(backend_addr, 1, 1), 0).await;

    let request = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
    ];

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    exchange(&mut client, &request, 13).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    // Subsequent requests reuse the pooled backend connection.
    exchange(&mut client, &request, 13).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    gateway.config.reload().unwrap();
    gateway.router.reload().await;

    // The next request re-creates the backend with exactly one fresh
    // connection attempt.
    let response = exchange(&mut client, &request, 13).await;
    assert_eq!(&response[0..2], &[0x00, 0x01]);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_read_timeout_closes_idle_connection() {
    let (backend_addr, _) = spawn_mock_device().await;
    let gateway = start_gateway(&single_backend_config(backend_addr, 1, 1), 100).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    // Stay idle past the configured client read timeout.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("expected the idle connection to close")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn oversized_length_field_closes_connection() {
    let (backend_addr, _) = spawn_mock_device().await;
    let gateway = start_gateway(&single_backend_config(backend_addr, 1, 1), 0).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    // length - 1 + 7 > 260
    client
        .write_all(&[0x00, 0x05, 0x00, 0x00, 0x01, 0x00, 0x01])
        .await
        .unwrap();

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("expected the connection to close")
        .unwrap();
    assert_eq!(n, 0);
}
