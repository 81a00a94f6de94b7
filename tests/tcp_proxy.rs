// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Requests forwarded through the proxy to an upstream slave.

#![cfg(feature = "tcp-server")]

#[allow(unused)]
mod exception;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use mbap_stack::{prelude::*, ReadRegisters, RegisterValues, TableResolver};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::exception::{client_config, connect, init_logger, start_server, TestService};

async fn start_proxy(targets: Vec<ProxyTargetConfig>) -> anyhow::Result<(Proxy, SocketAddr)> {
    let proxy = Proxy::new(ProxyConfig {
        server: ServerConfig::new("127.0.0.1", 0),
        targets,
    })?;
    let addr = proxy.start().await?;
    Ok((proxy, addr))
}

#[tokio::test]
async fn forward_reads_and_writes() -> anyhow::Result<()> {
    init_logger();
    let service = RegisterMapService::new().with_registers(0x0010, &[0x0102, 0x0304]);
    let (slave, slave_addr) = start_server(service.clone()).await?;
    let (proxy, proxy_addr) =
        start_proxy(vec![ProxyTargetConfig::new(client_config(slave_addr))]).await?;

    let client = connect(proxy_addr).await?;
    let cancel = CancellationToken::new();
    let words = client.read_register_range(1, 0x0010, 2, &cancel).await??;
    assert_eq!(&words[..], &[0x01, 0x02, 0x03, 0x04]);

    client
        .write_multiple_registers(1, 0x0010, &[0xAAAA, 0xBBBB], &cancel)
        .await??;
    assert_eq!(service.get(0x0011), Some(0xBBBB));

    let exception = client
        .write_register(1, 0x0020, 1, &cancel)
        .await?
        .unwrap_err();
    assert_eq!(exception.exception(), ExceptionCode::IllegalDataAddress);

    proxy.stop().await;
    slave.stop().await;
    Ok(())
}

#[tokio::test]
async fn downstream_transaction_id_is_restored() -> anyhow::Result<()> {
    init_logger();
    let (slave, slave_addr) = start_server(TestService {}).await?;
    let (proxy, proxy_addr) =
        start_proxy(vec![ProxyTargetConfig::new(client_config(slave_addr))]).await?;

    let mut downstream = TcpStream::connect(proxy_addr).await?;
    downstream
        .write_all(&[0xBE, 0xEF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x07, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await?;
    let mut response = [0; 11];
    tokio::time::timeout(Duration::from_secs(5), downstream.read_exact(&mut response)).await??;
    assert_eq!(
        response,
        [0xBE, 0xEF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x07, 0x83, 0x05]
    );

    proxy.stop().await;
    slave.stop().await;
    Ok(())
}

#[tokio::test]
async fn unmatched_peer_is_refused() -> anyhow::Result<()> {
    init_logger();
    let (slave, slave_addr) = start_server(RegisterMapService::new()).await?;
    let target = ProxyTargetConfig::new(client_config(slave_addr))
        .with_source("10.0.0.0/8".parse()?);
    let (proxy, proxy_addr) = start_proxy(vec![target]).await?;

    let mut downstream = TcpStream::connect(proxy_addr).await?;
    let mut buf = [0; 1];
    let read =
        tokio::time::timeout(Duration::from_secs(5), downstream.read(&mut buf)).await?;
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(proxy.server().connection_count(), 0);

    proxy.stop().await;
    slave.stop().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_upstream_closes_downstream() -> anyhow::Result<()> {
    init_logger();
    // Bind and release a port so nothing listens on it
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let (proxy, proxy_addr) =
        start_proxy(vec![ProxyTargetConfig::new(client_config(unused))]).await?;

    let client = connect(proxy_addr).await?;
    let result = client
        .read_register_range(1, 0, 1, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(err) if err.is_transport()));

    proxy.stop().await;
    Ok(())
}

const VENDOR_READ: FunctionCode = FunctionCode::Custom(0x41);

fn vendor_factory() -> PacketFactory {
    let mut factory = PacketFactory::default();
    factory.add(
        TableResolver::default()
            .with(VENDOR_READ, Direction::Command, || {
                ReadRegisters::default().into()
            })
            .with(VENDOR_READ, Direction::Response, || {
                RegisterValues::default().into()
            }),
    );
    factory
}

#[tokio::test]
async fn forward_custom_function_code() -> anyhow::Result<()> {
    init_logger();
    let service = RegisterMapService::new().with_registers(0x0010, &[0x0102, 0x0304]);
    let slave_config = ServerConfig::new("127.0.0.1", 0);
    let slave_factory = SlaveConnectionFactory::with_factory(&slave_config, service, vendor_factory());
    let slave = Server::new(slave_config, Arc::new(slave_factory))?;
    let slave_addr = slave.start().await?;

    let proxy = Proxy::with_factory(
        ProxyConfig {
            server: ServerConfig::new("127.0.0.1", 0),
            targets: vec![ProxyTargetConfig::new(client_config(slave_addr))],
        },
        vendor_factory(),
    )?;
    let proxy_addr = proxy.start().await?;

    let client = Client::with_factory(client_config(proxy_addr), vendor_factory())?;
    let cancel = CancellationToken::new();
    client.connect(&cancel).await?;
    let tx = Mbap::new(0x0100, 0, 1, Pdu::new(VENDOR_READ, ReadRegisters::new(0x0010, 2)));
    let rx = client.transceive(&tx, &cancel).await?;
    assert_eq!(rx.transaction_id, 0x0100);
    let pdu = rx.pdu().unwrap();
    assert_eq!(pdu.function_code(), VENDOR_READ);
    assert_eq!(
        pdu.payload(),
        Some(&Packet::from(RegisterValues::from_words(&[0x0102, 0x0304])))
    );

    proxy.stop().await;
    slave.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_request_is_answered_locally() -> anyhow::Result<()> {
    init_logger();
    let service = RegisterMapService::new().with_registers(0x0010, &[0, 0]);
    let (slave, slave_addr) = start_server(service).await?;
    let (proxy, proxy_addr) =
        start_proxy(vec![ProxyTargetConfig::new(client_config(slave_addr))]).await?;

    let mut downstream = TcpStream::connect(proxy_addr).await?;
    // Byte count 3 doesn't match 2 registers
    downstream
        .write_all(&[
            0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x01, 0x10, 0x00, 0x10, 0x00, 0x02,
            0x03, 0xAB, 0xCD, 0xEF,
        ])
        .await?;
    let mut response = [0; 11];
    tokio::time::timeout(Duration::from_secs(5), downstream.read_exact(&mut response)).await??;
    assert_eq!(
        response,
        [0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x01, 0x90, 0x03]
    );

    proxy.stop().await;
    slave.stop().await;
    Ok(())
}
